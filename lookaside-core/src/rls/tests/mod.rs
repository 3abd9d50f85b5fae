mod cache;
mod child;

use crate::balancer::{
    ChannelArgs, ChildPolicyBuilder, ChildPolicyConfig, ChildPolicyRegistry, ConnectivityState,
    LbPolicy, PickArgs, PickResult, Picker, PolicyHelper, PolicyUpdate, Subchannel,
    config_downcast,
};
use crate::conf::parse_config;
use crate::metadata::Metadata;
use crate::rls::proto::{
    LookupTransport, LookupTransportFactory, RouteLookupRequest, RouteLookupResponse,
};
use crate::rls::{PolicyArgs, RlsPolicy, UpdateArgs};
use crate::status::Status;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Notify, watch};

pub(crate) const TEST_TARGET_FIELD: &str = "targetName";

/// Channel-side helper that records everything the policy publishes.
pub(crate) struct TestHelper {
    updates: Mutex<Vec<(ConnectivityState, Status, Arc<dyn Picker>)>>,
}

impl TestHelper {
    pub fn new() -> Arc<Self> {
        Arc::new(TestHelper {
            updates: Mutex::new(Vec::new()),
        })
    }

    pub fn picker_count(&self) -> usize {
        self.updates.lock().len()
    }

    pub fn latest_picker(&self) -> Arc<dyn Picker> {
        let updates = self.updates.lock();
        match updates.last() {
            Some((_, _, picker)) => picker.clone(),
            None => panic!("no picker published yet"),
        }
    }

    pub fn latest_state(&self) -> Option<(ConnectivityState, Status)> {
        let updates = self.updates.lock();
        updates.last().map(|(s, st, _)| (*s, st.clone()))
    }
}

impl PolicyHelper for TestHelper {
    fn create_subchannel(&self, address: &str, _args: &ChannelArgs) -> Arc<dyn Subchannel> {
        Arc::new(TestSubchannel {
            address: address.to_string(),
        })
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        self.updates.lock().push((state, status, picker));
    }

    fn request_reresolution(&self) {}

    fn authority(&self) -> String {
        "test-authority".to_string()
    }
}

#[derive(Debug)]
pub(crate) struct TestSubchannel {
    #[allow(dead_code)]
    pub address: String,
}

impl Subchannel for TestSubchannel {}

/// In-process lookup service with scripted replies. A lookup with no reply
/// queued parks until one arrives, like a slow server.
pub(crate) struct TestTransport {
    replies: Mutex<VecDeque<Result<RouteLookupResponse, Status>>>,
    requests: Mutex<Vec<RouteLookupRequest>>,
    conn_tx: watch::Sender<ConnectivityState>,
    wakeup: Notify,
}

impl TestTransport {
    pub fn new() -> Arc<Self> {
        let (conn_tx, _) = watch::channel(ConnectivityState::Idle);
        Arc::new(TestTransport {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            conn_tx,
            wakeup: Notify::new(),
        })
    }

    pub fn enqueue_reply(&self, reply: Result<RouteLookupResponse, Status>) {
        self.replies.lock().push_back(reply);
        self.wakeup.notify_waiters();
    }

    pub fn requests(&self) -> Vec<RouteLookupRequest> {
        self.requests.lock().clone()
    }

    pub fn set_connectivity(&self, state: ConnectivityState) {
        let _ = self.conn_tx.send(state);
    }
}

#[async_trait]
impl LookupTransport for TestTransport {
    async fn route_lookup(
        &self,
        request: RouteLookupRequest,
    ) -> Result<RouteLookupResponse, Status> {
        self.requests.lock().push(request);
        loop {
            let notified = self.wakeup.notified();
            if let Some(reply) = self.replies.lock().pop_front() {
                return reply;
            }
            notified.await;
        }
    }

    fn connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.conn_tx.subscribe()
    }
}

pub(crate) struct TestTransportFactory {
    transport: Arc<TestTransport>,
    pub created: Mutex<Vec<String>>,
}

impl TestTransportFactory {
    pub fn new(transport: Arc<TestTransport>) -> Arc<Self> {
        Arc::new(TestTransportFactory {
            transport,
            created: Mutex::new(Vec::new()),
        })
    }
}

impl LookupTransportFactory for TestTransportFactory {
    fn create_transport(
        &self,
        lookup_service: &str,
        _service_config: Option<&serde_json::Value>,
        _authority: &str,
    ) -> Arc<dyn LookupTransport> {
        self.created.lock().push(lookup_service.to_string());
        self.transport.clone()
    }
}

/// Remote control for stub children: lets tests publish arbitrary states
/// through each child's helper and records every delegated pick.
#[derive(Default)]
pub(crate) struct ChildControl {
    helpers: Mutex<HashMap<String, Arc<dyn PolicyHelper>>>,
    picks: Mutex<Vec<String>>,
}

impl ChildControl {
    pub fn new() -> Arc<Self> {
        Arc::new(ChildControl::default())
    }

    pub fn publish(self: &Arc<Self>, target: &str, state: ConnectivityState) {
        let helper = {
            let helpers = self.helpers.lock();
            match helpers.get(target) {
                Some(h) => h.clone(),
                None => panic!("no child built for target {target}"),
            }
        };
        let status = if state == ConnectivityState::TransientFailure {
            Status::unavailable("stubbed failure")
        } else {
            Status::ok()
        };
        let picker = Arc::new(TargetPicker {
            target: target.to_string(),
            control: self.clone(),
        });
        helper.update_state(state, status, picker);
    }

    pub fn has_child(&self, target: &str) -> bool {
        self.helpers.lock().contains_key(target)
    }

    pub fn take_picks(&self) -> Vec<String> {
        std::mem::take(&mut self.picks.lock())
    }
}

struct TargetPicker {
    target: String,
    control: Arc<ChildControl>,
}

impl Picker for TargetPicker {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        self.control.picks.lock().push(self.target.clone());
        PickResult::Pick(Arc::new(TestSubchannel {
            address: self.target.clone(),
        }))
    }
}

#[derive(Debug)]
struct StubChildConfig {
    target: String,
}

impl ChildPolicyConfig for StubChildConfig {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) struct StubChildBuilder {
    control: Arc<ChildControl>,
}

impl StubChildBuilder {
    pub fn new(control: Arc<ChildControl>) -> Arc<Self> {
        Arc::new(StubChildBuilder { control })
    }
}

impl ChildPolicyBuilder for StubChildBuilder {
    fn name(&self) -> &'static str {
        "stub_child"
    }

    fn parse_config(
        &self,
        config: &serde_json::Value,
    ) -> Result<Arc<dyn ChildPolicyConfig>, Status> {
        let target = config
            .get(TEST_TARGET_FIELD)
            .and_then(|t| t.as_str())
            .ok_or_else(|| Status::invalid_argument("missing target field"))?;
        if let Some(rejected) = config.get("rejectTarget").and_then(|v| v.as_str())
            && rejected == target
        {
            return Err(Status::invalid_argument("config rejected by stub"));
        }
        Ok(Arc::new(StubChildConfig {
            target: target.to_string(),
        }))
    }

    fn build(&self, helper: Arc<dyn PolicyHelper>) -> Box<dyn LbPolicy> {
        Box::new(StubChild {
            helper,
            control: self.control.clone(),
        })
    }
}

/// Child policy that reports READY for its target as soon as it sees config.
struct StubChild {
    helper: Arc<dyn PolicyHelper>,
    control: Arc<ChildControl>,
}

impl LbPolicy for StubChild {
    fn update(&mut self, update: PolicyUpdate) -> Result<(), Status> {
        let Some(config) = config_downcast::<StubChildConfig>(update.config.as_ref()) else {
            return Err(Status::internal("unexpected config type"));
        };
        self.control
            .helpers
            .lock()
            .insert(config.target.clone(), self.helper.clone());
        let picker = Arc::new(TargetPicker {
            target: config.target.clone(),
            control: self.control.clone(),
        });
        self.helper
            .update_state(ConnectivityState::Ready, Status::ok(), picker);
        Ok(())
    }
}

pub(crate) struct Fixture {
    pub helper: Arc<TestHelper>,
    pub transport: Arc<TestTransport>,
    pub factory: Arc<TestTransportFactory>,
    pub control: Arc<ChildControl>,
    pub registry: Arc<ChildPolicyRegistry>,
    pub policy: RlsPolicy,
}

pub(crate) fn base_config_json() -> serde_json::Value {
    json!({
        "routeLookupConfig": {
            "grpcKeybuilders": [{
                "names": [{"service": "svc.S", "method": "M"}],
                "extraKeys": {"host": "h"}
            }],
            "lookupService": "fake:///lookup",
            "maxAge": "60s",
            "cacheSizeBytes": 1048576
        },
        "childPolicyConfigTargetFieldName": TEST_TARGET_FIELD,
        "childPolicy": [{"stub_child": {}}]
    })
}

pub(crate) async fn fixture() -> Fixture {
    fixture_with(base_config_json()).await
}

pub(crate) async fn fixture_with(config_json: serde_json::Value) -> Fixture {
    let helper = TestHelper::new();
    let transport = TestTransport::new();
    let factory = TestTransportFactory::new(transport.clone());
    let control = ChildControl::new();
    let mut registry = ChildPolicyRegistry::new();
    registry.register(StubChildBuilder::new(control.clone()));
    let registry = Arc::new(registry);

    let policy = RlsPolicy::new(PolicyArgs {
        helper: helper.clone(),
        registry: registry.clone(),
        transport_factory: factory.clone(),
    });
    update_policy(&policy, &registry, config_json).await;
    Fixture {
        helper,
        transport,
        factory,
        control,
        registry,
        policy,
    }
}

pub(crate) async fn update_policy(
    policy: &RlsPolicy,
    registry: &ChildPolicyRegistry,
    config_json: serde_json::Value,
) {
    let config = match parse_config(&config_json, registry) {
        Ok(c) => c,
        Err(e) => panic!("test config failed to parse: {e}"),
    };
    policy.update(UpdateArgs {
        config,
        addresses: Vec::new(),
        channel_args: ChannelArgs::new(),
    });
    policy.flush().await;
}

/// Runs a pick against the latest published picker.
pub(crate) fn do_pick(fixture: &Fixture, path: &str, authority: &str) -> (PickResult, Metadata) {
    let picker = fixture.helper.latest_picker();
    let mut metadata = Metadata::new();
    let result = picker.pick(&mut PickArgs {
        path,
        authority,
        metadata: &mut metadata,
    });
    (result, metadata)
}

/// Polls `condition` while letting spawned tasks make progress.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
