pub mod child;
pub mod lookup_service;
pub mod tracing;

use lookaside_core::balancer::{
    ChannelArgs, ChildPolicyRegistry, ConnectivityState, PickArgs, PickResult, Picker,
    PolicyHelper, Subchannel,
};
use lookaside_core::conf::parse_config;
use lookaside_core::metadata::Metadata;
use lookaside_core::rls::{PolicyArgs, RlsPolicy, UpdateArgs};
use lookaside_core::status::Status;
use std::sync::{Arc, Mutex};

pub use child::{ChildControl, RecordingChildBuilder, TARGET_FIELD};
pub use lookup_service::{FakeLookupService, FakeLookupServiceFactory};
pub use self::tracing::init_test_tracing;

/// Channel stand-in: records every state/picker publication.
pub struct RecordingHelper {
    updates: Mutex<Vec<(ConnectivityState, Status, Arc<dyn Picker>)>>,
}

impl RecordingHelper {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingHelper {
            updates: Mutex::new(Vec::new()),
        })
    }

    pub fn latest_picker(&self) -> Option<Arc<dyn Picker>> {
        let updates = self.updates.lock().unwrap();
        updates.last().map(|(_, _, p)| p.clone())
    }

    pub fn latest_state(&self) -> Option<(ConnectivityState, Status)> {
        let updates = self.updates.lock().unwrap();
        updates.last().map(|(s, st, _)| (*s, st.clone()))
    }

    pub fn publications(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

impl PolicyHelper for RecordingHelper {
    fn create_subchannel(&self, address: &str, _args: &ChannelArgs) -> Arc<dyn Subchannel> {
        Arc::new(NamedSubchannel {
            address: address.to_string(),
        })
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        self.updates.lock().unwrap().push((state, status, picker));
    }

    fn request_reresolution(&self) {}

    fn authority(&self) -> String {
        "harness.example.com".to_string()
    }
}

#[derive(Debug)]
pub struct NamedSubchannel {
    pub address: String,
}

impl Subchannel for NamedSubchannel {}

/// A fully wired policy with fake collaborators.
pub struct TestBed {
    pub helper: Arc<RecordingHelper>,
    pub lookup: Arc<FakeLookupService>,
    pub children: Arc<ChildControl>,
    pub registry: Arc<ChildPolicyRegistry>,
    pub policy: RlsPolicy,
}

impl TestBed {
    pub async fn start(config: serde_json::Value) -> anyhow::Result<TestBed> {
        init_test_tracing();
        let helper = RecordingHelper::new();
        let lookup = FakeLookupService::new();
        let children = ChildControl::new();
        let mut registry = ChildPolicyRegistry::new();
        registry.register(RecordingChildBuilder::new(children.clone()));
        let registry = Arc::new(registry);

        let policy = RlsPolicy::new(PolicyArgs {
            helper: helper.clone(),
            registry: registry.clone(),
            transport_factory: FakeLookupServiceFactory::new(lookup.clone()),
        });
        let bed = TestBed {
            helper,
            lookup,
            children,
            registry,
            policy,
        };
        bed.reconfigure(config).await?;
        Ok(bed)
    }

    pub async fn reconfigure(&self, config: serde_json::Value) -> anyhow::Result<()> {
        let config = parse_config(&config, &self.registry)?;
        self.policy.update(UpdateArgs {
            config,
            addresses: Vec::new(),
            channel_args: ChannelArgs::new(),
        });
        self.policy.flush().await;
        Ok(())
    }

    /// Runs a pick through the most recently published picker.
    pub fn pick(&self, path: &str, authority: &str) -> (PickResult, Metadata) {
        self.pick_with_metadata(path, authority, Metadata::new())
    }

    pub fn pick_with_metadata(
        &self,
        path: &str,
        authority: &str,
        mut metadata: Metadata,
    ) -> (PickResult, Metadata) {
        let picker = self
            .helper
            .latest_picker()
            .expect("policy has not published a picker yet");
        let result = picker.pick(&mut PickArgs {
            path,
            authority,
            metadata: &mut metadata,
        });
        (result, metadata)
    }

    /// Polls `condition` while giving the policy's background tasks a
    /// chance to run.
    pub async fn wait_for(&self, mut condition: impl FnMut(&TestBed) -> bool) {
        for _ in 0..1000 {
            if condition(self) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }
}
