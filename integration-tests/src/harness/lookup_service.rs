use async_trait::async_trait;
use lookaside_core::balancer::ConnectivityState;
use lookaside_core::rls::proto::{
    LookupTransport, LookupTransportFactory, RouteLookupRequest, RouteLookupResponse,
};
use lookaside_core::status::Status;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, watch};

/// In-process route lookup service with scripted replies.
///
/// A lookup finding no scripted reply parks until one is enqueued, which is
/// how the tests model a server that has not answered yet.
pub struct FakeLookupService {
    replies: Mutex<VecDeque<Result<RouteLookupResponse, Status>>>,
    requests: Mutex<Vec<RouteLookupRequest>>,
    conn_tx: watch::Sender<ConnectivityState>,
    wakeup: Notify,
}

impl FakeLookupService {
    pub fn new() -> Arc<Self> {
        let (conn_tx, _) = watch::channel(ConnectivityState::Idle);
        Arc::new(FakeLookupService {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            conn_tx,
            wakeup: Notify::new(),
        })
    }

    pub fn respond_with_targets(&self, targets: &[&str], header_data: &str) {
        self.respond(Ok(RouteLookupResponse {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            header_data: header_data.to_string(),
        }));
    }

    pub fn respond(&self, reply: Result<RouteLookupResponse, Status>) {
        self.replies.lock().unwrap().push_back(reply);
        self.wakeup.notify_waiters();
    }

    pub fn requests(&self) -> Vec<RouteLookupRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn set_connectivity(&self, state: ConnectivityState) {
        let _ = self.conn_tx.send(state);
    }
}

#[async_trait]
impl LookupTransport for FakeLookupService {
    async fn route_lookup(
        &self,
        request: RouteLookupRequest,
    ) -> Result<RouteLookupResponse, Status> {
        self.requests.lock().unwrap().push(request);
        loop {
            let notified = self.wakeup.notified();
            if let Some(reply) = self.replies.lock().unwrap().pop_front() {
                return reply;
            }
            notified.await;
        }
    }

    fn connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.conn_tx.subscribe()
    }
}

/// Hands every created channel the same fake service and remembers which
/// lookup-service URIs the policy asked for.
pub struct FakeLookupServiceFactory {
    service: Arc<FakeLookupService>,
    pub created_for: Mutex<Vec<String>>,
}

impl FakeLookupServiceFactory {
    pub fn new(service: Arc<FakeLookupService>) -> Arc<Self> {
        Arc::new(FakeLookupServiceFactory {
            service,
            created_for: Mutex::new(Vec::new()),
        })
    }
}

impl LookupTransportFactory for FakeLookupServiceFactory {
    fn create_transport(
        &self,
        lookup_service: &str,
        _service_config: Option<&serde_json::Value>,
        _authority: &str,
    ) -> Arc<dyn LookupTransport> {
        self.created_for
            .lock()
            .unwrap()
            .push(lookup_service.to_string());
        self.service.clone()
    }
}
