use crate::balancer::ConnectivityState;
use crate::conf::RlsConfig;
use crate::rls::policy::PolicyCore;
use crate::rls::proto::LookupTransport;
use crate::rls::throttle::Throttle;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// The policy's connection to its lookup service.
///
/// Owns the transport and the request throttle, and watches the transport's
/// connectivity: a TRANSIENT_FAILURE → READY transition resets every cache
/// entry's backoff, since the outage was penalized at the channel level and
/// entries must not compound it.
///
/// When the configured lookup service changes the policy creates a fresh
/// channel; lookups already in flight keep the old one alive until they
/// complete.
pub(crate) struct RlsChannel {
    transport: Arc<dyn LookupTransport>,
    throttle: Mutex<Throttle>,
    watcher: AbortHandle,
}

impl RlsChannel {
    pub fn new(core: &Arc<PolicyCore>, config: &RlsConfig) -> Arc<Self> {
        let transport = core.transport_factory.create_transport(
            &config.route_lookup.lookup_service,
            config.rls_channel_service_config.as_ref(),
            &core.helper.authority(),
        );
        info!(
            event = "lookup_channel_created",
            lookup_service = %config.route_lookup.lookup_service,
        );
        let watcher = spawn_connectivity_watcher(core, &transport);
        Arc::new(RlsChannel {
            transport,
            throttle: Mutex::new(Throttle::new()),
            watcher,
        })
    }

    pub fn transport(&self) -> Arc<dyn LookupTransport> {
        self.transport.clone()
    }

    pub fn should_throttle(&self, now: Instant) -> bool {
        self.throttle.lock().should_throttle(now)
    }

    pub fn report_response(&self, success: bool, now: Instant) {
        self.throttle.lock().register_response(success, now);
    }

    pub fn reset_backoff(&self) {
        self.transport.reset_backoff();
    }

    /// Stops the connectivity watch. Called when the channel is replaced or
    /// the policy shuts down; in-flight lookups may still hold the channel.
    pub fn shutdown(&self) {
        self.watcher.abort();
    }

    #[cfg(test)]
    pub(crate) fn force_throttle(&self, on: bool) {
        self.throttle.lock().forced = Some(on);
    }
}

impl Drop for RlsChannel {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

fn spawn_connectivity_watcher(
    core: &Arc<PolicyCore>,
    transport: &Arc<dyn LookupTransport>,
) -> AbortHandle {
    let mut rx = transport.connectivity();
    let weak = Arc::downgrade(core);
    let task = tokio::spawn(async move {
        let mut was_transient_failure = *rx.borrow() == ConnectivityState::TransientFailure;
        while rx.changed().await.is_ok() {
            let state = *rx.borrow();
            debug!(event = "lookup_channel_state", state = %state);
            let Some(core) = weak.upgrade() else {
                break;
            };
            if state == ConnectivityState::Ready && was_transient_failure {
                was_transient_failure = false;
                let serializer = core.serializer.clone();
                serializer.schedule("lookup_channel_recovered", move || {
                    {
                        let mut locked = core.mu.lock();
                        if locked.is_shutdown {
                            return;
                        }
                        locked.cache.reset_all_backoff();
                    }
                    core.update_picker_async();
                });
            } else if state == ConnectivityState::TransientFailure {
                was_transient_failure = true;
            }
        }
    });
    task.abort_handle()
}
