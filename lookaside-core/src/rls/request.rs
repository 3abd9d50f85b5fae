use crate::conf::DEFAULT_LOOKUP_SERVICE_TIMEOUT;
use crate::keys::RequestKey;
use crate::rls::backoff::Backoff;
use crate::rls::channel::RlsChannel;
use crate::rls::policy::PolicyCore;
use crate::rls::proto::{LookupReason, RouteLookupRequest, TARGET_TYPE_GRPC};
use crate::status::Status;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of one lookup, normalized for the cache.
#[derive(Debug)]
pub(crate) struct ResponseInfo {
    pub status: Status,
    pub targets: Vec<String>,
    pub header_data: String,
}

impl ResponseInfo {
    fn failed(status: Status) -> Self {
        ResponseInfo {
            status,
            targets: Vec::new(),
            header_data: String::new(),
        }
    }
}

/// Handle for one in-flight lookup; at most one exists per key. Dropping it
/// aborts the call, so clearing the request map on shutdown cancels
/// everything outstanding. Cancelled lookups never touch the cache.
pub(crate) struct PendingRequest {
    task: AbortHandle,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Fires a lookup for `key` and installs the result into the cache on
/// completion. Called under the policy mutex; all the real work happens on a
/// spawned task and the serializer.
///
/// A stale refresh carries the entry's previous header data and continues
/// its backoff ladder, which travels through the request and back into the
/// entry on failure.
pub(crate) fn start_lookup(
    core: &Arc<PolicyCore>,
    channel: Arc<RlsChannel>,
    key: RequestKey,
    reason: LookupReason,
    stale_header_data: String,
    backoff_state: Option<Backoff>,
) -> PendingRequest {
    debug!(event = "lookup_started", key = %key, reason = ?reason);
    let timeout = core
        .config()
        .map(|c| c.route_lookup.lookup_service_timeout)
        .unwrap_or(DEFAULT_LOOKUP_SERVICE_TIMEOUT);
    let request = RouteLookupRequest {
        target_type: TARGET_TYPE_GRPC.to_string(),
        key_map: key.key_map().clone(),
        reason,
        stale_header_data,
    };
    let weak = Arc::downgrade(core);
    let task = tokio::spawn(async move {
        let outcome = tokio::time::timeout(timeout, channel.transport().route_lookup(request)).await;
        let response = match outcome {
            Err(_) => ResponseInfo::failed(Status::deadline_exceeded("RLS call timed out")),
            Ok(Err(status)) => ResponseInfo::failed(status),
            Ok(Ok(resp)) if resp.targets.is_empty() => {
                ResponseInfo::failed(Status::invalid_argument("RLS response has no target entry"))
            }
            Ok(Ok(resp)) => ResponseInfo {
                status: Status::ok(),
                targets: resp.targets,
                header_data: resp.header_data,
            },
        };
        let Some(core) = weak.upgrade() else {
            return;
        };
        let serializer = core.serializer.clone();
        serializer.schedule("lookup_complete", move || {
            complete_lookup(&core, &channel, &key, response, backoff_state);
        });
    });
    PendingRequest {
        task: task.abort_handle(),
    }
}

fn complete_lookup(
    core: &Arc<PolicyCore>,
    channel: &Arc<RlsChannel>,
    key: &RequestKey,
    response: ResponseInfo,
    backoff_state: Option<Backoff>,
) {
    debug!(
        event = "lookup_complete",
        key = %key,
        status = %response.status,
        targets = ?response.targets,
    );
    let now = Instant::now();
    let to_finish = {
        let mut locked = core.mu.lock();
        if locked.is_shutdown {
            return;
        }
        channel.report_response(response.status.is_ok(), now);
        let to_finish = locked
            .cache
            .on_rls_response(core, key, response, backoff_state, now);
        locked.request_map.remove(key);
        to_finish
    };
    // New wrappers finish their updates outside the mutex: creating the
    // delegate and pushing config into it calls back into the helper.
    for wrapper in to_finish {
        wrapper.maybe_finish_update();
    }
}
