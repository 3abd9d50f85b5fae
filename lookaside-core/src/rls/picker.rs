use crate::balancer::{PickArgs, PickResult, Picker};
use crate::conf::RlsConfig;
use crate::rls::child::ChildPolicyWrapper;
use crate::rls::policy::PolicyCore;
use crate::rls::proto::LookupReason;
use crate::rls::request::start_lookup;
use crate::status::Status;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Data-path snapshot published to the channel.
///
/// Captures the config and the default-target wrapper at construction so a
/// pick never reads control-plane state that is mid-swap; everything else it
/// needs lives under the policy mutex.
pub(crate) struct RlsPicker {
    core: Arc<PolicyCore>,
    config: Arc<RlsConfig>,
    default_child: Option<Arc<ChildPolicyWrapper>>,
}

impl RlsPicker {
    pub fn new(
        core: Arc<PolicyCore>,
        config: Arc<RlsConfig>,
        default_child: Option<Arc<ChildPolicyWrapper>>,
    ) -> Self {
        RlsPicker {
            core,
            config,
            default_child,
        }
    }
}

impl Picker for RlsPicker {
    fn pick(&self, args: &mut PickArgs<'_>) -> PickResult {
        let key = match self.config.route_lookup.key_builder_map.build_key(
            args.path,
            args.authority,
            &*args.metadata,
        ) {
            Ok(Some(key)) => key,
            Ok(None) => {
                // No key builder claims this path, so no lookup applies.
                debug!(event = "pick_no_key_builder", path = args.path);
                if let Some(default) = &self.default_child {
                    return default.pick(args);
                }
                return PickResult::Fail(Status::unavailable(
                    "no key builder for request path",
                ));
            }
            Err(status) => return PickResult::Fail(status),
        };
        debug!(event = "pick", key = %key);
        let now = Instant::now();

        let mut guard = self.core.mu.lock();
        let locked = &mut *guard;
        if locked.is_shutdown {
            return PickResult::Fail(Status::unavailable("policy already shut down"));
        }

        let pending = locked.request_map.contains_key(&key);
        let mut entry = locked.cache.find(&key);
        let (stale_passed, backoff_passed, has_valid_data, in_backoff) = match entry.as_deref() {
            None => (true, true, false, false),
            Some(e) => (
                e.stale_time_passed(now),
                e.backoff_passed(now),
                e.has_valid_data(now),
                e.in_backoff(now),
            ),
        };

        // No entry, or an entry past its stale time and not backing off:
        // try to start a lookup, unless one is already pending for this key.
        if stale_passed && backoff_passed && !pending {
            let channel = locked.rls_channel.clone();
            if let Some(channel) = channel {
                if channel.should_throttle(now) {
                    if !has_valid_data {
                        // Nothing usable in the cache while throttled.
                        if let Some(default) = &self.default_child {
                            debug!(event = "pick_throttled_default", key = %key);
                            return default.pick(args);
                        }
                        debug!(event = "pick_throttled_fail", key = %key);
                        return PickResult::Fail(Status::unavailable("RLS request throttled"));
                    }
                } else {
                    // A refresh of still-valid data is a stale lookup and
                    // inherits the entry's header data and backoff ladder.
                    let (reason, stale_header_data, backoff_state) = match entry.as_deref_mut() {
                        Some(e) if has_valid_data => (
                            LookupReason::Stale,
                            e.header_data().to_string(),
                            e.take_backoff_state(),
                        ),
                        _ => (LookupReason::Miss, String::new(), None),
                    };
                    let request = start_lookup(
                        &self.core,
                        channel,
                        key.clone(),
                        reason,
                        stale_header_data,
                        backoff_state,
                    );
                    locked.request_map.insert(key.clone(), request);
                }
            }
        }

        match entry.as_deref() {
            Some(e) if has_valid_data => e.pick(args),
            Some(e) if in_backoff => {
                if let Some(default) = &self.default_child {
                    debug!(event = "pick_backoff_default", key = %key);
                    return default.pick(args);
                }
                debug!(event = "pick_backoff_fail", key = %key);
                PickResult::Fail(Status::unavailable(format!(
                    "RLS request failed: {}",
                    e.status()
                )))
            }
            _ => {
                debug!(event = "pick_queued", key = %key);
                PickResult::Queue
            }
        }
    }
}

impl Drop for RlsPicker {
    fn drop(&mut self) {
        // Wrapper teardown touches policy state, so the default wrapper
        // reference is handed back to the serializer instead of being
        // released from whatever thread drops the picker.
        if let Some(default) = self.default_child.take() {
            self.core
                .serializer
                .schedule("picker_release_default", move || drop(default));
        }
    }
}
