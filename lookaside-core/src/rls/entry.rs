use crate::balancer::{ConnectivityState, PickArgs, PickResult};
use crate::rls::RLS_HEADER_NAME;
use crate::rls::backoff::Backoff;
use crate::rls::child::ChildPolicyWrapper;
use crate::rls::policy::PolicyCore;
use crate::status::Status;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

/// Floor below which an entry cannot be evicted by size pressure.
pub(crate) const MIN_EXPIRATION: Duration = Duration::from_secs(5);

/// Cached lookup state for one request key.
///
/// Absent timestamps mean "infinitely in the past": a fresh entry has no
/// data and no backoff. The picker reads these under the policy mutex.
pub(crate) struct Entry {
    pub(super) status: Status,
    pub(super) backoff_state: Option<Backoff>,
    pub(super) backoff_time: Option<Instant>,
    pub(super) backoff_expiration_time: Option<Instant>,
    pub(super) backoff_timer: Option<AbortHandle>,
    pub(super) wrappers: Vec<Arc<ChildPolicyWrapper>>,
    pub(super) header_data: String,
    pub(super) data_expiration_time: Option<Instant>,
    pub(super) stale_time: Option<Instant>,
    pub(super) min_expiration_time: Instant,
    pub(super) lru_seq: u64,
}

impl Entry {
    pub(super) fn new(now: Instant, lru_seq: u64) -> Self {
        Entry {
            status: Status::ok(),
            backoff_state: None,
            backoff_time: None,
            backoff_expiration_time: None,
            backoff_timer: None,
            wrappers: Vec::new(),
            header_data: String::new(),
            data_expiration_time: None,
            stale_time: None,
            min_expiration_time: now + MIN_EXPIRATION,
            lru_seq,
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn header_data(&self) -> &str {
        &self.header_data
    }

    pub fn has_valid_data(&self, now: Instant) -> bool {
        self.data_expiration_time.is_some_and(|t| t >= now)
    }

    /// True once the stale time has passed (or never existed).
    pub fn stale_time_passed(&self, now: Instant) -> bool {
        self.stale_time.is_none_or(|t| t < now)
    }

    /// True while a failed lookup is backing off.
    pub fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_time.is_some_and(|t| t >= now)
    }

    pub fn backoff_passed(&self, now: Instant) -> bool {
        !self.in_backoff(now)
    }

    /// Both the data and any backoff window have fully expired; the cleanup
    /// sweep reclaims such entries.
    pub fn should_remove(&self, now: Instant) -> bool {
        self.data_expiration_time.is_none_or(|t| t < now)
            && self.backoff_expiration_time.is_none_or(|t| t < now)
    }

    /// Size pressure may only evict entries older than the minimum age.
    pub fn can_evict(&self, now: Instant) -> bool {
        self.min_expiration_time < now
    }

    pub fn take_backoff_state(&mut self) -> Option<Backoff> {
        self.backoff_state.take()
    }

    pub(super) fn reset_backoff(&mut self) {
        self.backoff_time = None;
        if let Some(timer) = self.backoff_timer.take() {
            timer.abort();
        }
    }

    /// Routes a pick through this entry's targets.
    ///
    /// Targets in TRANSIENT_FAILURE are skipped unless every target is; the
    /// last target always gets the pick, since its delegate may still be
    /// able to complete it. Header data rides along either way.
    pub fn pick(&self, args: &mut PickArgs<'_>) -> PickResult {
        let mut chosen = None;
        for (i, wrapper) in self.wrappers.iter().enumerate() {
            let state = wrapper.connectivity_state();
            if state == ConnectivityState::TransientFailure && i + 1 < self.wrappers.len() {
                debug!(
                    event = "target_skipped",
                    target = wrapper.target(),
                    position = i,
                );
                continue;
            }
            debug!(
                event = "target_selected",
                target = wrapper.target(),
                state = %state,
                position = i,
            );
            chosen = Some(wrapper);
            break;
        }
        let Some(wrapper) = chosen else {
            return PickResult::Queue;
        };
        if !self.header_data.is_empty() {
            args.metadata.add(RLS_HEADER_NAME, &self.header_data);
        }
        wrapper.pick(args)
    }

    /// Arms (or re-arms) the backoff timer. When it fires, a fresh picker is
    /// published so queued picks get a new decision.
    pub(super) fn arm_backoff_timer(&mut self, core: &Arc<PolicyCore>, at: Instant) {
        if let Some(timer) = self.backoff_timer.take() {
            timer.abort();
        }
        let weak = Arc::downgrade(core);
        let task = tokio::spawn(async move {
            sleep_until(at).await;
            if let Some(core) = weak.upgrade() {
                core.update_picker_async();
            }
        });
        self.backoff_timer = Some(task.abort_handle());
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        if let Some(timer) = self.backoff_timer.take() {
            timer.abort();
        }
    }
}
