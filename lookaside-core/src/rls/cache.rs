use crate::keys::RequestKey;
use crate::rls::backoff::Backoff;
use crate::rls::child::ChildPolicyWrapper;
use crate::rls::entry::Entry;
use crate::rls::policy::PolicyCore;
use crate::rls::request::ResponseInfo;
use crate::status::Status;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

pub(crate) const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Byte-bounded LRU of lookup results, guarded by the policy mutex.
///
/// Recency is tracked with a monotonically increasing use sequence: the map
/// entry holds its current sequence and `lru` orders keys by it, so the
/// least recently used key is always the first in `lru`. Each entry is
/// accounted as twice its key size (key stored in both indexes) plus the
/// fixed entry overhead.
pub(crate) struct Cache {
    size_limit: usize,
    size: usize,
    map: HashMap<RequestKey, Entry>,
    lru: BTreeMap<u64, RequestKey>,
    next_seq: u64,
    cleanup_task: Option<AbortHandle>,
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            size_limit: 0,
            size: 0,
            map: HashMap::new(),
            lru: BTreeMap::new(),
            next_seq: 0,
            cleanup_task: None,
        }
    }

    pub fn set_cleanup_task(&mut self, task: AbortHandle) {
        self.cleanup_task = Some(task);
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    fn entry_size(key: &RequestKey) -> usize {
        key.size() * 2 + mem::size_of::<Entry>()
    }

    fn mark_used(&mut self, key: &RequestKey) {
        let Some(entry) = self.map.get_mut(key) else {
            return;
        };
        self.lru.remove(&entry.lru_seq);
        entry.lru_seq = self.next_seq;
        self.next_seq += 1;
        self.lru.insert(entry.lru_seq, key.clone());
    }

    /// Looks up an entry, marking it as most recently used.
    pub fn find(&mut self, key: &RequestKey) -> Option<&mut Entry> {
        if !self.map.contains_key(key) {
            return None;
        }
        self.mark_used(key);
        self.map.get_mut(key)
    }

    /// Looks up an entry, creating it if absent. Creation first makes room
    /// by evicting from the LRU end, then charges the new entry's size.
    pub fn find_or_insert(
        &mut self,
        core: &Arc<PolicyCore>,
        key: &RequestKey,
        now: Instant,
    ) -> &mut Entry {
        if self.map.contains_key(key) {
            self.mark_used(key);
        } else {
            let entry_size = Self::entry_size(key);
            self.shrink_to(core, self.size_limit.saturating_sub(entry_size), now);
            let seq = self.next_seq;
            self.next_seq += 1;
            self.lru.insert(seq, key.clone());
            self.map.insert(key.clone(), Entry::new(now, seq));
            self.size += entry_size;
            debug!(event = "cache_entry_added", key = %key, size = self.size);
        }
        match self.map.get_mut(key) {
            Some(entry) => entry,
            None => unreachable!("entry inserted above"),
        }
    }

    pub fn resize(&mut self, core: &Arc<PolicyCore>, size_limit: usize, now: Instant) {
        debug!(event = "cache_resize", size_limit);
        self.size_limit = size_limit;
        self.shrink_to(core, size_limit, now);
    }

    pub fn reset_all_backoff(&mut self) {
        for entry in self.map.values_mut() {
            entry.reset_backoff();
        }
    }

    /// Removes entries whose data and backoff windows have both expired.
    pub fn sweep(&mut self, core: &Arc<PolicyCore>, now: Instant) {
        let expired: Vec<RequestKey> = self
            .map
            .iter()
            .filter(|(_, e)| e.should_remove(now) && e.can_evict(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            debug!(event = "cache_entry_expired", key = %key);
            self.evict(core, &key);
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(task) = self.cleanup_task.take() {
            task.abort();
        }
        self.map.clear();
        self.lru.clear();
        self.size = 0;
    }

    /// Evicts LRU-first until the cache fits in `bytes`, stopping at the
    /// first entry still under its minimum age.
    fn shrink_to(&mut self, core: &Arc<PolicyCore>, bytes: usize, now: Instant) {
        while self.size > bytes {
            let Some((_, key)) = self.lru.iter().next() else {
                break;
            };
            let key = key.clone();
            let can_evict = match self.map.get(&key) {
                Some(entry) => entry.can_evict(now),
                None => unreachable!("lru and map are updated together"),
            };
            if !can_evict {
                break;
            }
            debug!(event = "cache_lru_eviction", key = %key);
            self.evict(core, &key);
        }
    }

    fn evict(&mut self, core: &Arc<PolicyCore>, key: &RequestKey) {
        if let Some(entry) = self.map.remove(key) {
            self.size -= Self::entry_size(key);
            self.lru.remove(&entry.lru_seq);
            // Queued picks may be waiting out this entry's backoff.
            if entry.backoff_timer.is_some() {
                core.update_picker_async();
            }
        }
    }

    /// Applies a lookup result to the key's entry.
    ///
    /// Returns newly created child wrappers; the caller finishes their
    /// updates after releasing the policy mutex.
    pub fn on_rls_response(
        &mut self,
        core: &Arc<PolicyCore>,
        key: &RequestKey,
        response: ResponseInfo,
        backoff_state: Option<Backoff>,
        now: Instant,
    ) -> Vec<Arc<ChildPolicyWrapper>> {
        let config = core.config();
        let entry = self.find_or_insert(core, key, now);

        if !response.status.is_ok() {
            entry.status = response.status;
            let mut backoff = backoff_state.unwrap_or_else(Backoff::for_cache_entry);
            let backoff_time = backoff.next_attempt_time(now);
            entry.backoff_state = Some(backoff);
            entry.backoff_time = Some(backoff_time);
            entry.backoff_expiration_time = Some(now + (backoff_time - now) * 2);
            entry.arm_backoff_timer(core, backoff_time);
            core.update_picker_async();
            return Vec::new();
        }

        let Some(config) = config else {
            return Vec::new();
        };
        entry.status = Status::ok();
        entry.header_data = response.header_data;
        entry.data_expiration_time = Some(now + config.route_lookup.max_age);
        entry.stale_time = Some(now + config.route_lookup.stale_age);
        entry.backoff_state = None;
        entry.backoff_time = None;
        entry.backoff_expiration_time = None;
        if let Some(timer) = entry.backoff_timer.take() {
            timer.abort();
        }

        let targets_changed = entry.wrappers.len() != response.targets.len()
            || entry
                .wrappers
                .iter()
                .zip(&response.targets)
                .any(|(w, t)| w.target() != t.as_str());
        if !targets_changed {
            // Same target list; publish a picker so queued picks re-run
            // against the refreshed entry.
            core.update_picker_async();
            return Vec::new();
        }

        let old_targets: HashSet<String> = entry
            .wrappers
            .iter()
            .map(|w| w.target().to_string())
            .collect();
        let mut update_picker = false;
        let mut to_finish = Vec::new();
        let mut new_wrappers = Vec::with_capacity(response.targets.len());
        {
            let mut roster = core.children.lock();
            for target in &response.targets {
                match roster.get_live(target) {
                    Some(existing) => {
                        // An existing wrapper newly adopted by this entry
                        // will not publish any state change of its own, so
                        // force a picker refresh.
                        if !old_targets.contains(target) {
                            update_picker = true;
                        }
                        new_wrappers.push(existing);
                    }
                    None => {
                        let wrapper = roster.create(core, target);
                        wrapper.start_update();
                        to_finish.push(wrapper.clone());
                        new_wrappers.push(wrapper);
                    }
                }
            }
        }
        entry.wrappers = new_wrappers;
        if update_picker {
            core.update_picker_async();
        }
        to_finish
    }
}
