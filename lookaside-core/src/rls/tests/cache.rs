use crate::keys::RequestKey;
use crate::rls::entry::Entry;
use crate::rls::tests::fixture;
use std::mem;
use std::time::Duration;
use tokio::time::{Instant, advance};

fn key(i: usize) -> RequestKey {
    // Same value length for every i < 10, so all entries are equal-sized.
    RequestKey::from_iter([("k".to_string(), format!("v{i}"))])
}

fn entry_size() -> usize {
    key(1).size() * 2 + mem::size_of::<Entry>()
}

#[tokio::test(start_paused = true)]
async fn size_tracks_sum_of_entries() {
    let fx = fixture().await;
    let core = fx.policy.core().clone();
    let es = entry_size();

    let mut locked = core.mu.lock();
    let now = Instant::now();
    for i in 1..=4 {
        locked.cache.find_or_insert(&core, &key(i), now);
        assert_eq!(locked.cache.size(), es * i);
        assert_eq!(locked.cache.len(), i);
    }
    // Re-inserting an existing key adds nothing.
    locked.cache.find_or_insert(&core, &key(1), now);
    assert_eq!(locked.cache.size(), es * 4);
}

#[tokio::test(start_paused = true)]
async fn lru_eviction_skips_entries_under_min_age() {
    let fx = fixture().await;
    let core = fx.policy.core().clone();
    let es = entry_size();

    {
        let mut locked = core.mu.lock();
        let now = Instant::now();
        locked.cache.resize(&core, es * 3, now);
        locked.cache.find_or_insert(&core, &key(1), now);
    }
    advance(Duration::from_secs(1)).await;
    {
        let mut locked = core.mu.lock();
        locked.cache.find_or_insert(&core, &key(2), Instant::now());
    }
    advance(Duration::from_secs(1)).await;
    {
        let mut locked = core.mu.lock();
        locked.cache.find_or_insert(&core, &key(3), Instant::now());
        assert_eq!(locked.cache.len(), 3);
        assert_eq!(locked.cache.size(), es * 3);
    }

    // At t0+6s the first entry is past its 5s floor and gets evicted to
    // make room; the second (created t0+1s) is exactly at its floor and
    // survives.
    advance(Duration::from_secs(4)).await;
    {
        let mut locked = core.mu.lock();
        locked.cache.find_or_insert(&core, &key(4), Instant::now());
        assert_eq!(locked.cache.len(), 3);
        assert_eq!(locked.cache.size(), es * 3);
        assert!(locked.cache.find(&key(1)).is_none());
        assert!(locked.cache.find(&key(2)).is_some());
        assert!(locked.cache.find(&key(3)).is_some());
        assert!(locked.cache.find(&key(4)).is_some());
    }
}

#[tokio::test(start_paused = true)]
async fn young_lru_head_blocks_eviction_and_size_overshoots() {
    let fx = fixture().await;
    let core = fx.policy.core().clone();
    let es = entry_size();

    let mut locked = core.mu.lock();
    let now = Instant::now();
    locked.cache.resize(&core, es * 3, now);
    for i in 1..=4 {
        locked.cache.find_or_insert(&core, &key(i), now);
    }
    // Nothing is old enough to evict; the cache temporarily exceeds its
    // limit rather than dropping fresh entries.
    assert_eq!(locked.cache.len(), 4);
    assert_eq!(locked.cache.size(), es * 4);
}

#[tokio::test(start_paused = true)]
async fn find_refreshes_lru_position() {
    let fx = fixture().await;
    let core = fx.policy.core().clone();
    let es = entry_size();

    {
        let mut locked = core.mu.lock();
        let now = Instant::now();
        locked.cache.resize(&core, es * 2, now);
        locked.cache.find_or_insert(&core, &key(1), now);
        locked.cache.find_or_insert(&core, &key(2), now);
        // Touch key 1 so key 2 becomes the LRU head.
        assert!(locked.cache.find(&key(1)).is_some());
    }
    advance(Duration::from_secs(6)).await;
    {
        let mut locked = core.mu.lock();
        locked.cache.find_or_insert(&core, &key(3), Instant::now());
        assert!(locked.cache.find(&key(1)).is_some());
        assert!(locked.cache.find(&key(2)).is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn resize_is_idempotent() {
    let fx = fixture().await;
    let core = fx.policy.core().clone();
    let es = entry_size();

    {
        let mut locked = core.mu.lock();
        let now = Instant::now();
        for i in 1..=4 {
            locked.cache.find_or_insert(&core, &key(i), now);
        }
    }
    advance(Duration::from_secs(6)).await;
    let mut locked = core.mu.lock();
    let now = Instant::now();
    locked.cache.resize(&core, es * 2, now);
    let (len, size) = (locked.cache.len(), locked.cache.size());
    assert_eq!(len, 2);
    locked.cache.resize(&core, es * 2, now);
    assert_eq!(locked.cache.len(), len);
    assert_eq!(locked.cache.size(), size);
}

#[tokio::test(start_paused = true)]
async fn sweep_removes_only_fully_expired_entries() {
    let fx = fixture().await;
    let core = fx.policy.core().clone();

    {
        let mut locked = core.mu.lock();
        let now = Instant::now();
        // Expired data, no backoff: reclaimable.
        let expired = locked.cache.find_or_insert(&core, &key(1), now);
        expired.data_expiration_time = Some(now + Duration::from_secs(1));
        // Still-valid data: kept.
        let valid = locked.cache.find_or_insert(&core, &key(2), now);
        valid.data_expiration_time = Some(now + Duration::from_secs(600));
        // Expired data but backoff window still open: kept.
        let backing_off = locked.cache.find_or_insert(&core, &key(3), now);
        backing_off.data_expiration_time = Some(now + Duration::from_secs(1));
        backing_off.backoff_expiration_time = Some(now + Duration::from_secs(600));
    }
    advance(Duration::from_secs(10)).await;
    {
        let mut locked = core.mu.lock();
        let now = Instant::now();
        locked.cache.sweep(&core, now);
        assert!(locked.cache.find(&key(1)).is_none());
        assert!(locked.cache.find(&key(2)).is_some());
        assert!(locked.cache.find(&key(3)).is_some());
    }
}
