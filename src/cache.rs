//! Last-seen bookkeeping per label combination.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Label tuple -> last update time, for one metric.
///
/// Each evictable metric owns its own cache; entries are only ever created
/// by [`touch`](Self::touch) and removed by [`sweep`](Self::sweep) or
/// [`clear`](Self::clear). The map is sharded, so producers touching
/// different tuples do not contend and a sweep only ever holds one shard.
#[derive(Debug, Default)]
pub struct CardinalityCache {
    entries: DashMap<Vec<String>, i64>,
}

impl CardinalityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self, values: &[String], now_millis: i64) {
        if let Some(mut last_seen) = self.entries.get_mut(values) {
            *last_seen = (*last_seen).max(now_millis);
            return;
        }
        self.entries
            .entry(values.to_vec())
            .and_modify(|last_seen| *last_seen = (*last_seen).max(now_millis))
            .or_insert(now_millis);
    }

    pub fn last_seen(&self, values: &[String]) -> Option<i64> {
        self.entries.get(values).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Evict every entry last seen strictly before `cutoff_millis`.
    ///
    /// Candidates are gathered shard by shard, then each one is re-checked
    /// and removed under its own shard lock together with the `evict`
    /// callback. A tuple touched after the scan survives, and a touch that
    /// lands after the removal recreates both the entry and its series.
    pub fn sweep<F>(&self, cutoff_millis: i64, mut evict: F) -> usize
    where
        F: FnMut(&[String]),
    {
        let candidates: Vec<Vec<String>> = self
            .entries
            .iter()
            .filter(|entry| *entry.value() < cutoff_millis)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            let removed = self.entries.remove_if(&key, |key, last_seen| {
                if *last_seen < cutoff_millis {
                    evict(key);
                    true
                } else {
                    false
                }
            });
            if removed.is_some() {
                evicted += 1;
                tracing::debug!(labels = ?key, "evicted idle label set");
            }
        }
        evicted
    }
}
