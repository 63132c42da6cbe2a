//! Protocol statistics.
//!
//! Counters are named with dot-separated paths ("vote.replay",
//! "message.bad_magic") and registered lazily on first touch, so call sites
//! never have to agree on a central list. Bumping an existing counter is a
//! read-lock plus one relaxed atomic add; the write lock is only taken the
//! first time a name appears.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Thread-safe named counters.
#[derive(Default)]
pub struct StatsCounter {
    counters: RwLock<HashMap<&'static str, AtomicU64>>,
}

impl StatsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump `name` by one.
    pub fn increment(&self, name: &'static str) {
        self.add(name, 1);
    }

    /// Bump `name` by `value`, registering the counter if needed.
    pub fn add(&self, name: &'static str, value: u64) {
        if let Some(counter) = self.counters.read().unwrap().get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .unwrap()
            .entry(name)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Current value of `name`; zero when the counter has never been touched.
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .unwrap()
            .get(name)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Every counter touched so far, sorted by name for stable reporting.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let counters = self.counters.read().unwrap();
        let mut entries: Vec<(&'static str, u64)> = counters
            .iter()
            .map(|(name, counter)| (*name, counter.load(Ordering::Relaxed)))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}
