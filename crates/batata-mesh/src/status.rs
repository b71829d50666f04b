//! In-memory diagnostics store
//!
//! Keeps the latest report for every (condition, key) pair so operators can
//! see proxies that connected without matching any service, endpoints whose
//! pod is not known yet, and similar soft failures.

use dashmap::DashMap;
use tracing::debug;

use crate::traits::{ProxyStatus, StatusReporter};

/// A single diagnostics entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub detail: String,
    /// Unix timestamp in milliseconds of the latest report
    pub reported_at: i64,
    /// How many times the condition was reported for this key
    pub count: u64,
}

/// Diagnostics store keyed by condition and proxy/hostname key
#[derive(Debug, Default)]
pub struct PushStatus {
    entries: DashMap<(ProxyStatus, String), StatusEntry>,
}

impl PushStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest entry for a condition and key
    pub fn get(&self, condition: ProxyStatus, key: &str) -> Option<StatusEntry> {
        self.entries
            .get(&(condition, key.to_string()))
            .map(|e| e.value().clone())
    }

    /// Whether `condition` was reported for `key`
    pub fn contains(&self, condition: ProxyStatus, key: &str) -> bool {
        self.entries.contains_key(&(condition, key.to_string()))
    }

    /// All keys currently reported under `condition`, sorted
    pub fn keys(&self, condition: ProxyStatus) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == condition)
            .map(|e| e.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Forget a key under every condition, e.g. when a proxy disconnects
    pub fn clear_key(&self, key: &str) {
        self.entries.retain(|(_, k), _| k != key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StatusReporter for PushStatus {
    fn report(&self, condition: ProxyStatus, key: &str, detail: &str) {
        let now = chrono::Utc::now().timestamp_millis();
        let mut entry = self
            .entries
            .entry((condition, key.to_string()))
            .or_insert_with(|| StatusEntry {
                detail: String::new(),
                reported_at: now,
                count: 0,
            });
        entry.detail = detail.to_string();
        entry.reported_at = now;
        entry.count += 1;

        debug!(condition = %condition, key = %key, "Recorded push status");
    }
}
