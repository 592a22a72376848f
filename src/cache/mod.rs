// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Bounded per-stream history cache.
//!
//! Every stream can retain a sliding view of the values that flowed
//! through it, bounded by count and/or age. Both bounds are enforced on
//! insertion, so reads never observe entries past either limit.

use crate::Value;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

/// Retention bounds for a stream's history.
///
/// `None` for a bound means that bound does not apply; with both `None`
/// the cache grows without limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheConfig {
    pub max_len: Option<usize>,
    pub max_age: Option<Duration>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    at: DateTime<Utc>,
    value: Value,
}

/// Insertion-ordered value history with count and age bounds.
#[derive(Debug)]
pub struct BoundedCache {
    config: CacheConfig,
    entries: VecDeque<CacheEntry>,
}

impl BoundedCache {
    pub fn new(config: CacheConfig) -> Self {
        BoundedCache {
            config,
            entries: VecDeque::new(),
        }
    }

    /// Records a value, evicting whatever the bounds no longer admit.
    pub fn insert(&mut self, value: Value) {
        self.insert_at(Utc::now(), value);
    }

    fn insert_at(&mut self, at: DateTime<Utc>, value: Value) {
        self.entries.push_back(CacheEntry { at, value });
        self.prune(at);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        // A max_age past the calendar's range admits everything.
        if let Some(cutoff) = self.config.max_age.and_then(|max_age| {
            chrono::Duration::from_std(max_age)
                .ok()
                .and_then(|delta| now.checked_sub_signed(delta))
        }) {
            while matches!(self.entries.front(), Some(entry) if entry.at < cutoff) {
                self.entries.pop_front();
            }
        }
        if let Some(max_len) = self.config.max_len {
            while self.entries.len() > max_len {
                self.entries.pop_front();
            }
        }
    }

    /// The `n` most recent values, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Value> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries
            .iter()
            .skip(skip)
            .map(|entry| entry.value.clone())
            .collect()
    }

    /// Values no older than `age`, oldest first. An `age` past the
    /// calendar's range matches everything.
    pub fn recent_within(&self, age: Duration) -> Vec<Value> {
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|delta| Utc::now().checked_sub_signed(delta));
        let Some(cutoff) = cutoff else {
            return self.snapshot();
        };
        self.entries
            .iter()
            .filter(|entry| entry.at >= cutoff)
            .map(|entry| entry.value.clone())
            .collect()
    }

    /// Everything currently retained, oldest first.
    pub fn snapshot(&self) -> Vec<Value> {
        self.entries.iter().map(|entry| entry.value.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn count_bound_keeps_only_the_newest() {
        let mut cache = BoundedCache::new(CacheConfig {
            max_len: Some(3),
            max_age: None,
        });
        for i in 0..5 {
            cache.insert(json!(i));
        }
        assert_eq!(cache.snapshot(), vec![json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn age_bound_drops_stale_entries_on_insert() {
        let mut cache = BoundedCache::new(CacheConfig {
            max_len: None,
            max_age: Some(Duration::from_secs(60)),
        });
        let now = Utc::now();
        cache.insert_at(now - chrono::Duration::seconds(120), json!("stale"));
        cache.insert_at(now, json!("fresh"));
        assert_eq!(cache.snapshot(), vec![json!("fresh")]);
    }

    #[test]
    fn recent_within_filters_by_entry_age() {
        let mut cache = BoundedCache::new(CacheConfig::default());
        let now = Utc::now();
        cache.insert_at(now - chrono::Duration::seconds(120), json!("old"));
        cache.insert_at(now - chrono::Duration::seconds(90), json!("older"));
        cache.insert_at(now, json!("new"));

        assert_eq!(cache.recent_within(Duration::from_secs(60)), vec![json!("new")]);
        assert_eq!(cache.recent_within(Duration::from_secs(600)).len(), 3);
    }

    #[test]
    fn recent_within_is_empty_when_every_entry_has_aged_out() {
        let mut cache = BoundedCache::new(CacheConfig::default());
        let now = Utc::now();
        cache.insert_at(now - chrono::Duration::seconds(300), json!(1));
        cache.insert_at(now - chrono::Duration::seconds(200), json!(2));
        assert!(cache.recent_within(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn extreme_ages_match_everything_instead_of_panicking() {
        let mut cache = BoundedCache::new(CacheConfig {
            max_len: None,
            max_age: Some(Duration::MAX),
        });
        cache.insert(json!("kept"));
        cache.insert(json!("also kept"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.recent_within(Duration::MAX).len(), 2);
    }

    #[test]
    fn recent_returns_a_suffix_in_insertion_order() {
        let mut cache = BoundedCache::new(CacheConfig::default());
        for i in 0..4 {
            cache.insert(json!(i));
        }
        assert_eq!(cache.recent(2), vec![json!(2), json!(3)]);
        assert_eq!(cache.recent(10).len(), 4);
    }

    #[test]
    fn unbounded_cache_retains_everything() {
        let mut cache = BoundedCache::new(CacheConfig::default());
        for i in 0..100 {
            cache.insert(json!(i));
        }
        assert_eq!(cache.len(), 100);
    }
}
