// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Persistent namespaced key/value store with time-ordered append mode
//! and paced replay.
//!
//! A [`Store`] owns one namespace in one of three backends: volatile
//! memory, SQLite, or a hybrid that keeps reads in memory while SQLite
//! holds the durable copy. Keys are either caller-supplied
//! ([`KeyMode::Explicit`]) or monotonic zero-padded epoch-millisecond
//! strings ([`KeyMode::Time`]), so lexical key order is insertion-time
//! order and ranges need no extra index.

mod hybrid;
mod memory;
mod sqlite;

use crate::config::{StorageConfig, StorageKind};
use crate::errors::{StoreError, StreamError, ValidationError};
use crate::observability::messages::{OldestEvicted, StructuredLog};
use crate::utils::locked;
use crate::Value;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hybrid::HybridBackend;
use memory::MemoryBackend;
use sqlite::SqliteBackend;
use std::sync::Mutex;
use std::time::Duration;

/// How keys are assigned within a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Callers supply keys; `append` is unsupported.
    Explicit,
    /// The store mints monotonic time keys; `append` is the natural
    /// write and arrival order is preserved lexically.
    Time,
}

/// What a time-keyed store does with a raw mapping write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MappingPolicy {
    /// Refuse it: mixing caller keys into a time log corrupts ordering.
    #[default]
    Reject,
    /// Record the whole mapping as a single time-keyed value.
    Append,
}

/// One write against a store, as produced by table bridges.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Upsert { key: String, value: Value },
    Append { value: Value },
    BulkUpdate { mapping: serde_json::Map<String, Value> },
}

/// Storage backend seam. Values are opaque JSON bytes; key ranges are
/// half-open `[start, end)` in lexical order.
#[async_trait]
pub(crate) trait StorageBackend: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn len(&self) -> Result<usize, StoreError>;
    async fn first_key(&self) -> Result<Option<String>, StoreError>;
    async fn keys_in(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<String>, StoreError>;

    /// Pushes buffered writes to the durable layer, where one exists.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// One namespace of persistent state.
pub struct Store {
    namespace: String,
    mode: KeyMode,
    policy: MappingPolicy,
    max_size: Option<usize>,
    backend: Box<dyn StorageBackend>,
    /// Last minted time key, so keys stay strictly increasing even when
    /// several appends land in the same millisecond.
    clock: Mutex<i64>,
}

fn validate_name(name: &str) -> Result<(), StreamError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidName { name: name.into() }.into())
    }
}

impl Store {
    /// Opens a namespace against the configured backend.
    pub async fn open(
        config: &StorageConfig,
        namespace: &str,
        mode: KeyMode,
        policy: MappingPolicy,
    ) -> Result<Store, StreamError> {
        validate_name(namespace)?;
        let backend: Box<dyn StorageBackend> = match config.kind {
            StorageKind::Memory => Box::new(MemoryBackend::new()),
            StorageKind::File => {
                let path = config.path.as_deref().ok_or(ValidationError::InvalidName {
                    name: "<missing storage path>".into(),
                })?;
                Box::new(SqliteBackend::open(path, namespace).await?)
            }
            StorageKind::Hybrid => {
                let path = config.path.as_deref().ok_or(ValidationError::InvalidName {
                    name: "<missing storage path>".into(),
                })?;
                let autosave = config.autosave_secs.map(Duration::from_secs);
                Box::new(HybridBackend::open(path, namespace, autosave).await?)
            }
        };
        Ok(Store {
            namespace: namespace.to_string(),
            mode,
            policy,
            max_size: config.max_size,
            backend,
            clock: Mutex::new(0),
        })
    }

    /// Volatile store, mostly for pipelines that only need session state.
    pub fn in_memory(namespace: &str, mode: KeyMode) -> Store {
        Store {
            namespace: namespace.to_string(),
            mode,
            policy: MappingPolicy::default(),
            max_size: None,
            backend: Box::new(MemoryBackend::new()),
            clock: Mutex::new(0),
        }
    }

    pub fn with_policy(mut self, policy: MappingPolicy) -> Store {
        self.policy = policy;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Store {
        self.max_size = Some(max_size);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    /// Applies one write according to the namespace's key mode and
    /// mapping policy.
    pub async fn write(&self, op: WriteOp) -> Result<(), StreamError> {
        match op {
            WriteOp::Upsert { key, value } => {
                self.upsert(&key, &value).await?;
            }
            WriteOp::Append { value } => {
                self.append(&value).await?;
            }
            WriteOp::BulkUpdate { mapping } => match (self.mode, self.policy) {
                (KeyMode::Explicit, _) => {
                    for (key, value) in &mapping {
                        self.upsert(key, value).await?;
                    }
                }
                (KeyMode::Time, MappingPolicy::Reject) => {
                    return Err(StoreError::MappingRejected.into());
                }
                (KeyMode::Time, MappingPolicy::Append) => {
                    self.append(&Value::Object(mapping)).await?;
                }
            },
        }
        Ok(())
    }

    pub async fn upsert(&self, key: &str, value: &Value) -> Result<(), StreamError> {
        let bytes = serde_json::to_vec(value).map_err(StoreError::from)?;
        self.put_bounded(key, &bytes).await?;
        Ok(())
    }

    /// Records a value under a fresh time key and returns that key.
    pub async fn append(&self, value: &Value) -> Result<String, StreamError> {
        if self.mode != KeyMode::Time {
            return Err(StoreError::AppendUnsupported.into());
        }
        let key = self.next_time_key();
        let bytes = serde_json::to_vec(value).map_err(StoreError::from)?;
        self.put_bounded(&key, &bytes).await?;
        Ok(key)
    }

    /// Records a value under an explicit timestamp instead of "now".
    /// Later plain appends keep minting keys past this one.
    pub async fn append_at(
        &self,
        at: DateTime<Utc>,
        value: &Value,
    ) -> Result<String, StreamError> {
        if self.mode != KeyMode::Time {
            return Err(StoreError::AppendUnsupported.into());
        }
        let ms = at.timestamp_millis();
        {
            let mut clock = locked(&self.clock);
            *clock = (*clock).max(ms);
        }
        let key = format!("{ms:020}");
        let bytes = serde_json::to_vec(value).map_err(StoreError::from)?;
        self.put_bounded(&key, &bytes).await?;
        Ok(key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StreamError> {
        match self.backend.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), StreamError> {
        self.backend.delete(key).await?;
        Ok(())
    }

    pub async fn len(&self) -> Result<usize, StreamError> {
        Ok(self.backend.len().await?)
    }

    /// Records in `[start, end)`, lexical key order. `None` leaves that
    /// side unbounded.
    pub async fn range(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<(String, Value)>, StreamError> {
        let keys = self.backend.keys_in(start, end).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key).await? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// Replays `[start, end)` one record at a time, sleeping `interval`
    /// between records when given. The key list is snapshotted up front;
    /// values are fetched lazily, so records deleted mid-replay are
    /// skipped rather than resurrected.
    pub async fn replay(
        &self,
        start: Option<&str>,
        end: Option<&str>,
        interval: Option<Duration>,
    ) -> Result<Replay<'_>, StreamError> {
        let keys = self.backend.keys_in(start, end).await?;
        Ok(Replay {
            store: self,
            keys,
            pos: 0,
            emitted: false,
            interval,
        })
    }

    pub async fn flush(&self) -> Result<(), StreamError> {
        self.backend.flush().await?;
        Ok(())
    }

    fn next_time_key(&self) -> String {
        let mut clock = locked(&self.clock);
        let next = Utc::now().timestamp_millis().max(*clock + 1);
        *clock = next;
        format!("{next:020}")
    }

    /// Put that honours `max_size` by evicting oldest-first until the
    /// write fits. `CapacityExceeded` never escapes this method.
    async fn put_bounded(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        loop {
            match self.try_put(key, bytes).await {
                Err(StoreError::CapacityExceeded) => {
                    match self.backend.first_key().await? {
                        Some(oldest) => {
                            self.backend.delete(&oldest).await?;
                            OldestEvicted {
                                namespace: &self.namespace,
                                evicted_key: &oldest,
                            }
                            .log();
                        }
                        // max_size of zero: nothing to evict, drop the write.
                        None => return Ok(()),
                    }
                }
                other => return other,
            }
        }
    }

    async fn try_put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(max) = self.max_size {
            if self.backend.len().await? >= max && self.backend.get(key).await?.is_none() {
                return Err(StoreError::CapacityExceeded);
            }
        }
        self.backend.put(key, bytes).await
    }
}

/// Cursor over a snapshot of keys, paced by an optional interval.
pub struct Replay<'a> {
    store: &'a Store,
    keys: Vec<String>,
    pos: usize,
    emitted: bool,
    interval: Option<Duration>,
}

impl Replay<'_> {
    /// The next surviving record, or `None` at the end of the range.
    pub async fn next(&mut self) -> Result<Option<(String, Value)>, StreamError> {
        while self.pos < self.keys.len() {
            let key = self.keys[self.pos].clone();
            self.pos += 1;
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            if self.emitted {
                if let Some(interval) = self.interval {
                    tokio::time::sleep(interval).await;
                }
            }
            self.emitted = true;
            return Ok(Some((key, value)));
        }
        Ok(None)
    }

    /// Restarts the replay from the beginning of its snapshot.
    pub fn rewind(&mut self) {
        self.pos = 0;
        self.emitted = false;
    }

    pub fn remaining(&self) -> usize {
        self.keys.len().saturating_sub(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn explicit_store_round_trips_and_deletes() {
        let store = Store::in_memory("prefs", KeyMode::Explicit);
        store.upsert("theme", &json!("dark")).await.unwrap();
        store.upsert("theme", &json!("light")).await.unwrap();
        assert_eq!(store.get("theme").await.unwrap(), Some(json!("light")));

        store.delete("theme").await.unwrap();
        assert_eq!(store.get("theme").await.unwrap(), None);
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn append_is_refused_on_explicit_stores() {
        let store = Store::in_memory("prefs", KeyMode::Explicit);
        let result = store.append(&json!(1)).await;
        assert!(matches!(
            result,
            Err(StreamError::Store(StoreError::AppendUnsupported))
        ));
    }

    #[tokio::test]
    async fn time_keys_are_strictly_increasing_and_zero_padded() {
        let store = Store::in_memory("ticks", KeyMode::Time);
        let mut keys = Vec::new();
        for i in 0..5 {
            keys.push(store.append(&json!(i)).await.unwrap());
        }
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(keys.iter().all(|key| key.len() == 20));
    }

    #[tokio::test]
    async fn append_at_backfills_and_keeps_later_keys_monotonic() {
        let store = Store::in_memory("ticks", KeyMode::Time);
        let at = Utc::now() - chrono::Duration::seconds(60);
        let old_key = store.append_at(at, &json!("backfill")).await.unwrap();
        let new_key = store.append(&json!("live")).await.unwrap();

        assert_eq!(old_key, format!("{:020}", at.timestamp_millis()));
        assert!(old_key < new_key);
        assert_eq!(store.get(&old_key).await.unwrap(), Some(json!("backfill")));
    }

    #[tokio::test]
    async fn time_store_rejects_raw_mappings_by_default() {
        let store = Store::in_memory("ticks", KeyMode::Time);
        let mapping = match json!({"a": 1}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let result = store.write(WriteOp::BulkUpdate { mapping }).await;
        assert!(matches!(
            result,
            Err(StreamError::Store(StoreError::MappingRejected))
        ));
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn append_policy_records_the_mapping_as_one_value() {
        let store = Store::in_memory("ticks", KeyMode::Time).with_policy(MappingPolicy::Append);
        let mapping = match json!({"a": 1, "b": 2}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        store.write(WriteOp::BulkUpdate { mapping }).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
        let all = store.range(None, None).await.unwrap();
        assert_eq!(all[0].1, json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn max_size_evicts_oldest_first() {
        let store = Store::in_memory("ticks", KeyMode::Time).with_max_size(3);
        for i in 0..5 {
            store.append(&json!(i)).await.unwrap();
        }
        assert_eq!(store.len().await.unwrap(), 3);
        let values: Vec<Value> = store
            .range(None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, value)| value)
            .collect();
        assert_eq!(values, vec![json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn overwriting_an_existing_key_never_evicts() {
        let store = Store::in_memory("prefs", KeyMode::Explicit).with_max_size(2);
        store.upsert("a", &json!(1)).await.unwrap();
        store.upsert("b", &json!(2)).await.unwrap();
        store.upsert("a", &json!(3)).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 2);
        assert_eq!(store.get("a").await.unwrap(), Some(json!(3)));
        assert_eq!(store.get("b").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn replay_range_excludes_the_end_key() {
        let store = Store::in_memory("ticks", KeyMode::Time);
        let mut keys = Vec::new();
        for i in 0..4 {
            keys.push(store.append(&json!(i)).await.unwrap());
        }

        let mut replay = store
            .replay(Some(&keys[1]), Some(&keys[3]), None)
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some((key, value)) = replay.next().await.unwrap() {
            seen.push((key, value));
        }
        assert_eq!(
            seen,
            vec![(keys[1].clone(), json!(1)), (keys[2].clone(), json!(2))]
        );
    }

    #[tokio::test]
    async fn paced_replay_waits_the_interval_between_records() {
        let store = Store::in_memory("ticks", KeyMode::Time);
        for i in 0..3 {
            store.append(&json!(i)).await.unwrap();
        }

        let mut replay = store
            .replay(None, None, Some(Duration::from_millis(30)))
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let mut seen = Vec::new();
        while let Some((_, value)) = replay.next().await.unwrap() {
            seen.push(value);
        }
        // Two gaps between three records.
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(seen, vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn replay_rewind_restarts_the_snapshot() {
        let store = Store::in_memory("ticks", KeyMode::Time);
        for i in 0..3 {
            store.append(&json!(i)).await.unwrap();
        }
        let mut replay = store.replay(None, None, None).await.unwrap();
        while replay.next().await.unwrap().is_some() {}
        replay.rewind();
        let first = replay.next().await.unwrap();
        assert_eq!(first.map(|(_, value)| value), Some(json!(0)));
    }

    #[tokio::test]
    async fn invalid_namespace_is_rejected() {
        let config = StorageConfig::default();
        let result = Store::open(
            &config,
            "bad name; drop table",
            KeyMode::Explicit,
            MappingPolicy::Reject,
        )
        .await;
        assert!(matches!(
            result,
            Err(StreamError::Validation(ValidationError::InvalidName { .. }))
        ));
    }
}
