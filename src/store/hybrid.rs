// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use super::sqlite::SqliteBackend;
use super::StorageBackend;
use crate::errors::StoreError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct HybridState {
    /// Complete in-memory copy of the namespace; all reads hit this.
    cache: BTreeMap<String, Vec<u8>>,
    /// Writes not yet in SQLite: `Some` pending put, `None` pending delete.
    dirty: BTreeMap<String, Option<Vec<u8>>>,
}

/// Memory-fast, SQLite-durable backend.
///
/// Without an autosave interval every write goes through to SQLite
/// before the cache is touched. With one, writes only mark the cache
/// dirty and a background task drains the dirty set each interval;
/// a crash can lose at most one interval of writes.
pub(crate) struct HybridBackend {
    durable: Arc<SqliteBackend>,
    state: Arc<Mutex<HybridState>>,
    write_through: bool,
}

impl HybridBackend {
    pub(crate) async fn open(
        path: &Path,
        namespace: &str,
        autosave: Option<Duration>,
    ) -> Result<Self, StoreError> {
        let durable = Arc::new(SqliteBackend::open(path, namespace).await?);

        let mut cache = BTreeMap::new();
        for key in durable.keys_in(None, None).await? {
            if let Some(value) = durable.get(&key).await? {
                cache.insert(key, value);
            }
        }
        let state = Arc::new(Mutex::new(HybridState {
            cache,
            dirty: BTreeMap::new(),
        }));

        if let Some(interval) = autosave {
            let weak_state = Arc::downgrade(&state);
            let durable = durable.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(state) = weak_state.upgrade() else { break };
                    if let Err(err) = drain_dirty(&durable, &state).await {
                        tracing::warn!(error = %err, "autosave flush failed; will retry");
                    }
                }
            });
        }

        Ok(HybridBackend {
            durable,
            state,
            write_through: autosave.is_none(),
        })
    }
}

/// Applies pending writes to SQLite. Entries that fail go back on the
/// dirty set so the next flush retries them.
async fn drain_dirty(
    durable: &SqliteBackend,
    state: &Mutex<HybridState>,
) -> Result<(), StoreError> {
    let pending = std::mem::take(&mut state.lock().await.dirty);
    let mut first_error = None;
    for (key, entry) in pending {
        let result = match &entry {
            Some(bytes) => durable.put(&key, bytes).await,
            None => durable.delete(&key).await,
        };
        if let Err(err) = result {
            state.lock().await.dirty.entry(key).or_insert(entry);
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[async_trait]
impl StorageBackend for HybridBackend {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if self.write_through {
            self.durable.put(key, value).await?;
        }
        let mut state = self.state.lock().await;
        state.cache.insert(key.to_string(), value.to_vec());
        if !self.write_through {
            state.dirty.insert(key.to_string(), Some(value.to_vec()));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.state.lock().await.cache.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.write_through {
            self.durable.delete(key).await?;
        }
        let mut state = self.state.lock().await;
        state.cache.remove(key);
        if !self.write_through {
            state.dirty.insert(key.to_string(), None);
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.state.lock().await.cache.len())
    }

    async fn first_key(&self) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().await.cache.keys().next().cloned())
    }

    async fn keys_in(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let lower: Bound<&str> = start.map_or(Bound::Unbounded, Bound::Included);
        let upper: Bound<&str> = end.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(self
            .state
            .lock()
            .await
            .cache
            .range::<str, _>((lower, upper))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        drain_dirty(&self.durable, &self.state).await
    }
}
