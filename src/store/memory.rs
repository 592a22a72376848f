// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use super::StorageBackend;
use crate::errors::StoreError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use tokio::sync::Mutex;

/// Volatile backend; the `BTreeMap` gives lexical key order for free.
pub(crate) struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        MemoryBackend {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.lock().await.len())
    }

    async fn first_key(&self) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.keys().next().cloned())
    }

    async fn keys_in(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let lower: Bound<&str> = start.map_or(Bound::Unbounded, Bound::Included);
        let upper: Bound<&str> = end.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(self
            .entries
            .lock()
            .await
            .range::<str, _>((lower, upper))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
