// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use super::StorageBackend;
use crate::errors::StoreError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;

/// Durable backend: one SQLite table per namespace, keyed lexically so
/// `ORDER BY key` matches time order for time-keyed namespaces.
///
/// The namespace is validated (ASCII alphanumerics, `_`, `-`) before it
/// reaches this type, which is what makes interpolating the table name
/// into SQL safe; keys and values are always bound parameters.
pub(crate) struct SqliteBackend {
    pool: SqlitePool,
    table: String,
}

impl SqliteBackend {
    pub(crate) async fn open(path: &Path, namespace: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let table = format!("ns_{namespace}");
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (key TEXT PRIMARY KEY, value BLOB NOT NULL)"#
        ))
        .execute(&pool)
        .await?;

        Ok(SqliteBackend { pool, table })
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"INSERT INTO "{}" (key, value) VALUES (?1, ?2)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value"#,
            self.table
        ))
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query(&format!(
            r#"SELECT value FROM "{}" WHERE key = ?1"#,
            self.table
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<Vec<u8>, _>(0)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query(&format!(r#"DELETE FROM "{}" WHERE key = ?1"#, self.table))
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let row = sqlx::query(&format!(r#"SELECT COUNT(*) FROM "{}""#, self.table))
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as usize)
    }

    async fn first_key(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(&format!(
            r#"SELECT key FROM "{}" ORDER BY key LIMIT 1"#,
            self.table
        ))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>(0)?)),
            None => Ok(None),
        }
    }

    async fn keys_in(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let rows = match (start, end) {
            (Some(start), Some(end)) => {
                sqlx::query(&format!(
                    r#"SELECT key FROM "{}" WHERE key >= ?1 AND key < ?2 ORDER BY key"#,
                    self.table
                ))
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(start), None) => {
                sqlx::query(&format!(
                    r#"SELECT key FROM "{}" WHERE key >= ?1 ORDER BY key"#,
                    self.table
                ))
                .bind(start)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(end)) => {
                sqlx::query(&format!(
                    r#"SELECT key FROM "{}" WHERE key < ?1 ORDER BY key"#,
                    self.table
                ))
                .bind(end)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query(&format!(r#"SELECT key FROM "{}" ORDER BY key"#, self.table))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            keys.push(row.try_get::<String, _>(0)?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_survive_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.db");

        {
            let backend = SqliteBackend::open(&path, "prefs").await.unwrap();
            backend.put("theme", b"\"dark\"").await.unwrap();
        }

        let backend = SqliteBackend::open(&path, "prefs").await.unwrap();
        assert_eq!(
            backend.get("theme").await.unwrap(),
            Some(b"\"dark\"".to_vec())
        );
    }

    #[tokio::test]
    async fn namespaces_are_isolated_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.db");

        let a = SqliteBackend::open(&path, "alpha").await.unwrap();
        let b = SqliteBackend::open(&path, "beta").await.unwrap();
        a.put("k", b"1").await.unwrap();

        assert_eq!(a.len().await.unwrap(), 1);
        assert_eq!(b.len().await.unwrap(), 0);
        assert_eq!(b.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_come_back_in_lexical_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.db");
        let backend = SqliteBackend::open(&path, "ticks").await.unwrap();

        for key in ["c", "a", "b"] {
            backend.put(key, b"1").await.unwrap();
        }
        assert_eq!(
            backend.keys_in(None, None).await.unwrap(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(backend.first_key().await.unwrap(), Some("a".to_string()));
        assert_eq!(
            backend.keys_in(Some("a"), Some("c")).await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
