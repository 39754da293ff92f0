//! Process-wide keyed storage.
//!
//! Agent configurations, the knowledge file list, and the per-thread RAG
//! history all live here as JSON documents, each read and written as a
//! whole. Writers are last-writer-wins; there is no locking beyond what
//! SQLite provides per statement.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::{RagError, RagResult};

/// String-keyed document storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Raw JSON text stored under `key`, if any.
    async fn get_raw(&self, key: &str) -> RagResult<Option<String>>;

    /// Store raw JSON text under `key`, replacing any previous value.
    async fn put_raw(&self, key: &str, value: &str) -> RagResult<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> RagResult<()>;
}

/// Read and deserialize the document under `key`.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> RagResult<Option<T>> {
    match store.get_raw(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and store `value` under `key`.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> RagResult<()> {
    let raw = serde_json::to_string(value)?;
    store.put_raw(key, &raw).await
}

// ============ SQLite ============

/// Keyed storage backed by the `kv_store` table.
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    /// Wrap a pool whose schema has already been migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn get_raw(&self, key: &str) -> RagResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put_raw(&self, key: &str, value: &str) -> RagResult<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> RagResult<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============ In-memory ============

/// Keyed storage held in a `HashMap`, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> RagError {
    RagError::Storage("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get_raw(&self, key: &str) -> RagResult<Option<String>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn put_raw(&self, key: &str, value: &str) -> RagResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> RagResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.remove(key);
        Ok(())
    }
}
