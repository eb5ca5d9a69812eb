//! Persistent key-value store capability
//!
//! The store is the single source of truth for engine records; the in-memory
//! queues are caches reconciled against it. Keys are flat strings namespaced
//! by record type and chain, values are JSON-serialized records.

pub mod pg;

pub use pg::PgStore;

use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Key-value persistence with prefix scan
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> EngineResult<()>;
    async fn delete(&self, key: &str) -> EngineResult<()>;
    /// All (key, value) pairs whose key starts with `prefix`, in key order
    async fn scan_prefix(&self, prefix: &str) -> EngineResult<Vec<(String, Vec<u8>)>>;
}

/// Serialize a record for storage
pub fn encode<T: serde::Serialize>(value: &T) -> EngineResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| EngineError::Internal(e.to_string()))
}

/// Deserialize a stored record, surfacing corruption with its key
pub fn decode<T: serde::de::DeserializeOwned>(key: &str, bytes: &[u8]) -> EngineResult<T> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::CorruptRecord {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// In-memory store used by tests and single-process deployments
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> EngineResult<()> {
        self.map.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        self.map.write().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> EngineResult<Vec<(String, Vec<u8>)>> {
        let map = self.map.read().await;
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
