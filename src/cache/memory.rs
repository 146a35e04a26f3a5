//! In-process cache backend for tests and single-node development

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::{CacheBackend, CacheError};

#[derive(Default)]
pub struct MemoryBackend {
    values: RwLock<HashMap<String, (String, Instant)>>,
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let values = self.values.read().await;
        Ok(values
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.values
            .write()
            .await
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut values = self.values.write().await;
        for key in keys {
            values.remove(key);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut values = self.values.write().await;
        let before = values.len();
        values.retain(|key, _| !key.starts_with(prefix));
        Ok((before - values.len()) as u64)
    }

    async fn hash_get(&self, hash: &str, field: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .hashes
            .read()
            .await
            .get(hash)
            .and_then(|fields| fields.get(field).cloned()))
    }

    async fn hash_set(&self, hash: &str, field: &str, value: String) -> Result<(), CacheError> {
        self.hashes
            .write()
            .await
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
