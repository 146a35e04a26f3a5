//! Typed cache sets over a shared key/value backend
//!
//! Keys look like `<namespace>#<field|field>:<value|value>`. Every cached read
//! has a sibling entry in the `lastModifiedTime` hash under `[<key>]`, used to
//! stamp `Last-Modified` on responses.

mod memory;
mod redis_backend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::models::shim::{
    ShimDropMatrixQueryResult, ShimPatternMatrixQueryResult, ShimSiteStats, ShimTrendQueryResult,
};
use crate::models::{DropPatternElement, Item, Server, SourceCategory, Stage, TimeRange};

pub use self::memory::MemoryBackend;
pub use self::redis_backend::RedisBackend;

pub const LAST_MODIFIED_TIME_HASH: &str = "lastModifiedTime";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no such key")]
    NoKey,

    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Raw string storage the typed sets are built on.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;
    /// Removes every key starting with `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
    async fn hash_get(&self, hash: &str, field: &str) -> Result<Option<String>, CacheError>;
    async fn hash_set(&self, hash: &str, field: &str, value: String) -> Result<(), CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
}

pub type SharedBackend = Arc<dyn CacheBackend>;

/// Name-addressed operations used by the admin purge endpoint.
#[async_trait]
pub trait NamedCache: Send + Sync {
    fn name(&self) -> &'static str;
    async fn delete_key(&self, key: &str) -> Result<(), CacheError>;
    async fn clear(&self) -> Result<u64, CacheError>;
}

pub struct CacheSet<T> {
    name: &'static str,
    fields: &'static [&'static str],
    ttl: Duration,
    backend: SharedBackend,
    mutex: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CacheSet<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(name: &'static str, fields: &'static [&'static str], ttl: Duration, backend: SharedBackend) -> Self {
        Self {
            name,
            fields,
            ttl,
            backend,
            mutex: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn key(&self, values: &[&str]) -> String {
        if self.fields.is_empty() {
            return self.name.to_string();
        }
        format!("{}#{}:{}", self.name, self.fields.join("|"), values.join("|"))
    }

    /// `Err(CacheError::NoKey)` on a miss.
    pub async fn get(&self, key: &str) -> Result<T, CacheError> {
        match self.backend.get(key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(CacheError::NoKey),
        }
    }

    pub async fn set(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.backend.set(key, raw, self.ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.backend.delete(&[key.to_string()]).await
    }

    /// A failing backend reads as a miss.
    async fn lookup(&self, key: &str) -> Option<T> {
        match self.get(key).await {
            Ok(value) => Some(value),
            Err(CacheError::NoKey) => None,
            Err(e) => {
                warn!(key, "Cache read failed, recomputing: {}", e);
                None
            }
        }
    }

    /// Single-flight read-through. Returns the value and whether `compute` ran.
    ///
    /// The per-set mutex makes `compute` run at most once per key per process
    /// between a miss and its store; waiters re-check and receive the stored value.
    pub async fn mutex_get_set<F, Fut, E>(&self, key: &str, compute: F) -> Result<(T, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.lookup(key).await {
            return Ok((value, false));
        }

        let _guard = self.mutex.lock().await;
        if let Some(value) = self.lookup(key).await {
            return Ok((value, false));
        }

        debug!(key, "Cache miss, computing");
        let value = compute().await?;
        if let Err(e) = self.set(key, &value).await {
            warn!(key, "Cache write failed: {}", e);
        }
        Ok((value, true))
    }
}

#[async_trait]
impl<T> NamedCache for CacheSet<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn delete_key(&self, key: &str) -> Result<(), CacheError> {
        self.delete(key).await
    }

    async fn clear(&self) -> Result<u64, CacheError> {
        if self.fields.is_empty() {
            self.backend.delete(&[self.name.to_string()]).await?;
            return Ok(1);
        }
        self.backend.delete_prefix(&format!("{}#", self.name)).await
    }
}

/// Registry of when each cached value was last computed.
pub struct LastModifiedTime {
    backend: SharedBackend,
}

impl LastModifiedTime {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    fn field(key: &str) -> String {
        format!("[{}]", key)
    }

    pub async fn get(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.backend.hash_get(LAST_MODIFIED_TIME_HASH, &Self::field(key)).await {
            Ok(Some(raw)) => raw.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis),
            Ok(None) => None,
            Err(e) => {
                warn!(key, "Failed to read last modified time: {}", e);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, at: DateTime<Utc>) {
        let value = at.timestamp_millis().to_string();
        if let Err(e) = self.backend.hash_set(LAST_MODIFIED_TIME_HASH, &Self::field(key), value).await {
            warn!(key, "Failed to write last modified time: {}", e);
        }
    }
}

pub type StageItemRanges = BTreeMap<i32, BTreeMap<i32, Vec<TimeRange>>>;

/// Every cache namespace, built once at start-up.
pub struct Caches {
    pub backend: SharedBackend,
    pub shim_global_drop_matrix: CacheSet<ShimDropMatrixQueryResult>,
    pub shim_global_pattern_matrix: CacheSet<ShimPatternMatrixQueryResult>,
    pub shim_trend: CacheSet<ShimTrendQueryResult>,
    pub shim_site_stats: CacheSet<ShimSiteStats>,
    pub max_accumulable_time_ranges: CacheSet<StageItemRanges>,
    pub latest_time_ranges: CacheSet<BTreeMap<i32, TimeRange>>,
    pub time_ranges: CacheSet<Vec<TimeRange>>,
    pub time_ranges_map: CacheSet<BTreeMap<i32, TimeRange>>,
    pub time_range: CacheSet<TimeRange>,
    pub drop_pattern_elements: CacheSet<Vec<DropPatternElement>>,
    pub stages: CacheSet<Vec<Stage>>,
    pub items: CacheSet<Vec<Item>>,
    pub last_modified: LastModifiedTime,
}

impl Caches {
    pub fn new(backend: SharedBackend, ttl: Duration) -> Self {
        let b = || backend.clone();
        Self {
            shim_global_drop_matrix: CacheSet::new(
                "shimGlobalDropMatrix",
                &["server", "showClosedZones", "sourceCategory"],
                ttl,
                b(),
            ),
            shim_global_pattern_matrix: CacheSet::new("shimGlobalPatternMatrix", &["server"], ttl, b()),
            shim_trend: CacheSet::new("shimTrend", &["server"], ttl, b()),
            shim_site_stats: CacheSet::new("shimSiteStats", &["server"], ttl, b()),
            max_accumulable_time_ranges: CacheSet::new("maxAccumulableTimeRanges", &["server"], ttl, b()),
            latest_time_ranges: CacheSet::new("latestTimeRanges", &["server"], ttl, b()),
            time_ranges: CacheSet::new("timeRanges", &["server"], ttl, b()),
            time_ranges_map: CacheSet::new("timeRangesMap", &["server"], ttl, b()),
            time_range: CacheSet::new("timeRange", &["rangeId"], ttl, b()),
            drop_pattern_elements: CacheSet::new("dropPatternElements", &["patternId"], ttl, b()),
            stages: CacheSet::new("stages", &[], ttl, b()),
            items: CacheSet::new("items", &[], ttl, b()),
            last_modified: LastModifiedTime::new(b()),
            backend,
        }
    }

    pub fn global_drop_matrix_key(&self, server: Server, show_closed_zones: bool, source_category: SourceCategory) -> String {
        let show = if show_closed_zones { "true" } else { "false" };
        self.shim_global_drop_matrix
            .key(&[server.as_str(), show, source_category.as_str()])
    }

    pub fn named(&self) -> Vec<&dyn NamedCache> {
        vec![
            &self.shim_global_drop_matrix as &dyn NamedCache,
            &self.shim_global_pattern_matrix,
            &self.shim_trend,
            &self.shim_site_stats,
            &self.max_accumulable_time_ranges,
            &self.latest_time_ranges,
            &self.time_ranges,
            &self.time_ranges_map,
            &self.time_range,
            &self.drop_pattern_elements,
            &self.stages,
            &self.items,
        ]
    }

    pub fn find(&self, name: &str) -> Option<&dyn NamedCache> {
        self.named().into_iter().find(|c| c.name() == name)
    }

    /// Drops every key whose value can include today's data on `server`.
    pub async fn invalidate_server_results(&self, server: Server, source_category: SourceCategory) {
        let mut keys = vec![
            self.global_drop_matrix_key(server, true, source_category),
            self.global_drop_matrix_key(server, false, source_category),
            self.shim_trend.key(&[server.as_str()]),
        ];
        if source_category == SourceCategory::All {
            keys.push(self.shim_site_stats.key(&[server.as_str()]));
        }
        if let Err(e) = self.backend.delete(&keys).await {
            warn!(server = %server, "Cache invalidation failed: {}", e);
        }
    }
}
