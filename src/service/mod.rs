//! Aggregation services behind the HTTP handlers and the calculation worker
//!
//! `StatsService` owns the pool and the cache registry; each submodule adds an
//! `impl StatsService` block for one result family.

mod drop_matrix;
mod game_data;
mod pattern_matrix;
mod shim;
mod site_stats;
pub mod stddev;
mod time_range;
mod trend;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;

use crate::cache::{CacheSet, Caches};
use crate::config::QueryConfig;
use crate::db::Database;
use crate::error::AppResult;

pub use game_data::GameData;
pub use shim::{pattern_hash, AdvancedQuery};

/// A result and when the cached copy it came from was computed.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub value: T,
    /// `None` for uncached (personal) results.
    pub last_modified: Option<DateTime<Utc>>,
}

impl<T> Cached<T> {
    pub fn fresh(value: T) -> Self {
        Self {
            value,
            last_modified: None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Cached<U> {
        Cached {
            value: f(self.value),
            last_modified: self.last_modified,
        }
    }
}

pub struct StatsService {
    db: Database,
    caches: Arc<Caches>,
    query: QueryConfig,
}

impl StatsService {
    pub fn new(db: Database, caches: Arc<Caches>, query: QueryConfig) -> Self {
        Self { db, caches, query }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Single-flight cached read that stamps `lastModifiedTime` when it computed.
    async fn read_through<T, F, Fut>(&self, set: &CacheSet<T>, key: &str, compute: F) -> AppResult<Cached<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let (value, calculated) = set.mutex_get_set(key, compute).await?;
        let last_modified = if calculated {
            let now = Utc::now();
            self.caches.last_modified.set(key, now).await;
            Some(now)
        } else {
            self.caches.last_modified.get(key).await
        };
        Ok(Cached { value, last_modified })
    }
}
