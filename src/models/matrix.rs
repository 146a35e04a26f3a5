//! Derived aggregate elements

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{RangeEnd, RangeRef, Server, SourceCategory};

/// Per-clear quantity -> number of clears that dropped exactly that quantity.
pub type QuantityBuckets = BTreeMap<i32, i64>;

/// Drop-matrix aggregate for one (stage, item) over one time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropMatrixElement {
    pub server: Server,
    pub source_category: SourceCategory,
    pub stage_id: i32,
    pub item_id: i32,
    pub range: RangeRef,
    pub quantity: i64,
    pub times: i64,
    pub quantity_buckets: QuantityBuckets,
    pub day_num: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl DropMatrixElement {
    pub fn bucket_total(&self) -> i64 {
        self.quantity_buckets.values().sum()
    }
}

/// Drop-matrix result for one (stage, item) over its maximum accumulable chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneDropMatrixElement {
    pub stage_id: i32,
    pub item_id: i32,
    pub quantity: i64,
    pub times: i64,
    pub std_dev: f64,
    pub start_time: DateTime<Utc>,
    pub end: RangeEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatrixElement {
    pub server: Server,
    pub stage_id: i32,
    pub pattern_id: i32,
    pub range: RangeRef,
    pub quantity: i64,
    pub times: i64,
    pub start_time: DateTime<Utc>,
    pub end: RangeEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendElement {
    pub server: Server,
    pub source_category: SourceCategory,
    pub stage_id: i32,
    pub item_id: i32,
    pub group_id: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub quantity: i64,
    pub times: i64,
}

/// Time series for one (stage, item); index `i` covers `start_time + i * interval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemTrend {
    pub item_id: i32,
    pub start_time: DateTime<Utc>,
    pub quantity: Vec<i64>,
    pub times: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTrend {
    pub stage_id: i32,
    pub results: Vec<ItemTrend>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendQueryResult {
    pub interval_secs: i64,
    pub trends: Vec<StageTrend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropPatternElement {
    pub pattern_id: i32,
    pub item_id: i32,
    pub quantity: i32,
}
