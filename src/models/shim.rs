//! Public wire schema (ark ids, epoch milliseconds)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimOneDropMatrixElement {
    pub stage_id: String,
    pub item_id: String,
    pub quantity: i64,
    pub times: i64,
    pub std_dev: f64,
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShimDropMatrixQueryResult {
    pub matrix: Vec<ShimOneDropMatrixElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimDrop {
    pub item_id: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimPattern {
    pub drops: Vec<ShimDrop>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimOnePatternMatrixElement {
    pub stage_id: String,
    pub pattern: ShimPattern,
    pub quantity: i64,
    pub times: i64,
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimPatternMatrixQueryResult {
    pub pattern_matrix: Vec<ShimOnePatternMatrixElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimOneItemTrend {
    pub quantity: Vec<i64>,
    pub times: Vec<i64>,
    pub start_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimStageTrend {
    pub results: BTreeMap<String, ShimOneItemTrend>,
    pub start_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimTrendQueryResult {
    /// Bucket length in milliseconds.
    pub interval: i64,
    pub trend: BTreeMap<String, ShimStageTrend>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShimAdvancedResult {
    Trend(ShimTrendQueryResult),
    DropMatrix(ShimDropMatrixQueryResult),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimAdvancedQueryResult {
    pub advanced_results: Vec<ShimAdvancedResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimStageTimes {
    pub stage_id: String,
    pub times: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimItemQuantity {
    pub item_id: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimSiteStats {
    pub total_stage_times: Vec<ShimStageTimes>,
    pub total_stage_times_24h: Vec<ShimStageTimes>,
    pub total_item_quantities: Vec<ShimItemQuantity>,
}
