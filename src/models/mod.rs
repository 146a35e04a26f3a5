//! Domain types shared by the query engine, aggregators and worker

mod drop_info;
mod matrix;
mod server;
pub mod shim;
mod source_category;
mod time_range;

pub use drop_info::{drop_sets_by_stage, max_per_report_bound, stage_item_filter, Bounds, DropInfo};
pub use matrix::{
    DropMatrixElement, DropPatternElement, ItemTrend, OneDropMatrixElement, PatternMatrixElement,
    QuantityBuckets, StageTrend, TrendElement, TrendQueryResult,
};
pub use server::{ParseServerError, Server};
pub use source_category::{ParseSourceCategoryError, SourceCategory, AUTOMATED_SOURCES};
pub use time_range::{RangeEnd, RangeRef, TimeRange};

/// Game-data row for a stage.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Stage {
    pub stage_id: i32,
    pub ark_stage_id: String,
    pub zone_id: i32,
}

/// Game-data row for an item.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Item {
    pub item_id: i32,
    pub ark_item_id: String,
}
