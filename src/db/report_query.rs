//! Aggregation queries over the reports table
//!
//! Every query is grouped by the query-specific keys and filtered by server,
//! created-at window, trust level, source category and a stage -> items filter.
//! An empty stage filter short-circuits to an empty result without touching
//! the database.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use std::collections::BTreeMap;

use super::Database;
use crate::models::{Server, SourceCategory, AUTOMATED_SOURCES};

#[derive(Debug, Clone)]
pub struct ReportQueryContext {
    pub server: Server,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Personal queries: `reliability >= 0 AND account_id = X`; otherwise `reliability = 0`.
    pub account_id: Option<i32>,
    pub source_category: SourceCategory,
    /// stage id -> item ids; items are ignored by per-stage queries
    pub stage_item_filter: BTreeMap<i32, Vec<i32>>,
    pub exclude_non_one_times: bool,
    pub times: Option<i32>,
}

impl ReportQueryContext {
    pub fn new(server: Server, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            server,
            start_time,
            end_time,
            account_id: None,
            source_category: SourceCategory::All,
            stage_item_filter: BTreeMap::new(),
            exclude_non_one_times: false,
            times: None,
        }
    }

    fn stage_ids(&self) -> Vec<i32> {
        self.stage_item_filter.keys().copied().collect()
    }
}

/// Fixed-length sub-intervals `[start + i*len, start + (i+1)*len)` for `i < interval_num`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendWindow {
    pub start_time: DateTime<Utc>,
    pub interval_secs: i64,
    pub interval_num: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TotalQuantityResultForDropMatrix {
    pub stage_id: i32,
    pub item_id: i32,
    pub total_quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TotalQuantityResultForPatternMatrix {
    pub stage_id: i32,
    pub pattern_id: i32,
    pub total_quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TotalTimesResult {
    pub stage_id: i32,
    pub total_times: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct QuantityUniqCountResultForDropMatrix {
    pub stage_id: i32,
    pub item_id: i32,
    pub quantity: i32,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TotalQuantityResultForTrend {
    pub group_id: i32,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub stage_id: i32,
    pub item_id: i32,
    pub total_quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TotalTimesResultForTrend {
    pub group_id: i32,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub stage_id: i32,
    pub total_times: i64,
}

type Builder = QueryBuilder<'static, Postgres>;

fn push_report_filters(qb: &mut Builder, ctx: &ReportQueryContext) {
    qb.push(" WHERE dr.server = ").push_bind(ctx.server.as_str());
    qb.push(" AND dr.deleted = false");
    match ctx.account_id {
        Some(account_id) => {
            qb.push(" AND dr.reliability >= 0 AND dr.account_id = ").push_bind(account_id);
        }
        None => {
            qb.push(" AND dr.reliability = 0");
        }
    }
    qb.push(" AND dr.created_at >= ").push_bind(ctx.start_time);
    qb.push(" AND dr.created_at < ").push_bind(ctx.end_time);

    let automated: Vec<String> = AUTOMATED_SOURCES.iter().map(|s| s.to_string()).collect();
    match ctx.source_category {
        SourceCategory::All => {}
        SourceCategory::Automated => {
            qb.push(" AND dr.source_name = ANY(").push_bind(automated).push(")");
        }
        SourceCategory::Manual => {
            qb.push(" AND (dr.source_name IS NULL OR NOT (dr.source_name = ANY(")
                .push_bind(automated)
                .push(")))");
        }
    }

    if ctx.exclude_non_one_times {
        qb.push(" AND dr.times = 1");
    }
    if let Some(times) = ctx.times {
        qb.push(" AND dr.times = ").push_bind(times);
    }
}

/// `(dr.stage_id = $ AND dpe.item_id = ANY($)) OR ...`
fn push_stage_item_filter(qb: &mut Builder, ctx: &ReportQueryContext) {
    qb.push(" AND (");
    for (i, (stage_id, item_ids)) in ctx.stage_item_filter.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push("(dr.stage_id = ").push_bind(*stage_id);
        if !item_ids.is_empty() {
            qb.push(" AND dpe.item_id = ANY(").push_bind(item_ids.clone()).push(")");
        }
        qb.push(")");
    }
    qb.push(")");
}

fn push_stage_filter(qb: &mut Builder, ctx: &ReportQueryContext) {
    qb.push(" AND dr.stage_id = ANY(").push_bind(ctx.stage_ids()).push(")");
}

fn push_trend_intervals(qb: &mut Builder, window: &TrendWindow) {
    let secs = window.interval_secs as f64;
    qb.push(" FROM (SELECT gs.n::INT AS group_id, CAST(")
        .push_bind(window.start_time)
        .push(" AS TIMESTAMPTZ) + gs.n * make_interval(secs => ")
        .push_bind(secs)
        .push(") AS interval_start, CAST(")
        .push_bind(window.start_time)
        .push(" AS TIMESTAMPTZ) + (gs.n + 1) * make_interval(secs => ")
        .push_bind(secs)
        .push(") AS interval_end FROM generate_series(0, ")
        .push_bind(window.interval_num - 1)
        .push(") AS gs(n)) iv");
    qb.push(" JOIN drop_reports dr ON dr.created_at >= iv.interval_start AND dr.created_at < iv.interval_end");
}

pub(crate) fn build_total_quantity_for_drop_matrix(ctx: &ReportQueryContext) -> Option<Builder> {
    if ctx.stage_item_filter.is_empty() {
        return None;
    }
    let mut qb = Builder::new(
        "SELECT dr.stage_id, dpe.item_id, SUM(dpe.quantity)::BIGINT AS total_quantity \
         FROM drop_reports dr \
         JOIN drop_pattern_elements dpe ON dpe.drop_pattern_id = dr.pattern_id",
    );
    push_report_filters(&mut qb, ctx);
    push_stage_item_filter(&mut qb, ctx);
    qb.push(" GROUP BY dr.stage_id, dpe.item_id");
    Some(qb)
}

pub(crate) fn build_total_quantity_for_pattern_matrix(ctx: &ReportQueryContext) -> Option<Builder> {
    if ctx.stage_item_filter.is_empty() {
        return None;
    }
    let mut qb = Builder::new(
        "SELECT dr.stage_id, dr.pattern_id, COUNT(*)::BIGINT AS total_quantity FROM drop_reports dr",
    );
    push_report_filters(&mut qb, ctx);
    if ctx.times.is_none() {
        qb.push(" AND dr.times = 1");
    }
    push_stage_filter(&mut qb, ctx);
    qb.push(" GROUP BY dr.stage_id, dr.pattern_id");
    Some(qb)
}

pub(crate) fn build_total_times(ctx: &ReportQueryContext) -> Option<Builder> {
    if ctx.stage_item_filter.is_empty() {
        return None;
    }
    let mut qb = Builder::new("SELECT dr.stage_id, SUM(dr.times)::BIGINT AS total_times FROM drop_reports dr");
    push_report_filters(&mut qb, ctx);
    push_stage_filter(&mut qb, ctx);
    qb.push(" GROUP BY dr.stage_id");
    Some(qb)
}

pub(crate) fn build_quantity_uniq_count_for_drop_matrix(ctx: &ReportQueryContext) -> Option<Builder> {
    if ctx.stage_item_filter.is_empty() {
        return None;
    }
    let mut qb = Builder::new(
        "SELECT dr.stage_id, dpe.item_id, dpe.quantity, COUNT(*)::BIGINT AS count \
         FROM drop_reports dr \
         JOIN drop_pattern_elements dpe ON dpe.drop_pattern_id = dr.pattern_id",
    );
    push_report_filters(&mut qb, ctx);
    push_stage_item_filter(&mut qb, ctx);
    qb.push(" GROUP BY dr.stage_id, dpe.item_id, dpe.quantity");
    Some(qb)
}

pub(crate) fn build_total_quantity_for_trend(ctx: &ReportQueryContext, window: &TrendWindow) -> Option<Builder> {
    if ctx.stage_item_filter.is_empty() || window.interval_num <= 0 {
        return None;
    }
    let mut qb = Builder::new(
        "SELECT iv.group_id, iv.interval_start, iv.interval_end, dr.stage_id, dpe.item_id, \
         SUM(dpe.quantity)::BIGINT AS total_quantity",
    );
    push_trend_intervals(&mut qb, window);
    qb.push(" JOIN drop_pattern_elements dpe ON dpe.drop_pattern_id = dr.pattern_id");
    push_report_filters(&mut qb, ctx);
    push_stage_item_filter(&mut qb, ctx);
    qb.push(" GROUP BY iv.group_id, iv.interval_start, iv.interval_end, dr.stage_id, dpe.item_id");
    Some(qb)
}

pub(crate) fn build_total_times_for_trend(ctx: &ReportQueryContext, window: &TrendWindow) -> Option<Builder> {
    if ctx.stage_item_filter.is_empty() || window.interval_num <= 0 {
        return None;
    }
    let mut qb = Builder::new(
        "SELECT iv.group_id, iv.interval_start, iv.interval_end, dr.stage_id, SUM(dr.times)::BIGINT AS total_times",
    );
    push_trend_intervals(&mut qb, window);
    push_report_filters(&mut qb, ctx);
    push_stage_filter(&mut qb, ctx);
    qb.push(" GROUP BY iv.group_id, iv.interval_start, iv.interval_end, dr.stage_id");
    Some(qb)
}

impl Database {
    pub async fn calc_total_quantity_for_drop_matrix(
        &self,
        ctx: &ReportQueryContext,
    ) -> Result<Vec<TotalQuantityResultForDropMatrix>, sqlx::Error> {
        match build_total_quantity_for_drop_matrix(ctx) {
            Some(mut qb) => qb.build_query_as().fetch_all(&self.pool).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn calc_total_quantity_for_pattern_matrix(
        &self,
        ctx: &ReportQueryContext,
    ) -> Result<Vec<TotalQuantityResultForPatternMatrix>, sqlx::Error> {
        match build_total_quantity_for_pattern_matrix(ctx) {
            Some(mut qb) => qb.build_query_as().fetch_all(&self.pool).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn calc_total_times(&self, ctx: &ReportQueryContext) -> Result<Vec<TotalTimesResult>, sqlx::Error> {
        match build_total_times(ctx) {
            Some(mut qb) => qb.build_query_as().fetch_all(&self.pool).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn calc_quantity_uniq_count_for_drop_matrix(
        &self,
        ctx: &ReportQueryContext,
    ) -> Result<Vec<QuantityUniqCountResultForDropMatrix>, sqlx::Error> {
        match build_quantity_uniq_count_for_drop_matrix(ctx) {
            Some(mut qb) => qb.build_query_as().fetch_all(&self.pool).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn calc_total_quantity_for_trend(
        &self,
        ctx: &ReportQueryContext,
        window: &TrendWindow,
    ) -> Result<Vec<TotalQuantityResultForTrend>, sqlx::Error> {
        match build_total_quantity_for_trend(ctx, window) {
            Some(mut qb) => qb.build_query_as().fetch_all(&self.pool).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn calc_total_times_for_trend(
        &self,
        ctx: &ReportQueryContext,
        window: &TrendWindow,
    ) -> Result<Vec<TotalTimesResultForTrend>, sqlx::Error> {
        match build_total_times_for_trend(ctx, window) {
            Some(mut qb) => qb.build_query_as().fetch_all(&self.pool).await,
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx() -> ReportQueryContext {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).single().unwrap();
        let mut ctx = ReportQueryContext::new(Server::CN, start, end);
        ctx.stage_item_filter.insert(1, vec![10, 11]);
        ctx.stage_item_filter.insert(2, vec![10]);
        ctx
    }

    #[test]
    fn empty_stage_filter_short_circuits() {
        let mut ctx = ctx();
        ctx.stage_item_filter.clear();
        assert!(build_total_quantity_for_drop_matrix(&ctx).is_none());
        assert!(build_total_times(&ctx).is_none());
        assert!(build_quantity_uniq_count_for_drop_matrix(&ctx).is_none());
        assert!(build_total_quantity_for_pattern_matrix(&ctx).is_none());
    }

    #[test]
    fn public_queries_require_trusted_rows() {
        let qb = build_total_quantity_for_drop_matrix(&ctx()).unwrap();
        let sql = qb.sql();
        assert!(sql.contains("dr.reliability = 0"));
        assert!(sql.contains("dr.deleted = false"));
        assert!(!sql.contains("dr.account_id"));
        assert!(sql.contains("(dr.stage_id = $4 AND dpe.item_id = ANY($5)) OR (dr.stage_id = $6"));
        assert!(sql.ends_with("GROUP BY dr.stage_id, dpe.item_id"));
    }

    #[test]
    fn personal_queries_filter_by_account_and_allow_lenient_rows() {
        let mut ctx = ctx();
        ctx.account_id = Some(42);
        let qb = build_total_times(&ctx).unwrap();
        let sql = qb.sql();
        assert!(sql.contains("dr.reliability >= 0 AND dr.account_id = $2"));
        assert!(sql.contains("dr.stage_id = ANY("));
    }

    #[test]
    fn source_category_and_times_filters() {
        let mut ctx = ctx();
        ctx.source_category = SourceCategory::Manual;
        ctx.exclude_non_one_times = true;
        let sql = build_quantity_uniq_count_for_drop_matrix(&ctx).unwrap().sql().to_string();
        assert!(sql.contains("(dr.source_name IS NULL OR NOT (dr.source_name = ANY($4)))"));
        assert!(sql.contains("dr.times = 1"));
        assert!(sql.contains("GROUP BY dr.stage_id, dpe.item_id, dpe.quantity"));

        ctx.source_category = SourceCategory::Automated;
        ctx.exclude_non_one_times = false;
        let sql = build_total_times(&ctx).unwrap().sql().to_string();
        assert!(sql.contains(" AND dr.source_name = ANY("));
        assert!(!sql.contains("dr.times = 1"));
    }

    #[test]
    fn pattern_matrix_forces_single_clear_reports() {
        let sql = build_total_quantity_for_pattern_matrix(&ctx()).unwrap().sql().to_string();
        assert!(sql.contains("dr.times = 1"));
        assert!(sql.contains("GROUP BY dr.stage_id, dr.pattern_id"));
    }

    #[test]
    fn trend_queries_materialise_intervals() {
        let ctx = ctx();
        let window = TrendWindow {
            start_time: ctx.start_time,
            interval_secs: 86400,
            interval_num: 7,
        };
        let sql = build_total_quantity_for_trend(&ctx, &window).unwrap().sql().to_string();
        assert!(sql.contains("generate_series(0, $5)"));
        assert!(sql.contains("dr.created_at >= iv.interval_start AND dr.created_at < iv.interval_end"));
        assert!(sql.contains("GROUP BY iv.group_id"));

        let empty = TrendWindow { interval_num: 0, ..window };
        assert!(build_total_times_for_trend(&ctx, &empty).is_none());
    }
}
