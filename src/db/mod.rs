//! Database module

mod elements;
mod report_query;
mod schema;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::models::{Bounds, DropInfo, DropPatternElement, Item, RangeEnd, RangeRef, Server, Stage, TimeRange};

pub use report_query::{
    QuantityUniqCountResultForDropMatrix, ReportQueryContext, TotalQuantityResultForDropMatrix,
    TotalQuantityResultForPatternMatrix, TotalQuantityResultForTrend, TotalTimesResult, TotalTimesResultForTrend,
    TrendWindow,
};

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct TimeRangeRow {
    range_id: i32,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl TimeRangeRow {
    fn into_model(self, server: Server) -> TimeRange {
        TimeRange {
            range: RangeRef::Stored(self.range_id),
            server,
            start_time: self.start_time,
            end: RangeEnd::from_db(self.end_time),
        }
    }
}

#[derive(sqlx::FromRow)]
struct DropInfoRow {
    drop_id: i32,
    stage_id: i32,
    item_id: Option<i32>,
    drop_type: String,
    range_id: i32,
    accumulable: bool,
    bounds: Option<Json<Bounds>>,
}

impl DropInfoRow {
    fn into_model(self, server: Server) -> DropInfo {
        DropInfo {
            drop_id: self.drop_id,
            server,
            stage_id: self.stage_id,
            item_id: self.item_id,
            drop_type: self.drop_type,
            range_id: self.range_id,
            accumulable: self.accumulable,
            bounds: self.bounds.map(|b| b.0),
        }
    }
}

const DROP_INFO_COLUMNS: &str =
    "di.drop_id, di.stage_id, di.item_id, di.drop_type, di.range_id, di.accumulable, di.bounds";

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_open_conns)
            .min_connections(config.max_idle_conns)
            .acquire_timeout(Duration::from_secs(8))
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    /// Pool that connects on first use.
    #[cfg(test)]
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(1).connect_lazy(url)?;
        Ok(Self { pool })
    }

    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Fails when a collaborator-owned table is missing.
    pub async fn assert_schema(&self) -> Result<()> {
        let required: Vec<String> = schema::REQUIRED_TABLES.iter().map(|t| t.to_string()).collect();
        let present: Vec<(String,)> = sqlx::query_as(
            "SELECT table_name::text FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = ANY($1)",
        )
        .bind(&required)
        .fetch_all(&self.pool)
        .await?;

        let missing: Vec<&str> = schema::REQUIRED_TABLES
            .iter()
            .copied()
            .filter(|t| !present.iter().any(|(p,)| p == t))
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("Schema assertion failed, missing tables: {}", missing.join(", "));
        }
        Ok(())
    }

    pub async fn run_migrations(&self) -> Result<()> {
        for statement in [
            schema::CREATE_DROP_MATRIX_ELEMENTS_TABLE,
            schema::CREATE_PATTERN_MATRIX_ELEMENTS_TABLE,
            schema::CREATE_INDEX_DME_DAY,
            schema::CREATE_INDEX_DME_RANGE,
            schema::CREATE_INDEX_PME_SERVER,
            schema::CREATE_INDEX_REPORTS_SERVER_CREATED_STAGE,
            schema::CREATE_INDEX_PATTERN_ELEMENTS_PATTERN,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Migrations applied");
        Ok(())
    }

    pub async fn get_time_ranges_by_server(&self, server: Server) -> Result<Vec<TimeRange>, sqlx::Error> {
        let rows: Vec<TimeRangeRow> = sqlx::query_as(
            "SELECT range_id, start_time, end_time FROM time_ranges WHERE server = $1 ORDER BY start_time",
        )
        .bind(server.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.into_model(server)).collect())
    }

    pub async fn get_time_range_by_id(&self, range_id: i32) -> Result<Option<TimeRange>, sqlx::Error> {
        let row: Option<(i32, String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT range_id, server, start_time, end_time FROM time_ranges WHERE range_id = $1",
        )
        .bind(range_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(range_id, server, start_time, end_time)| {
            let server = server.parse::<Server>().ok()?;
            Some(TimeRangeRow { range_id, start_time, end_time }.into_model(server))
        }))
    }

    pub async fn get_drop_infos_by_server(&self, server: Server) -> Result<Vec<DropInfo>, sqlx::Error> {
        let rows: Vec<DropInfoRow> = sqlx::query_as(&format!(
            "SELECT {} FROM drop_infos di WHERE di.server = $1",
            DROP_INFO_COLUMNS
        ))
        .bind(server.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.into_model(server)).collect())
    }

    /// Drop infos of the given stored ranges, optionally narrowed to stages / items.
    pub async fn get_drop_infos_by_range_ids(
        &self,
        server: Server,
        range_ids: &[i32],
        stage_filter: Option<&[i32]>,
        item_filter: Option<&[i32]>,
    ) -> Result<Vec<DropInfo>, sqlx::Error> {
        if range_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("SELECT {} FROM drop_infos di WHERE di.server = ", DROP_INFO_COLUMNS));
        qb.push_bind(server.as_str());
        qb.push(" AND di.range_id = ANY(").push_bind(range_ids.to_vec()).push(")");
        push_drop_info_filters(&mut qb, stage_filter, item_filter);

        let rows: Vec<DropInfoRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| r.into_model(server)).collect())
    }

    /// Drop infos whose time range overlaps `[start, end)`; used for ad-hoc ranges.
    pub async fn get_drop_infos_overlapping(
        &self,
        server: Server,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        stage_filter: Option<&[i32]>,
        item_filter: Option<&[i32]>,
    ) -> Result<Vec<DropInfo>, sqlx::Error> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM drop_infos di JOIN time_ranges tr ON tr.range_id = di.range_id WHERE di.server = ",
            DROP_INFO_COLUMNS
        ));
        qb.push_bind(server.as_str());
        qb.push(" AND tr.start_time < ").push_bind(end);
        qb.push(" AND tr.end_time > ").push_bind(start);
        push_drop_info_filters(&mut qb, stage_filter, item_filter);

        let rows: Vec<DropInfoRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| r.into_model(server)).collect())
    }

    /// Stages with a drop info whose range contains `at`.
    pub async fn get_open_stage_ids(&self, server: Server, at: DateTime<Utc>) -> Result<Vec<i32>, sqlx::Error> {
        let rows: Vec<(i32,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT di.stage_id
            FROM drop_infos di
            JOIN time_ranges tr ON tr.range_id = di.range_id
            WHERE di.server = $1 AND tr.start_time <= $2 AND tr.end_time > $2
            "#,
        )
        .bind(server.as_str())
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn get_stages(&self) -> Result<Vec<Stage>, sqlx::Error> {
        let rows: Vec<(i32, String, i32)> =
            sqlx::query_as("SELECT stage_id, ark_stage_id, zone_id FROM stages ORDER BY stage_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(stage_id, ark_stage_id, zone_id)| Stage { stage_id, ark_stage_id, zone_id })
            .collect())
    }

    pub async fn get_items(&self) -> Result<Vec<Item>, sqlx::Error> {
        let rows: Vec<(i32, String)> = sqlx::query_as("SELECT item_id, ark_item_id FROM items ORDER BY item_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(item_id, ark_item_id)| Item { item_id, ark_item_id })
            .collect())
    }

    pub async fn get_drop_pattern_elements(&self, pattern_id: i32) -> Result<Vec<DropPatternElement>, sqlx::Error> {
        let rows: Vec<(i32, i32)> = sqlx::query_as(
            "SELECT item_id, quantity FROM drop_pattern_elements WHERE drop_pattern_id = $1 ORDER BY item_id",
        )
        .bind(pattern_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(item_id, quantity)| DropPatternElement { pattern_id, item_id, quantity })
            .collect())
    }

    pub async fn get_drop_pattern_hash(&self, pattern_id: i32) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as("SELECT hash FROM drop_patterns WHERE id = $1")
            .bind(pattern_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(hash,)| hash))
    }

    pub async fn get_account_id_by_penguin_id(&self, penguin_id: &str) -> Result<Option<i32>, sqlx::Error> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT account_id FROM accounts WHERE penguin_id = $1")
            .bind(penguin_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| id))
    }
}

fn push_drop_info_filters(qb: &mut QueryBuilder<'_, Postgres>, stage_filter: Option<&[i32]>, item_filter: Option<&[i32]>) {
    if let Some(stages) = stage_filter {
        qb.push(" AND di.stage_id = ANY(").push_bind(stages.to_vec()).push(")");
    }
    if let Some(items) = item_filter {
        qb.push(" AND di.item_id = ANY(").push_bind(items.to_vec()).push(")");
    }
}
