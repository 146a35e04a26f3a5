//! Persisted drop-matrix and pattern-matrix elements

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use tracing::debug;

use super::Database;
use crate::models::{
    DropMatrixElement, PatternMatrixElement, QuantityBuckets, RangeEnd, RangeRef, Server, SourceCategory,
};

// Stays well under the 65535 bind-parameter limit (11 binds per row)
const INSERT_CHUNK: usize = 1000;

#[derive(sqlx::FromRow)]
struct DropMatrixElementRow {
    source_category: String,
    stage_id: i32,
    item_id: i32,
    range_id: i32,
    quantity: i64,
    times: i64,
    quantity_buckets: Json<QuantityBuckets>,
    day_num: i32,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl DropMatrixElementRow {
    fn into_model(self, server: Server) -> Option<DropMatrixElement> {
        Some(DropMatrixElement {
            server,
            source_category: self.source_category.parse().ok()?,
            stage_id: self.stage_id,
            item_id: self.item_id,
            range: RangeRef::from(self.range_id),
            quantity: self.quantity,
            times: self.times,
            quantity_buckets: self.quantity_buckets.0,
            day_num: self.day_num,
            start_time: self.start_time,
            end_time: self.end_time,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PatternMatrixElementRow {
    stage_id: i32,
    pattern_id: i32,
    range_id: i32,
    quantity: i64,
    times: i64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

const DROP_MATRIX_COLUMNS: &str =
    "source_category, stage_id, item_id, range_id, quantity, times, quantity_buckets, day_num, start_time, end_time";

impl Database {
    /// Atomically swaps the rows of one (server, day, source category).
    ///
    /// Returns whether any rows existed before the swap.
    pub async fn replace_drop_matrix_elements(
        &self,
        server: Server,
        day_num: i32,
        source_category: SourceCategory,
        elements: &[DropMatrixElement],
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let (existing,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM drop_matrix_elements WHERE server = $1 AND day_num = $2 AND source_category = $3",
        )
        .bind(server.as_str())
        .bind(day_num)
        .bind(source_category.as_str())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM drop_matrix_elements WHERE server = $1 AND day_num = $2 AND source_category = $3")
            .bind(server.as_str())
            .bind(day_num)
            .bind(source_category.as_str())
            .execute(&mut *tx)
            .await?;

        for chunk in elements.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO drop_matrix_elements (server, source_category, stage_id, item_id, range_id, quantity, times, quantity_buckets, day_num, start_time, end_time) ",
            );
            qb.push_values(chunk, |mut b, el| {
                b.push_bind(el.server.as_str())
                    .push_bind(el.source_category.as_str())
                    .push_bind(el.stage_id)
                    .push_bind(el.item_id)
                    .push_bind(el.range.to_db())
                    .push_bind(el.quantity)
                    .push_bind(el.times)
                    .push_bind(Json(el.quantity_buckets.clone()))
                    .push_bind(el.day_num)
                    .push_bind(el.start_time)
                    .push_bind(el.end_time);
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(
            server = %server,
            day_num,
            source_category = %source_category,
            "Replaced {} drop matrix elements (had {})",
            elements.len(),
            existing
        );
        Ok(existing > 0)
    }

    pub async fn get_drop_matrix_elements_by_range_ids(
        &self,
        server: Server,
        source_category: SourceCategory,
        range_ids: &[i32],
    ) -> Result<Vec<DropMatrixElement>, sqlx::Error> {
        if range_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<DropMatrixElementRow> = sqlx::query_as(&format!(
            "SELECT {} FROM drop_matrix_elements WHERE server = $1 AND source_category = $2 AND range_id = ANY($3) ORDER BY day_num",
            DROP_MATRIX_COLUMNS
        ))
        .bind(server.as_str())
        .bind(source_category.as_str())
        .bind(range_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(|r| r.into_model(server)).collect())
    }

    /// Rows with `start_day <= day_num <= end_day`.
    pub async fn get_drop_matrix_elements_by_day_num_range(
        &self,
        server: Server,
        source_category: SourceCategory,
        start_day: i32,
        end_day: i32,
    ) -> Result<Vec<DropMatrixElement>, sqlx::Error> {
        let rows: Vec<DropMatrixElementRow> = sqlx::query_as(&format!(
            "SELECT {} FROM drop_matrix_elements WHERE server = $1 AND source_category = $2 AND day_num BETWEEN $3 AND $4 ORDER BY day_num",
            DROP_MATRIX_COLUMNS
        ))
        .bind(server.as_str())
        .bind(source_category.as_str())
        .bind(start_day)
        .bind(end_day)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(|r| r.into_model(server)).collect())
    }

    /// All-time (stage, item) -> (quantity, times) totals from the daily rows.
    pub async fn get_drop_matrix_totals(
        &self,
        server: Server,
        source_category: SourceCategory,
    ) -> Result<Vec<(i32, i32, i64, i64)>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT stage_id, item_id, SUM(quantity)::BIGINT, SUM(times)::BIGINT
            FROM drop_matrix_elements
            WHERE server = $1 AND source_category = $2
            GROUP BY stage_id, item_id
            ORDER BY stage_id, item_id
            "#,
        )
        .bind(server.as_str())
        .bind(source_category.as_str())
        .fetch_all(&self.pool)
        .await
    }

    pub async fn replace_pattern_matrix_elements(
        &self,
        server: Server,
        elements: &[PatternMatrixElement],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM pattern_matrix_elements WHERE server = $1")
            .bind(server.as_str())
            .execute(&mut *tx)
            .await?;

        for chunk in elements.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO pattern_matrix_elements (server, stage_id, pattern_id, range_id, quantity, times, start_time, end_time) ",
            );
            qb.push_values(chunk, |mut b, el| {
                b.push_bind(el.server.as_str())
                    .push_bind(el.stage_id)
                    .push_bind(el.pattern_id)
                    .push_bind(el.range.to_db())
                    .push_bind(el.quantity)
                    .push_bind(el.times)
                    .push_bind(el.start_time)
                    .push_bind(el.end.to_db());
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(server = %server, "Replaced {} pattern matrix elements", elements.len());
        Ok(())
    }

    pub async fn get_pattern_matrix_elements(&self, server: Server) -> Result<Vec<PatternMatrixElement>, sqlx::Error> {
        let rows: Vec<PatternMatrixElementRow> = sqlx::query_as(
            r#"
            SELECT stage_id, pattern_id, range_id, quantity, times, start_time, end_time
            FROM pattern_matrix_elements
            WHERE server = $1
            ORDER BY stage_id, pattern_id
            "#,
        )
        .bind(server.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| PatternMatrixElement {
                server,
                stage_id: r.stage_id,
                pattern_id: r.pattern_id,
                range: RangeRef::from(r.range_id),
                quantity: r.quantity,
                times: r.times,
                start_time: r.start_time,
                end: RangeEnd::from_db(r.end_time),
            })
            .collect())
    }
}
