//! Pattern matrix over each stage's latest range

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use super::StatsService;
use crate::db::{ReportQueryContext, TotalQuantityResultForPatternMatrix, TotalTimesResult};
use crate::error::AppResult;
use crate::models::{PatternMatrixElement, Server, TimeRange};

/// One element per (stage, pattern); `times` is the stage's single-clear total.
pub fn combine_pattern_matrix_results(
    server: Server,
    range: &TimeRange,
    quantities: &[TotalQuantityResultForPatternMatrix],
    times: &[TotalTimesResult],
) -> Vec<PatternMatrixElement> {
    let times_by_stage: BTreeMap<i32, i64> = times.iter().map(|t| (t.stage_id, t.total_times)).collect();
    let mut elements: Vec<PatternMatrixElement> = quantities
        .iter()
        .filter_map(|q| {
            let times = *times_by_stage.get(&q.stage_id)?;
            Some(PatternMatrixElement {
                server,
                stage_id: q.stage_id,
                pattern_id: q.pattern_id,
                range: range.range,
                quantity: q.total_quantity,
                times,
                start_time: range.start_time,
                end: range.end,
            })
        })
        .collect();
    elements.sort_by_key(|e| (e.stage_id, e.pattern_id));
    elements
}

fn apply_range_bounds(elements: &mut [PatternMatrixElement], ranges: &BTreeMap<i32, TimeRange>) {
    for el in elements {
        if let Some(range) = el.range.stored_id().and_then(|id| ranges.get(&id)) {
            el.start_time = range.start_time;
            el.end = range.end;
        }
    }
}

/// Stages grouped under the range that is latest for them.
fn stages_by_latest_range(latest: &BTreeMap<i32, TimeRange>) -> Vec<(TimeRange, Vec<i32>)> {
    let mut grouped: BTreeMap<i32, (TimeRange, Vec<i32>)> = BTreeMap::new();
    for (&stage_id, range) in latest {
        grouped
            .entry(range.range.to_db())
            .or_insert_with(|| (range.clone(), Vec::new()))
            .1
            .push(stage_id);
    }
    grouped.into_values().collect()
}

impl StatsService {
    /// Live pattern matrix; only single-clear reports count.
    pub async fn calc_pattern_matrix(
        &self,
        server: Server,
        account_id: Option<i32>,
        unified_end: DateTime<Utc>,
    ) -> AppResult<Vec<PatternMatrixElement>> {
        let latest = self.latest_time_ranges_by_server(server).await?;
        let groups = stages_by_latest_range(&latest);

        let per_range = try_join_all(groups.iter().map(|(range, stage_ids)| async move {
            let end = range.end.clamp(unified_end);
            if end <= range.start_time {
                return Ok(Vec::new());
            }
            let mut ctx = ReportQueryContext::new(server, range.start_time, end);
            ctx.account_id = account_id;
            ctx.times = Some(1);
            ctx.stage_item_filter = stage_ids.iter().map(|&s| (s, Vec::new())).collect();

            let (quantities, times) = tokio::try_join!(
                self.db.calc_total_quantity_for_pattern_matrix(&ctx),
                self.db.calc_total_times(&ctx),
            )?;
            AppResult::Ok(combine_pattern_matrix_results(server, range, &quantities, &times))
        }))
        .await?;

        Ok(per_range.into_iter().flatten().collect())
    }

    /// Recomputes and persists the public pattern matrix of `server`.
    pub async fn refresh_pattern_matrix(&self, server: Server) -> AppResult<usize> {
        let elements = self.calc_pattern_matrix(server, None, Utc::now()).await?;
        self.db.replace_pattern_matrix_elements(server, &elements).await?;
        let key = self.caches.shim_global_pattern_matrix.key(&[server.as_str()]);
        if let Err(e) = self.caches.shim_global_pattern_matrix.delete(&key).await {
            tracing::warn!(server = %server, "Failed to invalidate pattern matrix cache: {}", e);
        }
        info!(server = %server, "Pattern matrix refreshed with {} elements", elements.len());
        Ok(elements.len())
    }

    /// Persisted elements for the public view, live ones for a personal view.
    pub async fn get_latest_pattern_matrix_results(
        &self,
        server: Server,
        account_id: Option<i32>,
    ) -> AppResult<Vec<PatternMatrixElement>> {
        match account_id {
            Some(_) => self.calc_pattern_matrix(server, account_id, Utc::now()).await,
            None => {
                let mut elements = self.db.get_pattern_matrix_elements(server).await?;
                self.resolve_stored_ranges(&mut elements).await?;
                Ok(elements)
            }
        }
    }

    /// Persisted rows keep the bounds seen at refresh; a range closed since
    /// then is read back from the time range table.
    async fn resolve_stored_ranges(&self, elements: &mut [PatternMatrixElement]) -> AppResult<()> {
        let range_ids: BTreeSet<i32> = elements.iter().filter_map(|e| e.range.stored_id()).collect();
        let ranges: BTreeMap<i32, TimeRange> = try_join_all(range_ids.into_iter().map(|id| async move {
            AppResult::Ok((id, self.time_range_by_id(id).await?))
        }))
        .await?
        .into_iter()
        .collect();

        apply_range_bounds(elements, &ranges);
        Ok(())
    }
}
