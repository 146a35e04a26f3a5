//! Trend series: ad-hoc interval queries and the daily-element fast path

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};

use super::StatsService;
use crate::db::{ReportQueryContext, TotalQuantityResultForTrend, TotalTimesResultForTrend, TrendWindow};
use crate::error::{AppError, AppResult};
use crate::models::{
    drop_sets_by_stage, stage_item_filter, DropMatrixElement, ItemTrend, Server, SourceCategory, StageTrend,
    TrendElement, TrendQueryResult,
};

pub const MIN_INTERVAL_SECS: i64 = 60 * 60;
pub const DAY_SECS: i64 = 24 * 60 * 60;
pub const MAX_INTERVAL_DAYS: i64 = 3660;
pub const MAX_INTERVAL_SECS: i64 = MAX_INTERVAL_DAYS * DAY_SECS;

#[derive(Debug, Clone)]
pub struct TrendQuery {
    pub server: Server,
    pub start_time: DateTime<Utc>,
    pub interval_secs: i64,
    pub interval_num: i64,
    pub stage_filter: Option<Vec<i32>>,
    pub item_filter: Option<Vec<i32>>,
    pub account_id: Option<i32>,
    pub source_category: SourceCategory,
}

pub fn validate_trend_window(interval_secs: i64, interval_num: i64, max_intervals: i64) -> AppResult<()> {
    if interval_secs < MIN_INTERVAL_SECS {
        return Err(AppError::invalid("interval length must be greater than 1 hour"));
    }
    if interval_secs > MAX_INTERVAL_SECS {
        return Err(interval_too_long());
    }
    if interval_num <= 0 {
        return Err(AppError::invalid("trend window must contain at least one interval"));
    }
    if interval_num > max_intervals {
        return Err(AppError::invalid(format!(
            "too many sub-intervals: {} (max {})",
            interval_num, max_intervals
        )));
    }
    Ok(())
}

pub(crate) fn interval_too_long() -> AppError {
    AppError::invalid(format!("interval length must not exceed {} days", MAX_INTERVAL_DAYS))
}

/// End of `interval_num` buckets of `interval_secs` from `start`; rejected when it leaves the calendar range.
pub fn trend_window_end(start: DateTime<Utc>, interval_secs: i64, interval_num: i64) -> AppResult<DateTime<Utc>> {
    interval_secs
        .checked_mul(interval_num)
        .and_then(Duration::try_seconds)
        .and_then(|span| start.checked_add_signed(span))
        .ok_or_else(|| AppError::invalid("trend window is out of range"))
}

/// Per (group, stage, item) elements; drop-set items missing from the quantity
/// rows of a group with clears are zero-filled.
pub fn combine_trend_results(
    server: Server,
    source_category: SourceCategory,
    drop_sets: &BTreeMap<i32, BTreeSet<i32>>,
    quantities: &[TotalQuantityResultForTrend],
    times: &[TotalTimesResultForTrend],
) -> Vec<TrendElement> {
    let quantity_by_key: BTreeMap<(i32, i32, i32), i64> = quantities
        .iter()
        .map(|q| ((q.group_id, q.stage_id, q.item_id), q.total_quantity))
        .collect();

    let mut elements = Vec::new();
    for t in times {
        let Some(items) = drop_sets.get(&t.stage_id) else { continue };
        for &item_id in items {
            elements.push(TrendElement {
                server,
                source_category,
                stage_id: t.stage_id,
                item_id,
                group_id: t.group_id,
                start_time: t.interval_start,
                end_time: t.interval_end,
                quantity: quantity_by_key.get(&(t.group_id, t.stage_id, item_id)).copied().unwrap_or(0),
                times: t.total_times,
            });
        }
    }
    elements
}

/// Builds per-stage, per-item arrays of length `max(group_id) + 1`, then drops
/// the leading buckets without clears. `bucket_start(g)` is the start of group `g`.
pub fn assemble_trend(
    elements: &[TrendElement],
    interval_secs: i64,
    bucket_start: impl Fn(i32) -> DateTime<Utc>,
) -> TrendQueryResult {
    let mut by_stage: BTreeMap<i32, BTreeMap<i32, Vec<&TrendElement>>> = BTreeMap::new();
    for el in elements {
        by_stage
            .entry(el.stage_id)
            .or_default()
            .entry(el.item_id)
            .or_default()
            .push(el);
    }

    let mut trends = Vec::new();
    for (stage_id, items) in by_stage {
        let Some(max_group) = items.values().flatten().map(|e| e.group_id).max() else { continue };
        if max_group < 0 {
            continue;
        }
        let len = max_group as usize + 1;

        let mut results = Vec::new();
        for (item_id, series) in items {
            let mut quantity = vec![0i64; len];
            let mut times = vec![0i64; len];
            for el in series.iter().filter(|e| e.group_id >= 0) {
                quantity[el.group_id as usize] += el.quantity;
                times[el.group_id as usize] += el.times;
            }

            let Some(first) = times.iter().position(|&t| t > 0) else { continue };
            results.push(ItemTrend {
                item_id,
                start_time: bucket_start(first as i32),
                quantity: quantity.split_off(first),
                times: times.split_off(first),
            });
        }

        if !results.is_empty() {
            trends.push(StageTrend { stage_id, results });
        }
    }

    TrendQueryResult { interval_secs, trends }
}

/// Bins daily elements by `day_num - start_day` into a one-day trend.
pub fn bin_daily_elements(server: Server, elements: &[DropMatrixElement], start_day: i32) -> TrendQueryResult {
    let mut binned: BTreeMap<(i32, i32, i32), (SourceCategory, i64, i64)> = BTreeMap::new();
    for el in elements.iter().filter(|e| e.day_num >= start_day) {
        let entry = binned
            .entry((el.stage_id, el.item_id, el.day_num - start_day))
            .or_insert((el.source_category, 0, 0));
        entry.1 += el.quantity;
        entry.2 += el.times;
    }

    let trend_elements: Vec<TrendElement> = binned
        .into_iter()
        .map(|((stage_id, item_id, group_id), (source_category, quantity, times))| {
            let (start_time, end_time) = server.day_num_bounds(start_day + group_id);
            TrendElement {
                server,
                source_category,
                stage_id,
                item_id,
                group_id,
                start_time,
                end_time,
                quantity,
                times,
            }
        })
        .collect();

    assemble_trend(&trend_elements, DAY_SECS, |g| server.day_num_start(start_day + g))
}

impl StatsService {
    pub async fn query_trend(&self, query: &TrendQuery) -> AppResult<TrendQueryResult> {
        validate_trend_window(query.interval_secs, query.interval_num, self.query.max_intervals)?;

        let server = query.server;
        let start = server.game_day_start(query.start_time);
        let end = trend_window_end(start, query.interval_secs, query.interval_num)?;
        let cutoff = end.min(Utc::now());
        let empty = TrendQueryResult {
            interval_secs: query.interval_secs,
            trends: Vec::new(),
        };
        if cutoff <= start {
            return Ok(empty);
        }

        let infos = self
            .db
            .get_drop_infos_overlapping(
                server,
                start,
                cutoff,
                query.stage_filter.as_deref(),
                query.item_filter.as_deref(),
            )
            .await?;

        let mut ctx = ReportQueryContext::new(server, start, cutoff);
        ctx.account_id = query.account_id;
        ctx.source_category = query.source_category;
        ctx.stage_item_filter = stage_item_filter(&infos);
        if ctx.stage_item_filter.is_empty() {
            return Ok(empty);
        }
        let window = TrendWindow {
            start_time: start,
            interval_secs: query.interval_secs,
            interval_num: query.interval_num,
        };

        let (quantities, times) = tokio::try_join!(
            self.db.calc_total_quantity_for_trend(&ctx, &window),
            self.db.calc_total_times_for_trend(&ctx, &window),
        )?;

        let elements = combine_trend_results(
            server,
            query.source_category,
            &drop_sets_by_stage(&infos),
            &quantities,
            &times,
        );
        // Every bucket start lies before the checked window end.
        let interval = Duration::seconds(query.interval_secs);
        Ok(assemble_trend(&elements, query.interval_secs, |g| start + interval * g))
    }

    /// Last `trend_days` game days read from the persisted daily elements.
    pub async fn calc_global_trend(&self, server: Server, source_category: SourceCategory) -> AppResult<TrendQueryResult> {
        let today = server.day_num(Utc::now());
        let start_day = today - self.query.trend_days + 1;
        let elements = self
            .db
            .get_drop_matrix_elements_by_day_num_range(server, source_category, start_day, today)
            .await?;
        Ok(bin_daily_elements(server, &elements, start_day))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QuantityBuckets, RangeRef};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 20, 0, 0).single().unwrap()
    }

    fn times_row(group_id: i32, stage_id: i32, total_times: i64) -> TotalTimesResultForTrend {
        TotalTimesResultForTrend {
            group_id,
            interval_start: start() + Duration::days(group_id as i64),
            interval_end: start() + Duration::days(group_id as i64 + 1),
            stage_id,
            total_times,
        }
    }

    fn quantity_row(group_id: i32, stage_id: i32, item_id: i32, total_quantity: i64) -> TotalQuantityResultForTrend {
        TotalQuantityResultForTrend {
            group_id,
            interval_start: start() + Duration::days(group_id as i64),
            interval_end: start() + Duration::days(group_id as i64 + 1),
            stage_id,
            item_id,
            total_quantity,
        }
    }

    #[test]
    fn sub_hour_intervals_are_rejected() {
        let err = validate_trend_window(30 * 60, 7, 100).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert!(err.to_string().contains("interval length must be greater than 1 hour"));
        assert!(validate_trend_window(DAY_SECS, 101, 100).is_err());
        assert!(validate_trend_window(DAY_SECS, 0, 100).is_err());
        assert!(validate_trend_window(MIN_INTERVAL_SECS, 100, 100).is_ok());
    }

    #[test]
    fn oversized_windows_are_rejected() {
        let err = validate_trend_window(MAX_INTERVAL_SECS + MIN_INTERVAL_SECS, 1, 100).unwrap_err();
        assert_eq!(err.to_string(), "interval length must not exceed 3660 days");
        assert!(validate_trend_window(MAX_INTERVAL_SECS, 1, 100).is_ok());

        assert_eq!(
            trend_window_end(start(), DAY_SECS, 3).unwrap(),
            start() + Duration::days(3)
        );
        assert!(trend_window_end(start(), i64::MAX / 2, 3).is_err());
        assert!(trend_window_end(start(), MAX_INTERVAL_SECS, i64::MAX).is_err());
        assert!(trend_window_end(start(), MAX_INTERVAL_SECS, 100_000).is_err());
    }

    #[test]
    fn series_are_filled_and_leading_empty_buckets_stripped() {
        let drop_sets = BTreeMap::from([(1, BTreeSet::from([10, 11]))]);
        let times = vec![times_row(2, 1, 4), times_row(3, 1, 5), times_row(6, 1, 2)];
        let quantities = vec![quantity_row(2, 1, 10, 3), quantity_row(6, 1, 10, 1)];
        let elements = combine_trend_results(Server::CN, SourceCategory::All, &drop_sets, &quantities, &times);
        assert_eq!(elements.len(), 6);

        let result = assemble_trend(&elements, DAY_SECS, |g| start() + Duration::days(g as i64));
        assert_eq!(result.interval_secs, DAY_SECS);
        assert_eq!(result.trends.len(), 1);
        let item = &result.trends[0].results[0];
        assert_eq!(item.item_id, 10);
        assert_eq!(item.quantity, vec![3, 0, 0, 0, 1]);
        assert_eq!(item.times, vec![4, 5, 0, 0, 2]);
        assert_eq!(item.start_time, start() + Duration::days(2));
        assert!(item.times[0] > 0);

        let zero_item = &result.trends[0].results[1];
        assert_eq!(zero_item.quantity, vec![0, 0, 0, 0, 0]);
        assert_eq!(zero_item.times.len(), 5);
    }

    #[test]
    fn full_window_keeps_every_bucket() {
        let drop_sets = BTreeMap::from([(1, BTreeSet::from([10]))]);
        let times: Vec<_> = (0..7).map(|g| times_row(g, 1, 3)).collect();
        let quantities: Vec<_> = (0..7).map(|g| quantity_row(g, 1, 10, 1)).collect();
        let elements = combine_trend_results(Server::CN, SourceCategory::All, &drop_sets, &quantities, &times);
        let result = assemble_trend(&elements, DAY_SECS, |g| start() + Duration::days(g as i64));
        let item = &result.trends[0].results[0];
        assert_eq!(item.times.len(), 7);
        assert_eq!(item.start_time, start());
    }

    #[test]
    fn daily_elements_bin_by_day_offset() {
        let server = Server::US;
        let start_day = 19_800;
        let element = |day_num: i32, range_id: i32, quantity: i64, times: i64| {
            let (start_time, end_time) = server.day_num_bounds(day_num);
            DropMatrixElement {
                server,
                source_category: SourceCategory::All,
                stage_id: 1,
                item_id: 10,
                range: RangeRef::Stored(range_id),
                quantity,
                times,
                quantity_buckets: QuantityBuckets::new(),
                day_num,
                start_time,
                end_time,
            }
        };
        let elements = vec![
            element(start_day + 2, 1, 2, 3),
            element(start_day + 2, 2, 1, 1),
            element(start_day + 4, 2, 5, 6),
            element(start_day - 1, 1, 9, 9),
        ];
        let result = bin_daily_elements(server, &elements, start_day);
        let item = &result.trends[0].results[0];
        assert_eq!(item.quantity, vec![3, 0, 5]);
        assert_eq!(item.times, vec![4, 0, 6]);
        assert_eq!(item.start_time, server.day_num_start(start_day + 2));
    }
}
