//! Drop matrix: per (stage, item, range) elements and their chain reduction

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use super::stddev::{round_std_dev, Moments};
use super::time_range::chain_ranges;
use super::StatsService;
use crate::cache::StageItemRanges;
use crate::db::{QuantityUniqCountResultForDropMatrix, ReportQueryContext, TotalQuantityResultForDropMatrix, TotalTimesResult};
use crate::error::AppResult;
use crate::models::{
    drop_sets_by_stage, max_per_report_bound, stage_item_filter, DropInfo, DropMatrixElement, OneDropMatrixElement,
    QuantityBuckets, RangeRef, Server, SourceCategory, TimeRange,
};

#[derive(Debug, Clone)]
pub struct DropMatrixQuery {
    pub server: Server,
    pub ranges: Vec<TimeRange>,
    pub stage_filter: Option<Vec<i32>>,
    pub item_filter: Option<Vec<i32>>,
    pub account_id: Option<i32>,
    pub source_category: SourceCategory,
    pub exclude_non_one_times: bool,
}

impl DropMatrixQuery {
    pub fn new(server: Server, ranges: Vec<TimeRange>, source_category: SourceCategory) -> Self {
        Self {
            server,
            ranges,
            stage_filter: None,
            item_filter: None,
            account_id: None,
            source_category,
            exclude_non_one_times: source_category.exclude_non_one_times(),
        }
    }
}

/// Totals of one range, before zero-filling.
#[derive(Debug, Default)]
pub struct RangeTotals {
    pub quantities: Vec<TotalQuantityResultForDropMatrix>,
    pub times: Vec<TotalTimesResult>,
    pub uniq_counts: Vec<QuantityUniqCountResultForDropMatrix>,
}

/// Joins the three per-metric results of one range into elements.
///
/// Every item of a stage's drop set gets an element when the stage has clears;
/// items nobody reported get `quantity = 0` and `buckets = {0: times}`.
pub fn combine_drop_matrix_results(
    server: Server,
    source_category: SourceCategory,
    range: &TimeRange,
    infos: &[DropInfo],
    totals: RangeTotals,
) -> Vec<DropMatrixElement> {
    let start_time = range.start_time;
    let end_time = range.end.clamp(DateTime::<Utc>::MAX_UTC);
    let day_num = server.day_num(start_time);

    let times_by_stage: BTreeMap<i32, i64> = totals.times.iter().map(|t| (t.stage_id, t.total_times)).collect();
    let quantity_by_key: BTreeMap<(i32, i32), i64> = totals
        .quantities
        .iter()
        .map(|q| ((q.stage_id, q.item_id), q.total_quantity))
        .collect();
    let mut buckets_by_key: BTreeMap<(i32, i32), QuantityBuckets> = BTreeMap::new();
    for u in &totals.uniq_counts {
        *buckets_by_key
            .entry((u.stage_id, u.item_id))
            .or_default()
            .entry(u.quantity)
            .or_insert(0) += u.count;
    }

    let mut elements = Vec::new();
    for (stage_id, mut drop_set) in drop_sets_by_stage(infos) {
        let Some(&times) = times_by_stage.get(&stage_id) else { continue };
        if times <= 0 {
            continue;
        }

        let reported: Vec<i32> = quantity_by_key
            .range((stage_id, i32::MIN)..=(stage_id, i32::MAX))
            .map(|(&(_, item_id), _)| item_id)
            .collect();
        for item_id in reported {
            if !drop_set.remove(&item_id) {
                continue;
            }
            let quantity = quantity_by_key.get(&(stage_id, item_id)).copied().unwrap_or(0);
            let quantity_buckets = buckets_by_key.remove(&(stage_id, item_id)).unwrap_or_default();

            let bucket_total: i64 = quantity_buckets.values().sum();
            if bucket_total > times {
                warn!(server = %server, stage_id, item_id, bucket_total, times, "Quantity buckets exceed times");
            }
            if let Some(upper) = max_per_report_bound(infos, stage_id, item_id) {
                if upper > 0 && quantity > times * upper as i64 {
                    warn!(server = %server, stage_id, item_id, quantity, times, upper, "Quantity exceeds per-report bound");
                }
            }

            elements.push(DropMatrixElement {
                server,
                source_category,
                stage_id,
                item_id,
                range: range.range,
                quantity,
                times,
                quantity_buckets,
                day_num,
                start_time,
                end_time,
            });
        }

        for item_id in drop_set {
            elements.push(DropMatrixElement {
                server,
                source_category,
                stage_id,
                item_id,
                range: range.range,
                quantity: 0,
                times,
                quantity_buckets: QuantityBuckets::from([(0, times)]),
                day_num,
                start_time,
                end_time,
            });
        }
    }
    elements
}

/// Folds elements over each (stage, item)'s chain into one result.
pub fn reduce_max_accumulable(elements: &[DropMatrixElement], chains: &StageItemRanges) -> Vec<OneDropMatrixElement> {
    let mut by_key: BTreeMap<(i32, i32), Vec<&DropMatrixElement>> = BTreeMap::new();
    for el in elements {
        by_key.entry((el.stage_id, el.item_id)).or_default().push(el);
    }

    let mut results = Vec::new();
    for (&stage_id, items) in chains {
        for (&item_id, chain) in items {
            let (Some(latest), Some(earliest)) = (chain.first(), chain.last()) else { continue };
            let Some(candidates) = by_key.get(&(stage_id, item_id)) else { continue };
            let chain_ids: HashSet<RangeRef> = chain.iter().map(|r| r.range).collect();

            let mut quantity = 0;
            let mut times = 0;
            let mut moments = Moments::EMPTY;
            for el in candidates.iter().filter(|el| chain_ids.contains(&el.range)) {
                quantity += el.quantity;
                times += el.times;
                moments = moments.merge(Moments::from_buckets(&el.quantity_buckets, el.times));
            }
            if times <= 0 {
                continue;
            }

            results.push(OneDropMatrixElement {
                stage_id,
                item_id,
                quantity,
                times,
                std_dev: round_std_dev(moments.std_dev),
                start_time: earliest.start_time,
                end: latest.end,
            });
        }
    }
    results
}

impl StatsService {
    /// One element per (stage, item, range). Open range ends are clamped to
    /// `unified_end` so every per-metric query sees the same cutoff.
    pub async fn query_drop_matrix(
        &self,
        query: &DropMatrixQuery,
        unified_end: DateTime<Utc>,
    ) -> AppResult<Vec<DropMatrixElement>> {
        let ranges: Vec<TimeRange> = query
            .ranges
            .iter()
            .filter_map(|r| r.intersect(r.start_time, unified_end))
            .collect();
        if ranges.is_empty() {
            return Ok(Vec::new());
        }

        let stored_ids: Vec<i32> = ranges.iter().filter_map(|r| r.range.stored_id()).collect();
        let stored_infos = self
            .db
            .get_drop_infos_by_range_ids(
                query.server,
                &stored_ids,
                query.stage_filter.as_deref(),
                query.item_filter.as_deref(),
            )
            .await?;

        let per_range = try_join_all(ranges.iter().map(|range| {
            let stored_infos = &stored_infos;
            async move {
                let infos: Vec<DropInfo> = match range.range {
                    RangeRef::Stored(id) => stored_infos.iter().filter(|i| i.range_id == id).cloned().collect(),
                    RangeRef::AdHoc => {
                        self.db
                            .get_drop_infos_overlapping(
                                query.server,
                                range.start_time,
                                range.end.clamp(unified_end),
                                query.stage_filter.as_deref(),
                                query.item_filter.as_deref(),
                            )
                            .await?
                    }
                };
                self.query_range(query, range, infos).await
            }
        }))
        .await?;

        let elements: Vec<DropMatrixElement> = per_range.into_iter().flatten().collect();
        debug!(server = %query.server, ranges = ranges.len(), "Drop matrix computed {} elements", elements.len());
        Ok(elements)
    }

    async fn query_range(
        &self,
        query: &DropMatrixQuery,
        range: &TimeRange,
        infos: Vec<DropInfo>,
    ) -> AppResult<Vec<DropMatrixElement>> {
        let filter = stage_item_filter(&infos);
        if filter.is_empty() {
            return Ok(Vec::new());
        }

        let mut ctx = ReportQueryContext::new(query.server, range.start_time, range.end.clamp(DateTime::<Utc>::MAX_UTC));
        ctx.account_id = query.account_id;
        ctx.source_category = query.source_category;
        ctx.stage_item_filter = filter;
        ctx.exclude_non_one_times = query.exclude_non_one_times;

        let (quantities, times, uniq_counts) = tokio::try_join!(
            self.db.calc_total_quantity_for_drop_matrix(&ctx),
            self.db.calc_total_times(&ctx),
            self.db.calc_quantity_uniq_count_for_drop_matrix(&ctx),
        )?;

        Ok(combine_drop_matrix_results(
            query.server,
            query.source_category,
            range,
            &infos,
            RangeTotals {
                quantities,
                times,
                uniq_counts,
            },
        ))
    }

    /// Chain-reduced results: persisted daily elements for the public view,
    /// ad-hoc per-range elements for a personal one.
    pub async fn get_max_accumulable_drop_matrix_results(
        &self,
        server: Server,
        source_category: SourceCategory,
        account_id: Option<i32>,
    ) -> AppResult<Vec<OneDropMatrixElement>> {
        let chains = self.max_accumulable_time_ranges_by_server(server).await?;
        let ranges = chain_ranges(&chains);

        let elements = match account_id {
            Some(account_id) => {
                let mut query = DropMatrixQuery::new(server, ranges.into_values().collect(), source_category);
                query.account_id = Some(account_id);
                self.query_drop_matrix(&query, Utc::now()).await?
            }
            None => {
                let range_ids: Vec<i32> = ranges.keys().copied().collect();
                self.db
                    .get_drop_matrix_elements_by_range_ids(server, source_category, &range_ids)
                    .await?
            }
        };

        Ok(reduce_max_accumulable(&elements, &chains))
    }

    /// Elements of one game day over every chain range that overlaps it.
    pub async fn calc_drop_matrix_for_day(
        &self,
        server: Server,
        source_category: SourceCategory,
        day_num: i32,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<DropMatrixElement>> {
        let (day_start, day_end) = server.day_num_bounds(day_num);
        let chains = self.max_accumulable_time_ranges_by_server(server).await?;
        let ranges: Vec<TimeRange> = chain_ranges(&chains)
            .values()
            .filter_map(|r| r.intersect(day_start, day_end))
            .collect();

        let query = DropMatrixQuery::new(server, ranges, source_category);
        self.query_drop_matrix(&query, now).await
    }

    /// Drop matrix over a bespoke range, one result per (stage, item).
    pub async fn get_customized_drop_matrix_results(
        &self,
        range: TimeRange,
        stage_ids: Vec<i32>,
        item_ids: Option<Vec<i32>>,
        account_id: Option<i32>,
        source_category: SourceCategory,
    ) -> AppResult<Vec<OneDropMatrixElement>> {
        let mut query = DropMatrixQuery::new(range.server, vec![range.clone()], source_category);
        query.exclude_non_one_times = false;
        query.stage_filter = Some(stage_ids);
        query.item_filter = item_ids;
        query.account_id = account_id;

        let elements = self.query_drop_matrix(&query, Utc::now()).await?;
        Ok(elements
            .into_iter()
            .filter(|el| el.times > 0)
            .map(|el| OneDropMatrixElement {
                stage_id: el.stage_id,
                item_id: el.item_id,
                quantity: el.quantity,
                times: el.times,
                std_dev: round_std_dev(Moments::from_buckets(&el.quantity_buckets, el.times).std_dev),
                start_time: range.start_time,
                end: range.end,
            })
            .collect())
    }
}
