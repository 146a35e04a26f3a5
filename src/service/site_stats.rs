//! Per-server totals for the front page

use chrono::{Duration, Utc};
use std::collections::BTreeMap;

use super::{Cached, GameData, StatsService};
use crate::db::{ReportQueryContext, TotalTimesResult};
use crate::error::AppResult;
use crate::models::shim::{ShimItemQuantity, ShimSiteStats, ShimStageTimes};
use crate::models::{Server, SourceCategory};

/// Daily rows repeat a stage's clears once per item, so a stage's total is the
/// largest per-item `times` sum.
pub fn site_stats_from_totals(
    all_time: &[(i32, i32, i64, i64)],
    last_day: &[TotalTimesResult],
    game_data: &GameData,
) -> ShimSiteStats {
    let mut stage_times: BTreeMap<i32, i64> = BTreeMap::new();
    let mut item_quantities: BTreeMap<i32, i64> = BTreeMap::new();
    for &(stage_id, item_id, quantity, times) in all_time {
        let entry = stage_times.entry(stage_id).or_insert(0);
        *entry = (*entry).max(times);
        *item_quantities.entry(item_id).or_insert(0) += quantity;
    }

    let stage_list = |totals: &mut dyn Iterator<Item = (i32, i64)>| {
        let mut list: Vec<ShimStageTimes> = totals
            .filter(|&(_, times)| times > 0)
            .filter_map(|(stage_id, times)| {
                Some(ShimStageTimes {
                    stage_id: game_data.ark_stage_id(stage_id)?.to_string(),
                    times,
                })
            })
            .collect();
        list.sort_by(|a, b| b.times.cmp(&a.times).then_with(|| a.stage_id.cmp(&b.stage_id)));
        list
    };

    let mut total_item_quantities: Vec<ShimItemQuantity> = item_quantities
        .into_iter()
        .filter(|&(_, quantity)| quantity > 0)
        .filter_map(|(item_id, quantity)| {
            Some(ShimItemQuantity {
                item_id: game_data.ark_item_id(item_id)?.to_string(),
                quantity,
            })
        })
        .collect();
    total_item_quantities.sort_by(|a, b| b.quantity.cmp(&a.quantity).then_with(|| a.item_id.cmp(&b.item_id)));

    ShimSiteStats {
        total_stage_times: stage_list(&mut stage_times.into_iter()),
        total_stage_times_24h: stage_list(&mut last_day.iter().map(|t| (t.stage_id, t.total_times))),
        total_item_quantities,
    }
}

impl StatsService {
    pub async fn get_shim_site_stats(&self, server: Server) -> AppResult<Cached<ShimSiteStats>> {
        let game_data = self.game_data().await?;
        let key = self.caches.shim_site_stats.key(&[server.as_str()]);
        self.read_through(&self.caches.shim_site_stats, &key, || async {
            let now = Utc::now();
            let mut ctx = ReportQueryContext::new(server, now - Duration::hours(24), now);
            ctx.stage_item_filter = game_data.stage_ids().map(|id| (id, Vec::new())).collect();

            let (all_time, last_day) = tokio::try_join!(
                self.db.get_drop_matrix_totals(server, SourceCategory::All),
                self.db.calc_total_times(&ctx),
            )?;
            Ok(site_stats_from_totals(&all_time, &last_day, &game_data))
        })
        .await
    }
}
