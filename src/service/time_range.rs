//! Time-range resolution: maximum accumulable chains and latest ranges

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use super::StatsService;
use crate::cache::StageItemRanges;
use crate::error::{AppError, AppResult};
use crate::models::{DropInfo, Server, TimeRange};

/// Per (stage, item): ranges ordered by start time descending, cut after the
/// first non-accumulable one. Ranges that have not started yet are ignored.
pub fn max_accumulable_chains(
    infos: &[DropInfo],
    ranges: &BTreeMap<i32, TimeRange>,
    now: DateTime<Utc>,
) -> StageItemRanges {
    // (stage, item) -> range id -> accumulable
    let mut grouped: BTreeMap<(i32, i32), HashMap<i32, bool>> = BTreeMap::new();
    for info in infos {
        let Some(item_id) = info.item_id else { continue };
        grouped
            .entry((info.stage_id, item_id))
            .or_default()
            .entry(info.range_id)
            .and_modify(|acc| *acc = *acc && info.accumulable)
            .or_insert(info.accumulable);
    }

    let mut chains = StageItemRanges::new();
    for ((stage_id, item_id), by_range) in grouped {
        let mut candidates: Vec<(&TimeRange, bool)> = by_range
            .iter()
            .filter_map(|(range_id, acc)| ranges.get(range_id).map(|r| (r, *acc)))
            .filter(|(r, _)| r.start_time <= now)
            .collect();
        candidates.sort_by(|a, b| b.0.start_time.cmp(&a.0.start_time));

        let mut chain = Vec::new();
        for (range, accumulable) in candidates {
            chain.push(range.clone());
            if !accumulable {
                break;
            }
        }
        if !chain.is_empty() {
            chains.entry(stage_id).or_default().insert(item_id, chain);
        }
    }
    chains
}

/// The most recent started range per stage.
pub fn latest_ranges(
    infos: &[DropInfo],
    ranges: &BTreeMap<i32, TimeRange>,
    now: DateTime<Utc>,
) -> BTreeMap<i32, TimeRange> {
    let mut latest: BTreeMap<i32, TimeRange> = BTreeMap::new();
    for info in infos {
        let Some(range) = ranges.get(&info.range_id) else { continue };
        if range.start_time > now {
            continue;
        }
        match latest.get(&info.stage_id) {
            Some(current) if current.start_time >= range.start_time => {}
            _ => {
                latest.insert(info.stage_id, range.clone());
            }
        }
    }
    latest
}

/// Distinct ranges appearing in any chain, by range id.
pub fn chain_ranges(chains: &StageItemRanges) -> BTreeMap<i32, TimeRange> {
    chains
        .values()
        .flat_map(|items| items.values())
        .flatten()
        .filter_map(|r| r.range.stored_id().map(|id| (id, r.clone())))
        .collect()
}

impl StatsService {
    pub async fn time_ranges_by_server(&self, server: Server) -> AppResult<Vec<TimeRange>> {
        let key = self.caches.time_ranges.key(&[server.as_str()]);
        let (ranges, _) = self
            .caches
            .time_ranges
            .mutex_get_set(&key, || async {
                self.db.get_time_ranges_by_server(server).await.map_err(AppError::from)
            })
            .await?;
        Ok(ranges)
    }

    pub async fn time_ranges_map_by_server(&self, server: Server) -> AppResult<BTreeMap<i32, TimeRange>> {
        let key = self.caches.time_ranges_map.key(&[server.as_str()]);
        let (map, _) = self
            .caches
            .time_ranges_map
            .mutex_get_set(&key, || async {
                let ranges = self.time_ranges_by_server(server).await?;
                Ok::<_, AppError>(
                    ranges
                        .into_iter()
                        .filter_map(|r| r.range.stored_id().map(|id| (id, r)))
                        .collect(),
                )
            })
            .await?;
        Ok(map)
    }

    pub async fn time_range_by_id(&self, range_id: i32) -> AppResult<TimeRange> {
        let key = self.caches.time_range.key(&[&range_id.to_string()]);
        let (range, _) = self
            .caches
            .time_range
            .mutex_get_set(&key, || async {
                self.db
                    .get_time_range_by_id(range_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("time range {} not found", range_id)))
            })
            .await?;
        Ok(range)
    }

    pub async fn max_accumulable_time_ranges_by_server(&self, server: Server) -> AppResult<StageItemRanges> {
        let key = self.caches.max_accumulable_time_ranges.key(&[server.as_str()]);
        let (chains, _) = self
            .caches
            .max_accumulable_time_ranges
            .mutex_get_set(&key, || async {
                let (infos, ranges) =
                    tokio::try_join!(self.drop_infos_by_server(server), self.time_ranges_map_by_server(server))?;
                Ok::<_, AppError>(max_accumulable_chains(&infos, &ranges, Utc::now()))
            })
            .await?;
        Ok(chains)
    }

    pub async fn latest_time_ranges_by_server(&self, server: Server) -> AppResult<BTreeMap<i32, TimeRange>> {
        let key = self.caches.latest_time_ranges.key(&[server.as_str()]);
        let (latest, _) = self
            .caches
            .latest_time_ranges
            .mutex_get_set(&key, || async {
                let (infos, ranges) =
                    tokio::try_join!(self.drop_infos_by_server(server), self.time_ranges_map_by_server(server))?;
                Ok::<_, AppError>(latest_ranges(&infos, &ranges, Utc::now()))
            })
            .await?;
        Ok(latest)
    }

    async fn drop_infos_by_server(&self, server: Server) -> AppResult<Vec<DropInfo>> {
        Ok(self.db.get_drop_infos_by_server(server).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RangeEnd, RangeRef};
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).single().unwrap()
    }

    fn range(id: i32, start: u32, end: Option<u32>) -> TimeRange {
        TimeRange {
            range: RangeRef::Stored(id),
            server: Server::CN,
            start_time: day(start),
            end: end.map(|e| RangeEnd::ClosedAt(day(e))).unwrap_or(RangeEnd::Open),
        }
    }

    fn info(stage_id: i32, item_id: Option<i32>, range_id: i32, accumulable: bool) -> DropInfo {
        DropInfo {
            drop_id: 0,
            server: Server::CN,
            stage_id,
            item_id,
            drop_type: "NORMAL_DROP".into(),
            range_id,
            accumulable,
            bounds: None,
        }
    }

    fn ranges() -> BTreeMap<i32, TimeRange> {
        [range(1, 1, Some(5)), range(2, 5, Some(10)), range(3, 10, Some(15)), range(4, 15, None), range(5, 28, None)]
            .into_iter()
            .map(|r| (r.range.stored_id().unwrap(), r))
            .collect()
    }

    fn ids(chain: &[TimeRange]) -> Vec<i32> {
        chain.iter().filter_map(|r| r.range.stored_id()).collect()
    }

    #[test]
    fn chain_stops_at_first_non_accumulable_inclusive() {
        let infos = vec![
            info(1, Some(10), 1, true),
            info(1, Some(10), 2, false),
            info(1, Some(10), 3, true),
            info(1, Some(10), 4, true),
        ];
        let chains = max_accumulable_chains(&infos, &ranges(), day(20));
        assert_eq!(ids(&chains[&1][&10]), vec![4, 3, 2]);
    }

    #[test]
    fn non_accumulable_latest_range_stands_alone() {
        let infos = vec![info(1, Some(10), 3, true), info(1, Some(10), 4, false)];
        let chains = max_accumulable_chains(&infos, &ranges(), day(20));
        assert_eq!(ids(&chains[&1][&10]), vec![4]);
    }

    #[test]
    fn future_ranges_and_type_level_infos_are_skipped() {
        let infos = vec![
            info(1, Some(10), 4, true),
            info(1, Some(10), 5, true),
            info(1, None, 4, true),
            info(2, Some(11), 5, true),
        ];
        let chains = max_accumulable_chains(&infos, &ranges(), day(20));
        assert_eq!(ids(&chains[&1][&10]), vec![4]);
        assert!(!chains.contains_key(&2));
        assert_eq!(chain_ranges(&chains).keys().copied().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn duplicate_infos_for_one_range_collapse() {
        let infos = vec![info(1, Some(10), 3, true), info(1, Some(10), 3, true), info(1, Some(10), 2, true)];
        let chains = max_accumulable_chains(&infos, &ranges(), day(20));
        assert_eq!(ids(&chains[&1][&10]), vec![3, 2]);
    }

    #[test]
    fn latest_range_per_stage() {
        let infos = vec![
            info(1, Some(10), 2, true),
            info(1, None, 3, true),
            info(2, Some(10), 4, true),
            info(2, Some(10), 5, true),
        ];
        let latest = latest_ranges(&infos, &ranges(), day(20));
        assert_eq!(latest[&1].range, RangeRef::Stored(3));
        assert_eq!(latest[&2].range, RangeRef::Stored(4));

        let later = latest_ranges(&infos, &ranges(), day(29));
        assert_eq!(later[&2].range, RangeRef::Stored(5));
    }
}
