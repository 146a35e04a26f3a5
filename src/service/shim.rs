//! Projection to the public wire schema and the cached read paths built on it

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use super::trend::{
    interval_too_long, trend_window_end, validate_trend_window, TrendQuery, MAX_INTERVAL_SECS, MIN_INTERVAL_SECS,
};
use super::{Cached, GameData, StatsService};
use crate::error::{AppError, AppResult};
use crate::models::shim::{
    ShimAdvancedQueryResult, ShimAdvancedResult, ShimDrop, ShimDropMatrixQueryResult, ShimOneDropMatrixElement,
    ShimOneItemTrend, ShimOnePatternMatrixElement, ShimPattern, ShimPatternMatrixQueryResult, ShimStageTrend,
    ShimTrendQueryResult,
};
use crate::models::{
    DropPatternElement, OneDropMatrixElement, PatternMatrixElement, RangeEnd, Server, SourceCategory, TimeRange,
    TrendQueryResult,
};

const HOUR_MILLIS: i64 = MIN_INTERVAL_SECS * 1000;

/// `id:qty` pairs sorted by ark item id then quantity, joined by `|`.
pub fn canonical_pattern(drops: &[(String, i32)]) -> String {
    let mut sorted: Vec<&(String, i32)> = drops.iter().collect();
    sorted.sort();
    sorted
        .iter()
        .map(|(id, qty)| format!("{}:{}", id, qty))
        .collect::<Vec<_>>()
        .join("|")
}

/// Hex SHA-256 of the canonical pattern.
pub fn pattern_hash(drops: &[(String, i32)]) -> String {
    hex::encode(Sha256::digest(canonical_pattern(drops).as_bytes()))
}

pub fn shim_drop_matrix(results: &[OneDropMatrixElement], game_data: &GameData) -> ShimDropMatrixQueryResult {
    let matrix = results
        .iter()
        .filter_map(|r| {
            Some(ShimOneDropMatrixElement {
                stage_id: game_data.ark_stage_id(r.stage_id)?.to_string(),
                item_id: game_data.ark_item_id(r.item_id)?.to_string(),
                quantity: r.quantity,
                times: r.times,
                std_dev: r.std_dev,
                start: r.start_time.timestamp_millis(),
                end: r.end.to_millis(),
            })
        })
        .collect();
    ShimDropMatrixQueryResult { matrix }
}

/// Keeps elements whose ark stage / item id is in the given sets.
pub fn filter_drop_matrix(
    mut result: ShimDropMatrixQueryResult,
    stages: Option<&BTreeSet<String>>,
    items: Option<&BTreeSet<String>>,
) -> ShimDropMatrixQueryResult {
    result.matrix.retain(|el| {
        stages.map_or(true, |s| s.contains(&el.stage_id)) && items.map_or(true, |i| i.contains(&el.item_id))
    });
    result
}

pub fn shim_pattern_matrix(
    elements: &[PatternMatrixElement],
    patterns: &BTreeMap<i32, Vec<DropPatternElement>>,
    game_data: &GameData,
) -> ShimPatternMatrixQueryResult {
    let pattern_matrix = elements
        .iter()
        .filter_map(|el| {
            let mut drops: Vec<(String, i32)> = patterns
                .get(&el.pattern_id)?
                .iter()
                .filter_map(|d| game_data.ark_item_id(d.item_id).map(|ark| (ark.to_string(), d.quantity)))
                .collect();
            drops.sort();
            Some(ShimOnePatternMatrixElement {
                stage_id: game_data.ark_stage_id(el.stage_id)?.to_string(),
                pattern: ShimPattern {
                    drops: drops
                        .into_iter()
                        .map(|(item_id, quantity)| ShimDrop { item_id, quantity })
                        .collect(),
                },
                quantity: el.quantity,
                times: el.times,
                start: el.start_time.timestamp_millis(),
                end: el.end.to_millis(),
            })
        })
        .collect();
    ShimPatternMatrixQueryResult { pattern_matrix }
}

pub fn shim_trend(result: &TrendQueryResult, game_data: &GameData) -> ShimTrendQueryResult {
    let mut trend = BTreeMap::new();
    for stage in &result.trends {
        let Some(ark_stage_id) = game_data.ark_stage_id(stage.stage_id) else { continue };
        let results: BTreeMap<String, ShimOneItemTrend> = stage
            .results
            .iter()
            .filter_map(|item| {
                let ark_item_id = game_data.ark_item_id(item.item_id)?;
                Some((
                    ark_item_id.to_string(),
                    ShimOneItemTrend {
                        quantity: item.quantity.clone(),
                        times: item.times.clone(),
                        start_time: item.start_time.timestamp_millis(),
                    },
                ))
            })
            .collect();
        let Some(start_time) = results.values().map(|r| r.start_time).min() else { continue };
        trend.insert(ark_stage_id.to_string(), ShimStageTrend { results, start_time });
    }
    ShimTrendQueryResult {
        interval: result.interval_secs * 1000,
        trend,
    }
}

/// One entry of an advanced query body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedQuery {
    pub server: Server,
    pub stage_id: String,
    #[serde(default)]
    pub item_ids: Vec<String>,
    #[serde(default)]
    pub is_personal: bool,
    #[serde(default)]
    pub source_category: Option<SourceCategory>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    /// Milliseconds; present means a trend query.
    pub interval: Option<i64>,
}

impl AdvancedQuery {
    fn start_time(&self) -> AppResult<DateTime<Utc>> {
        let start = self.start.ok_or_else(|| AppError::invalid("start is required"))?;
        DateTime::from_timestamp_millis(start).ok_or_else(|| AppError::invalid(format!("invalid start {}", start)))
    }

    /// Absent or zero means "until now".
    fn end(&self) -> AppResult<RangeEnd> {
        match self.end {
            None | Some(0) => Ok(RangeEnd::Open),
            Some(end) => DateTime::from_timestamp_millis(end)
                .map(RangeEnd::ClosedAt)
                .ok_or_else(|| AppError::invalid(format!("invalid end {}", end))),
        }
    }

    /// Whole hours, at least one.
    fn interval_secs(&self, interval_ms: i64) -> AppResult<i64> {
        if interval_ms < HOUR_MILLIS {
            return Err(AppError::invalid("interval length must be greater than 1 hour"));
        }
        if interval_ms > MAX_INTERVAL_SECS * 1000 {
            return Err(interval_too_long());
        }
        Ok((interval_ms + HOUR_MILLIS / 2) / HOUR_MILLIS * MIN_INTERVAL_SECS)
    }

    /// Bucket start, bucket length in seconds and bucket count of a trend query.
    fn trend_window(&self, interval_ms: i64) -> AppResult<(DateTime<Utc>, i64, i64)> {
        let interval_secs = self.interval_secs(interval_ms)?;
        let start = self.server.game_day_start(self.start_time()?);
        let end = self.end()?.clamp(Utc::now());
        if end <= start {
            return Err(AppError::invalid("end must be later than start"));
        }
        let span = (end - start).num_seconds();
        Ok((start, interval_secs, (span + interval_secs - 1) / interval_secs))
    }

    /// Checks everything that does not need game data or the database.
    fn validate(&self, max_intervals: i64) -> AppResult<()> {
        match self.interval {
            Some(interval_ms) => {
                let (start, interval_secs, interval_num) = self.trend_window(interval_ms)?;
                validate_trend_window(interval_secs, interval_num, max_intervals)?;
                trend_window_end(start, interval_secs, interval_num).map(|_| ())
            }
            None => {
                let start = self.start_time()?;
                if !self.end()?.is_after(start) {
                    return Err(AppError::invalid("end must be later than start"));
                }
                Ok(())
            }
        }
    }

    fn item_ids(&self, game_data: &GameData) -> AppResult<Option<Vec<i32>>> {
        if self.item_ids.is_empty() {
            return Ok(None);
        }
        self.item_ids
            .iter()
            .map(|ark| game_data.item_id(ark))
            .collect::<AppResult<Vec<_>>>()
            .map(Some)
    }
}

impl StatsService {
    pub async fn get_shim_max_accumulable_drop_matrix_results(
        &self,
        server: Server,
        show_closed_zones: bool,
        source_category: SourceCategory,
        account_id: Option<i32>,
        stage_filter: Option<&str>,
        item_filter: Option<&str>,
    ) -> AppResult<Cached<ShimDropMatrixQueryResult>> {
        let game_data = self.game_data().await?;
        let stages = game_data.parse_stage_filter(stage_filter)?;
        let items = game_data.parse_item_filter(item_filter)?;

        let result = match account_id {
            Some(account_id) => Cached::fresh(
                self.calc_shim_drop_matrix(server, show_closed_zones, source_category, Some(account_id), &game_data)
                    .await?,
            ),
            None => {
                let key = self.caches.global_drop_matrix_key(server, show_closed_zones, source_category);
                self.read_through(&self.caches.shim_global_drop_matrix, &key, || {
                    self.calc_shim_drop_matrix(server, show_closed_zones, source_category, None, &game_data)
                })
                .await?
            }
        };

        Ok(result.map(|r| filter_drop_matrix(r, stages.as_ref(), items.as_ref())))
    }

    async fn calc_shim_drop_matrix(
        &self,
        server: Server,
        show_closed_zones: bool,
        source_category: SourceCategory,
        account_id: Option<i32>,
        game_data: &GameData,
    ) -> AppResult<ShimDropMatrixQueryResult> {
        let mut results = self
            .get_max_accumulable_drop_matrix_results(server, source_category, account_id)
            .await
            .map_err(|e| e.context("drop matrix"))?;
        if !show_closed_zones {
            let open = self.open_stage_ids(server).await?;
            results.retain(|r| open.contains(&r.stage_id));
        }
        Ok(shim_drop_matrix(&results, game_data))
    }

    pub async fn get_shim_latest_pattern_matrix_results(
        &self,
        server: Server,
        account_id: Option<i32>,
    ) -> AppResult<Cached<ShimPatternMatrixQueryResult>> {
        let game_data = self.game_data().await?;
        match account_id {
            Some(_) => Ok(Cached::fresh(
                self.calc_shim_pattern_matrix(server, account_id, &game_data).await?,
            )),
            None => {
                let key = self.caches.shim_global_pattern_matrix.key(&[server.as_str()]);
                self.read_through(&self.caches.shim_global_pattern_matrix, &key, || {
                    self.calc_shim_pattern_matrix(server, None, &game_data)
                })
                .await
            }
        }
    }

    async fn calc_shim_pattern_matrix(
        &self,
        server: Server,
        account_id: Option<i32>,
        game_data: &GameData,
    ) -> AppResult<ShimPatternMatrixQueryResult> {
        let elements = self
            .get_latest_pattern_matrix_results(server, account_id)
            .await
            .map_err(|e| e.context("pattern matrix"))?;

        let pattern_ids: BTreeSet<i32> = elements.iter().map(|e| e.pattern_id).collect();
        let patterns = try_join_all(pattern_ids.into_iter().map(|pattern_id| async move {
            let drops = self.drop_pattern_elements(pattern_id, game_data).await?;
            AppResult::Ok((pattern_id, drops))
        }))
        .await?;

        let patterns: BTreeMap<i32, Vec<DropPatternElement>> = patterns.into_iter().collect();
        Ok(shim_pattern_matrix(&elements, &patterns, game_data))
    }

    /// Global trend over the persisted daily elements of every source.
    pub async fn get_shim_trend(&self, server: Server) -> AppResult<Cached<ShimTrendQueryResult>> {
        let game_data = self.game_data().await?;
        let key = self.caches.shim_trend.key(&[server.as_str()]);
        self.read_through(&self.caches.shim_trend, &key, || async {
            let trend = self
                .calc_global_trend(server, SourceCategory::All)
                .await
                .map_err(|e| e.context("global trend"))?;
            Ok(shim_trend(&trend, &game_data))
        })
        .await
    }

    pub async fn get_shim_customized_drop_matrix_results(
        &self,
        query: &AdvancedQuery,
        account_id: Option<i32>,
        game_data: &GameData,
    ) -> AppResult<ShimDropMatrixQueryResult> {
        let start = query.start_time()?;
        let end = query.end()?;
        if !end.is_after(start) {
            return Err(AppError::invalid("end must be later than start"));
        }
        let stage_id = game_data.stage_id(&query.stage_id)?;
        let item_ids = query.item_ids(game_data)?;

        let results = self
            .get_customized_drop_matrix_results(
                TimeRange::ad_hoc(query.server, start, end),
                vec![stage_id],
                item_ids,
                account_id,
                query.source_category.unwrap_or(SourceCategory::All),
            )
            .await
            .map_err(|e| e.context("customized drop matrix"))?;
        Ok(shim_drop_matrix(&results, game_data))
    }

    pub async fn get_shim_customized_trend_results(
        &self,
        query: &AdvancedQuery,
        interval_ms: i64,
        account_id: Option<i32>,
        game_data: &GameData,
    ) -> AppResult<ShimTrendQueryResult> {
        let (start, interval_secs, interval_num) = query.trend_window(interval_ms)?;

        let trend_query = TrendQuery {
            server: query.server,
            start_time: start,
            interval_secs,
            interval_num,
            stage_filter: Some(vec![game_data.stage_id(&query.stage_id)?]),
            item_filter: query.item_ids(game_data)?,
            account_id,
            source_category: query.source_category.unwrap_or(SourceCategory::All),
        };
        let trend = self.query_trend(&trend_query).await.map_err(|e| e.context("customized trend"))?;
        Ok(shim_trend(&trend, game_data))
    }

    /// Runs every query; any failure fails the whole batch.
    pub async fn get_shim_advanced_results(
        &self,
        queries: &[AdvancedQuery],
        account_id: Option<i32>,
    ) -> AppResult<ShimAdvancedQueryResult> {
        if queries.is_empty() {
            return Err(AppError::invalid("queries cannot be empty"));
        }
        if queries.len() > self.query.max_advanced_queries {
            return Err(AppError::invalid(format!(
                "too many queries: {} (max {})",
                queries.len(),
                self.query.max_advanced_queries
            )));
        }
        for query in queries {
            query.validate(self.query.max_intervals)?;
        }
        if queries.iter().any(|q| q.is_personal) && account_id.is_none() {
            return Err(AppError::Unauthorized);
        }

        let game_data = self.game_data().await?;
        let game_data = &game_data;
        let advanced_results = try_join_all(queries.iter().map(|query| async move {
            let account_id = account_id.filter(|_| query.is_personal);
            match query.interval {
                None => self
                    .get_shim_customized_drop_matrix_results(query, account_id, game_data)
                    .await
                    .map(ShimAdvancedResult::DropMatrix),
                Some(interval_ms) => self
                    .get_shim_customized_trend_results(query, interval_ms, account_id, game_data)
                    .await
                    .map(ShimAdvancedResult::Trend),
            }
        }))
        .await?;

        Ok(ShimAdvancedQueryResult { advanced_results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemTrend, Item, RangeRef, Stage, StageTrend};
    use chrono::TimeZone;

    fn game_data() -> GameData {
        GameData::new(
            vec![Stage { stage_id: 1, ark_stage_id: "S1_ark".into(), zone_id: 1 }],
            vec![
                Item { item_id: 10, ark_item_id: "I1_ark".into() },
                Item { item_id: 11, ark_item_id: "I0_ark".into() },
            ],
        )
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn drop_matrix_projects_ark_ids_and_open_end() {
        let results = vec![
            OneDropMatrixElement {
                stage_id: 1,
                item_id: 10,
                quantity: 11,
                times: 10,
                std_dev: 0.7,
                start_time: at(1_600_000_000_000),
                end: RangeEnd::Open,
            },
            OneDropMatrixElement {
                stage_id: 1,
                item_id: 11,
                quantity: 0,
                times: 10,
                std_dev: 0.0,
                start_time: at(1_600_000_000_000),
                end: RangeEnd::ClosedAt(at(1_700_000_000_000)),
            },
            // unknown stage is dropped
            OneDropMatrixElement {
                stage_id: 2,
                item_id: 10,
                quantity: 1,
                times: 1,
                std_dev: 0.0,
                start_time: at(0),
                end: RangeEnd::Open,
            },
        ];
        let shim = shim_drop_matrix(&results, &game_data());
        assert_eq!(shim.matrix.len(), 2);
        assert_eq!(shim.matrix[0].stage_id, "S1_ark");
        assert_eq!(shim.matrix[0].end, None);
        assert_eq!(shim.matrix[1].end, Some(1_700_000_000_000));

        let json = serde_json::to_value(&shim.matrix[0]).unwrap();
        assert_eq!(json["stdDev"], 0.7);
        assert!(json.get("end").is_none());

        let items = BTreeSet::from(["I0_ark".to_string()]);
        let filtered = filter_drop_matrix(shim, None, Some(&items));
        assert_eq!(filtered.matrix.len(), 1);
        assert_eq!(filtered.matrix[0].item_id, "I0_ark");
    }

    #[test]
    fn pattern_drops_are_canonical_and_rehash_to_the_same_fingerprint() {
        let elements = vec![PatternMatrixElement {
            server: Server::CN,
            stage_id: 1,
            pattern_id: 5,
            range: RangeRef::Stored(3),
            quantity: 4,
            times: 9,
            start_time: at(1_600_000_000_000),
            end: RangeEnd::Open,
        }];
        let patterns = BTreeMap::from([(
            5,
            vec![
                DropPatternElement { pattern_id: 5, item_id: 10, quantity: 2 },
                DropPatternElement { pattern_id: 5, item_id: 11, quantity: 1 },
            ],
        )]);
        let shim = shim_pattern_matrix(&elements, &patterns, &game_data());
        let drops = &shim.pattern_matrix[0].pattern.drops;
        assert_eq!(drops[0].item_id, "I0_ark");
        assert_eq!(drops[1].item_id, "I1_ark");

        let decoded: Vec<(String, i32)> = drops.iter().map(|d| (d.item_id.clone(), d.quantity)).collect();
        let original = vec![("I1_ark".to_string(), 2), ("I0_ark".to_string(), 1)];
        assert_eq!(pattern_hash(&decoded), pattern_hash(&original));
        assert_eq!(canonical_pattern(&original), "I0_ark:1|I1_ark:2");
        assert_eq!(pattern_hash(&original).len(), 64);
    }

    #[test]
    fn trend_projects_interval_to_millis() {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 20, 0, 0).single().unwrap();
        let result = TrendQueryResult {
            interval_secs: 86400,
            trends: vec![StageTrend {
                stage_id: 1,
                results: vec![ItemTrend {
                    item_id: 10,
                    start_time: start,
                    quantity: vec![1, 2],
                    times: vec![3, 4],
                }],
            }],
        };
        let shim = shim_trend(&result, &game_data());
        assert_eq!(shim.interval, 86_400_000);
        let stage = &shim.trend["S1_ark"];
        assert_eq!(stage.start_time, start.timestamp_millis());
        assert_eq!(stage.results["I1_ark"].times, vec![3, 4]);
    }

    #[test]
    fn advanced_query_interval_rules() {
        let query: AdvancedQuery = serde_json::from_value(serde_json::json!({
            "server": "CN",
            "stageId": "S1_ark",
            "itemIds": ["I1_ark"],
            "start": 1_700_000_000_000i64,
            "interval": 30 * 60 * 1000
        }))
        .unwrap();
        assert!(!query.is_personal);
        let err = query.interval_secs(30 * 60 * 1000).unwrap_err();
        assert!(err.to_string().contains("interval length must be greater than 1 hour"));
        assert_eq!(query.interval_secs(86_400_000).unwrap(), 86400);
        assert_eq!(query.interval_secs(HOUR_MILLIS + 20 * 60 * 1000).unwrap(), 3600);
        assert_eq!(query.end().unwrap(), RangeEnd::Open);
        assert_eq!(query.item_ids(&game_data()).unwrap(), Some(vec![10]));
    }

    #[test]
    fn advanced_queries_are_validated_without_game_data() {
        let query = |body: serde_json::Value| -> AdvancedQuery { serde_json::from_value(body).unwrap() };
        let day = 86_400_000i64;

        let short = query(serde_json::json!({"server": "CN", "stageId": "x", "start": 1_700_000_000_000i64, "interval": 1_800_000}));
        assert_eq!(short.validate(100).unwrap_err().code(), "INVALID_REQUEST");

        let long = query(serde_json::json!({
            "server": "CN", "stageId": "x", "start": 1_600_000_000_000i64, "end": 1_600_000_000_000i64 + 200 * day, "interval": day
        }));
        assert!(long.validate(100).unwrap_err().to_string().contains("too many sub-intervals"));
        assert!(long.validate(365).is_ok());

        let backwards = query(serde_json::json!({"server": "US", "stageId": "x", "start": 1_700_000_000_000i64, "end": 1_600_000_000_000i64}));
        assert!(backwards.validate(100).is_err());

        let missing_start = query(serde_json::json!({"server": "US", "stageId": "x"}));
        assert!(missing_start.validate(100).unwrap_err().to_string().contains("start is required"));
    }
}
