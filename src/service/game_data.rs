//! Stage / item lookups and drop pattern contents

use std::collections::{BTreeSet, HashMap};
use tracing::warn;

use super::{pattern_hash, StatsService};
use crate::error::{AppError, AppResult};
use crate::models::{DropPatternElement, Item, Server, Stage};

/// Numeric id <-> ark id maps for stages and items.
#[derive(Debug, Clone, Default)]
pub struct GameData {
    stages: HashMap<i32, Stage>,
    stage_ids: HashMap<String, i32>,
    items: HashMap<i32, Item>,
    item_ids: HashMap<String, i32>,
}

impl GameData {
    pub fn new(stages: Vec<Stage>, items: Vec<Item>) -> Self {
        let stage_ids = stages.iter().map(|s| (s.ark_stage_id.clone(), s.stage_id)).collect();
        let item_ids = items.iter().map(|i| (i.ark_item_id.clone(), i.item_id)).collect();
        Self {
            stages: stages.into_iter().map(|s| (s.stage_id, s)).collect(),
            stage_ids,
            items: items.into_iter().map(|i| (i.item_id, i)).collect(),
            item_ids,
        }
    }

    pub fn ark_stage_id(&self, stage_id: i32) -> Option<&str> {
        self.stages.get(&stage_id).map(|s| s.ark_stage_id.as_str())
    }

    pub fn ark_item_id(&self, item_id: i32) -> Option<&str> {
        self.items.get(&item_id).map(|i| i.ark_item_id.as_str())
    }

    pub fn stage_id(&self, ark_stage_id: &str) -> AppResult<i32> {
        self.stage_ids
            .get(ark_stage_id)
            .copied()
            .ok_or_else(|| AppError::NotFound(format!("stage '{}' not found", ark_stage_id)))
    }

    pub fn item_id(&self, ark_item_id: &str) -> AppResult<i32> {
        self.item_ids
            .get(ark_item_id)
            .copied()
            .ok_or_else(|| AppError::NotFound(format!("item '{}' not found", ark_item_id)))
    }

    pub fn stage_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.stages.keys().copied()
    }

    /// Comma-separated ark stage ids, validated; blank means no filter.
    pub fn parse_stage_filter(&self, raw: Option<&str>) -> AppResult<Option<BTreeSet<String>>> {
        parse_ark_list(raw, |ark| self.stage_id(ark))
    }

    /// Comma-separated ark item ids, validated; blank means no filter.
    pub fn parse_item_filter(&self, raw: Option<&str>) -> AppResult<Option<BTreeSet<String>>> {
        parse_ark_list(raw, |ark| self.item_id(ark))
    }
}

fn parse_ark_list(
    raw: Option<&str>,
    resolve: impl Fn(&str) -> AppResult<i32>,
) -> AppResult<Option<BTreeSet<String>>> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let mut arks = BTreeSet::new();
    for ark in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        resolve(ark)?;
        arks.insert(ark.to_string());
    }
    Ok(Some(arks))
}

impl StatsService {
    pub async fn game_data(&self) -> AppResult<GameData> {
        let stages_key = self.caches.stages.key(&[]);
        let items_key = self.caches.items.key(&[]);
        let (stages, items) = tokio::try_join!(
            self.caches
                .stages
                .mutex_get_set(&stages_key, || async { self.db.get_stages().await.map_err(AppError::from) }),
            self.caches
                .items
                .mutex_get_set(&items_key, || async { self.db.get_items().await.map_err(AppError::from) }),
        )?;
        Ok(GameData::new(stages.0, items.0))
    }

    /// Pattern contents, checked once against the stored fingerprint when loaded.
    pub async fn drop_pattern_elements(&self, pattern_id: i32, game_data: &GameData) -> AppResult<Vec<DropPatternElement>> {
        let key = self.caches.drop_pattern_elements.key(&[&pattern_id.to_string()]);
        let (elements, calculated) = self
            .caches
            .drop_pattern_elements
            .mutex_get_set(&key, || async {
                self.db.get_drop_pattern_elements(pattern_id).await.map_err(AppError::from)
            })
            .await?;

        if calculated {
            self.check_pattern_hash(pattern_id, &elements, game_data).await?;
        }
        Ok(elements)
    }

    async fn check_pattern_hash(
        &self,
        pattern_id: i32,
        elements: &[DropPatternElement],
        game_data: &GameData,
    ) -> AppResult<()> {
        let Some(stored) = self.db.get_drop_pattern_hash(pattern_id).await? else {
            return Err(AppError::NotFound(format!("pattern {} not found", pattern_id)));
        };
        let drops: Vec<(String, i32)> = elements
            .iter()
            .filter_map(|e| game_data.ark_item_id(e.item_id).map(|ark| (ark.to_string(), e.quantity)))
            .collect();
        if pattern_hash(&drops) != stored {
            warn!(pattern_id, "Drop pattern fingerprint does not match its elements");
        }
        Ok(())
    }

    /// Stages with at least one drop info whose range is open right now.
    pub async fn open_stage_ids(&self, server: Server) -> AppResult<BTreeSet<i32>> {
        let ids = self.db.get_open_stage_ids(server, chrono::Utc::now()).await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn resolve_account(&self, penguin_id: &str) -> AppResult<i32> {
        self.db
            .get_account_id_by_penguin_id(penguin_id)
            .await?
            .ok_or(AppError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game_data() -> GameData {
        GameData::new(
            vec![
                Stage { stage_id: 1, ark_stage_id: "main_01-07".into(), zone_id: 1 },
                Stage { stage_id: 2, ark_stage_id: "main_04-06".into(), zone_id: 4 },
            ],
            vec![
                Item { item_id: 10, ark_item_id: "30012".into() },
                Item { item_id: 11, ark_item_id: "30013".into() },
            ],
        )
    }

    #[test]
    fn ark_ids_resolve_both_ways() {
        let gd = game_data();
        assert_eq!(gd.ark_stage_id(2), Some("main_04-06"));
        assert_eq!(gd.stage_id("main_01-07").unwrap(), 1);
        assert_eq!(gd.ark_item_id(99), None);
        assert!(matches!(gd.item_id("nope"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn filters_split_on_commas() {
        let gd = game_data();
        assert_eq!(gd.parse_item_filter(None).unwrap(), None);
        assert_eq!(gd.parse_item_filter(Some("  ")).unwrap(), None);
        let items = gd.parse_item_filter(Some("30013, 30012,")).unwrap().unwrap();
        assert_eq!(items.into_iter().collect::<Vec<_>>(), vec!["30012", "30013"]);
        assert!(gd.parse_stage_filter(Some("main_01-07,unknown")).is_err());
    }
}
