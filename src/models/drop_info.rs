//! Drop-info declarations: which items may drop on which stage during a range

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::Server;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: i32,
    pub upper: i32,
    #[serde(default)]
    pub exceptions: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropInfo {
    pub drop_id: i32,
    pub server: Server,
    pub stage_id: i32,
    /// `None` for drop-type-level bounds.
    pub item_id: Option<i32>,
    pub drop_type: String,
    pub range_id: i32,
    pub accumulable: bool,
    pub bounds: Option<Bounds>,
}

/// stage id -> items that may drop there, over item-level drop infos.
pub fn drop_sets_by_stage<'a>(infos: impl IntoIterator<Item = &'a DropInfo>) -> BTreeMap<i32, BTreeSet<i32>> {
    let mut sets: BTreeMap<i32, BTreeSet<i32>> = BTreeMap::new();
    for info in infos {
        if let Some(item_id) = info.item_id {
            sets.entry(info.stage_id).or_default().insert(item_id);
        }
    }
    sets
}

/// Stage -> item list filter handed to the report queries.
pub fn stage_item_filter<'a>(infos: impl IntoIterator<Item = &'a DropInfo>) -> BTreeMap<i32, Vec<i32>> {
    drop_sets_by_stage(infos)
        .into_iter()
        .map(|(stage_id, items)| (stage_id, items.into_iter().collect()))
        .collect()
}

/// Highest per-report quantity any drop info allows for (stage, item).
pub fn max_per_report_bound<'a>(
    infos: impl IntoIterator<Item = &'a DropInfo>,
    stage_id: i32,
    item_id: i32,
) -> Option<i32> {
    infos
        .into_iter()
        .filter(|info| info.stage_id == stage_id && info.item_id == Some(item_id))
        .filter_map(|info| info.bounds.as_ref().map(|b| b.upper))
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(stage_id: i32, item_id: Option<i32>, upper: i32) -> DropInfo {
        DropInfo {
            drop_id: 0,
            server: Server::CN,
            stage_id,
            item_id,
            drop_type: "REGULAR".to_string(),
            range_id: 1,
            accumulable: true,
            bounds: Some(Bounds { lower: 0, upper, exceptions: vec![] }),
        }
    }

    #[test]
    fn type_level_infos_are_not_part_of_drop_sets() {
        let infos = vec![info(1, Some(10), 2), info(1, None, 3), info(1, Some(11), 1), info(2, Some(10), 5)];
        let filter = stage_item_filter(&infos);
        assert_eq!(filter.get(&1), Some(&vec![10, 11]));
        assert_eq!(filter.get(&2), Some(&vec![10]));
        assert_eq!(max_per_report_bound(&infos, 1, 10), Some(2));
        assert_eq!(max_per_report_bound(&infos, 3, 10), None);
    }
}
