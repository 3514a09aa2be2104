//! Global priorities watcher (spec §4.4). Process-singleton; maintains the
//! cross-query priority for every (raster, cache-tile) and every query.

use std::collections::{BTreeSet, HashMap};

use crate::ids::RasterUid;
use crate::message::{Address, Envelope, Payload};
use crate::pool::{PoolMsg, WaitingRoomMsg};
use crate::priority::{CacheTileKey, Priorities};
use crate::query::QueryId;

/// Messages the watcher receives (spec §4.4).
#[derive(Debug)]
pub enum GlobalMsg {
    /// A query has started depending on a set of cache tiles, each tagged
    /// with this query's minimum production index depending on it. Spec
    /// §4.4: "set only once, when the query's collection phase starts".
    AQueryNeedThoseCacheTiles {
        raster_uid: RasterUid,
        qi: QueryId,
        cache_fp_min_prod_idx: Vec<(CacheTileKey, usize)>,
    },
    /// The consumer's pull rate changed (spec §4.4, aging-coalesced by the
    /// scheduler at the envelope level).
    OutputQueueUpdate {
        raster_uid: RasterUid,
        qi: QueryId,
        produced_count: usize,
        queue_size: usize,
    },
    CancelThisQuery { qi: QueryId },
}

/// Priority-sorted entry for one (query, cache tile) dependency: `prio` is
/// `min_prod_idx - pulled_count`, recomputed on every `pulled_count`
/// change (design notes §9: "never mutate the key in place").
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct Entry {
    prio: i64,
    qi: QueryId,
}

pub struct GlobalPrioritiesWatcher {
    db_version: u64,
    pulled_count_per_query: HashMap<QueryId, i64>,
    /// (raster, cache tile) -> this query's min_prod_idx for it.
    cache_fps_per_query: HashMap<QueryId, HashMap<(RasterUid, CacheTileKey), usize>>,
    sorted_prod_tiles_per_cache_tile: HashMap<(RasterUid, CacheTileKey), BTreeSet<Entry>>,
}

impl GlobalPrioritiesWatcher {
    pub fn new() -> Self {
        Self {
            db_version: 0,
            pulled_count_per_query: HashMap::new(),
            cache_fps_per_query: HashMap::new(),
            sorted_prod_tiles_per_cache_tile: HashMap::new(),
        }
    }

    pub fn db_version(&self) -> u64 {
        self.db_version
    }

    fn entry_for(&self, qi: QueryId, min_prod_idx: usize) -> Entry {
        let pulled = self.pulled_count_per_query.get(&qi).copied().unwrap_or(0);
        Entry {
            prio: min_prod_idx as i64 - pulled,
            qi,
        }
    }

    fn rekey_query_entries(&mut self, qi: QueryId, changed: &mut BTreeSet<(RasterUid, CacheTileKey)>) {
        let Some(deps) = self.cache_fps_per_query.get(&qi).cloned() else {
            return;
        };
        for (key, min_prod_idx) in deps {
            if let Some(set) = self.sorted_prod_tiles_per_cache_tile.get_mut(&key) {
                let old_head = set.iter().next().copied();
                set.retain(|e| e.qi != qi);
                set.insert(self.entry_for(qi, min_prod_idx));
                if set.iter().next().copied() != old_head {
                    changed.insert(key);
                }
            }
        }
    }

    pub fn handle(&mut self, msg: GlobalMsg) -> Vec<Envelope> {
        let mut changed: BTreeSet<(RasterUid, CacheTileKey)> = BTreeSet::new();
        match msg {
            GlobalMsg::AQueryNeedThoseCacheTiles {
                raster_uid,
                qi,
                cache_fp_min_prod_idx,
            } => {
                let deps = self.cache_fps_per_query.entry(qi).or_default();
                for (cache_key, min_prod_idx) in cache_fp_min_prod_idx {
                    let key = (raster_uid, cache_key);
                    deps.insert(key, min_prod_idx);
                    let set = self.sorted_prod_tiles_per_cache_tile.entry(key).or_default();
                    let old_head = set.iter().next().copied();
                    let pulled = self.pulled_count_per_query.get(&qi).copied().unwrap_or(0);
                    set.insert(Entry {
                        prio: min_prod_idx as i64 - pulled,
                        qi,
                    });
                    if set.iter().next().copied() != old_head {
                        changed.insert(key);
                    }
                }
            }
            GlobalMsg::OutputQueueUpdate {
                qi,
                produced_count,
                queue_size,
                ..
            } => {
                let pulled = produced_count as i64 - queue_size as i64;
                let prev = self.pulled_count_per_query.insert(qi, pulled);
                if prev != Some(pulled) {
                    self.rekey_query_entries(qi, &mut changed);
                }
            }
            GlobalMsg::CancelThisQuery { qi } => {
                if let Some(deps) = self.cache_fps_per_query.remove(&qi) {
                    for key in deps.keys() {
                        if let Some(set) = self.sorted_prod_tiles_per_cache_tile.get_mut(key) {
                            let old_head = set.iter().next().copied();
                            set.retain(|e| e.qi != qi);
                            if set.iter().next().copied() != old_head {
                                changed.insert(*key);
                            }
                        }
                    }
                }
                self.pulled_count_per_query.remove(&qi);
            }
        }

        if changed.is_empty() {
            return Vec::new();
        }
        self.db_version += 1;
        let priorities = self.snapshot();
        vec![Envelope::basic(
            Address::AllPools,
            Payload::Pool(PoolMsg::WaitingRoom(WaitingRoomMsg::PrioritiesUpdated(priorities))),
        )]
    }

    fn snapshot(&self) -> Priorities {
        let cache_tile_prio = self
            .sorted_prod_tiles_per_cache_tile
            .iter()
            .filter_map(|(key, set)| set.iter().next().map(|e| (*key, e.prio)))
            .collect();
        Priorities::new(self.db_version, self.pulled_count_per_query.clone(), cache_tile_prio)
    }
}

impl Default for GlobalPrioritiesWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_change_bumps_version_and_broadcasts() {
        let mut w = GlobalPrioritiesWatcher::new();
        let qi = QueryId::next();
        let envs = w.handle(GlobalMsg::AQueryNeedThoseCacheTiles {
            raster_uid: 1,
            qi,
            cache_fp_min_prod_idx: vec![((0, 0), 3)],
        });
        assert_eq!(envs.len(), 1);
        assert_eq!(w.db_version(), 1);
    }

    #[test]
    fn unrelated_update_does_not_bump_version() {
        let mut w = GlobalPrioritiesWatcher::new();
        let qi = QueryId::next();
        w.handle(GlobalMsg::AQueryNeedThoseCacheTiles {
            raster_uid: 1,
            qi,
            cache_fp_min_prod_idx: vec![((0, 0), 3)],
        });
        let v1 = w.db_version();
        let envs = w.handle(GlobalMsg::OutputQueueUpdate {
            raster_uid: 1,
            qi,
            produced_count: 0,
            queue_size: 0,
        });
        assert!(envs.is_empty());
        assert_eq!(w.db_version(), v1);
    }
}
