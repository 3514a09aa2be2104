//! The `Priorities` snapshot handle (spec §3 "Priorities database", §9
//! "Global priorities as an indexed data structure").
//!
//! Grounded on `buzzard/_actors/priorities.py`'s `Priorities`/
//! `dummy_priorities`: a thin, versioned, cheaply-cloned read handle that
//! waiting rooms hold between broadcasts. `db_version` lets a reader assert
//! it has the current handle before trusting a lookup (spec §5 "Priority
//! broadcasts carry a monotone `db_version`").

use std::collections::HashMap;
use std::sync::Arc;

use crate::ids::RasterUid;
use crate::query::QueryId;

/// Sort key for a cache tile's tiebreak identity, independent of the real
/// `Footprint` type (spec §3 uses the cache_fp itself as the key; we use
/// its [`crate::footprint::Footprint::tiebreak_key`]).
pub type CacheTileKey = (i64, i64);

#[derive(Clone)]
pub struct Priorities {
    version: u64,
    pulled_count: Arc<HashMap<QueryId, i64>>,
    cache_tile_prio: Arc<HashMap<(RasterUid, CacheTileKey), i64>>,
}

impl Priorities {
    pub fn new(
        version: u64,
        pulled_count: HashMap<QueryId, i64>,
        cache_tile_prio: HashMap<(RasterUid, CacheTileKey), i64>,
    ) -> Self {
        Self {
            version,
            pulled_count: Arc::new(pulled_count),
            cache_tile_prio: Arc::new(cache_tile_prio),
        }
    }

    /// A priorities handle usable before the watcher has broadcast
    /// anything: production priority falls back to raw `prod_idx`, cache
    /// priority to a constant so every job is equally (un)urgent.
    pub fn dummy() -> Self {
        Self {
            version: 0,
            pulled_count: Arc::new(HashMap::new()),
            cache_tile_prio: Arc::new(HashMap::new()),
        }
    }

    pub fn db_version(&self) -> u64 {
        self.version
    }

    /// `prio_of_prod_tile(qi, prod_idx) = (prod_idx - pulled_count(qi),)`
    /// (spec §4.2). Smaller means sooner-needed.
    pub fn prio_of_prod_tile(&self, qi: QueryId, prod_idx: usize) -> i64 {
        let pulled = self.pulled_count.get(&qi).copied().unwrap_or(0);
        prod_idx as i64 - pulled
    }

    /// Minimum production-tile priority among consumers of this cache tile,
    /// or `i64::MAX` if none depend on it (spec §4.2).
    pub fn prio_of_cache_tile(&self, raster_uid: RasterUid, cache_fp: CacheTileKey) -> i64 {
        self.cache_tile_prio
            .get(&(raster_uid, cache_fp))
            .copied()
            .unwrap_or(i64::MAX)
    }
}

impl Default for Priorities {
    fn default() -> Self {
        Self::dummy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_priorities_are_total_but_uninformative() {
        let p = Priorities::dummy();
        assert_eq!(p.prio_of_prod_tile(QueryId(1), 3), 3);
        assert_eq!(p.prio_of_cache_tile(7, (0, 0)), i64::MAX);
    }

    #[test]
    fn prod_tile_priority_accounts_for_pulled_count() {
        let mut pulled = HashMap::new();
        pulled.insert(QueryId(1), 2);
        let p = Priorities::new(1, pulled, HashMap::new());
        assert_eq!(p.prio_of_prod_tile(QueryId(1), 5), 3);
        assert_eq!(p.prio_of_prod_tile(QueryId(2), 5), 5);
    }
}
