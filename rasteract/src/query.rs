//! Query descriptions and the bounded output queue (spec §3, §6).

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::descriptor::{Interpolation, Nodata};
use crate::footprint::Footprint;

/// Identity of a query. Spec §3 notes identity is by pointer equality in
/// the original; here a monotonic counter plays the same role as a stable,
/// hashable, `Copy` key, with the `QueryInfo` data held separately behind
/// an `Arc`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

static NEXT_QUERY_ID: AtomicUsize = AtomicUsize::new(1);

impl QueryId {
    pub fn next() -> Self {
        QueryId(NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed) as u64)
    }
}

/// One requested output footprint within a query, with everything derived
/// from it at query-construction time (spec §3 "Produced sequence of
/// `ProdFootprint`").
#[derive(Clone, Debug)]
pub struct ProdFootprintInfo {
    pub prod_fp: Footprint,
    pub same_grid: bool,
    pub share_area: bool,
    /// The raster-aligned region to sample, or `None` when `prod_fp` lies
    /// entirely outside the raster.
    pub sample_fp: Option<Footprint>,
    /// Cache tiles needed to satisfy this production tile.
    pub cache_fps: Vec<Footprint>,
    /// Resample tiles: one when no sub-tiling is needed, else a regular
    /// tiling bounded by `max_resampling_size`.
    pub resample_fps: Vec<Footprint>,
    /// resample_fp index -> cache tiles it depends on.
    pub resample_cache_deps_fps: HashMap<usize, Vec<Footprint>>,
    /// resample_fp index -> source sample_fp slice, or `None` when the
    /// resample tile is fully outside the raster (nodata tile).
    pub resample_sample_dep_fp: HashMap<usize, Option<Footprint>>,
}

/// An immutable description of a requested sequence of production tiles
/// plus user options (spec §3 "Query info").
pub struct QueryInfo {
    pub id: QueryId,
    pub raster_uid: u64,
    pub produced: Vec<ProdFootprintInfo>,
    pub channel_ids: Vec<u32>,
    pub unique_channel_ids: Vec<u32>,
    pub dst_nodata: Nodata,
    pub interpolation: Interpolation,
    pub is_flat: bool,
    pub max_queue_size: usize,
    pub parent_uid: Option<u64>,
    pub key_in_parent: Option<String>,
    queue: Mutex<Weak<BoundedQueue>>,
}

impl QueryInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        raster_uid: u64,
        produced: Vec<ProdFootprintInfo>,
        channel_ids: Vec<u32>,
        dst_nodata: Nodata,
        interpolation: Interpolation,
        is_flat: bool,
        max_queue_size: usize,
        parent_uid: Option<u64>,
        key_in_parent: Option<String>,
        queue: &Arc<BoundedQueue>,
    ) -> Self {
        let mut unique_channel_ids = channel_ids.clone();
        unique_channel_ids.sort_unstable();
        unique_channel_ids.dedup();
        Self {
            id: QueryId::next(),
            raster_uid,
            produced,
            channel_ids,
            unique_channel_ids,
            dst_nodata,
            interpolation,
            is_flat,
            max_queue_size,
            parent_uid,
            key_in_parent,
            queue: Mutex::new(Arc::downgrade(queue)),
        }
    }

    pub fn produce_count(&self) -> usize {
        self.produced.len()
    }

    /// Upgrades the weak reference to the consumer's queue. `None` once the
    /// consumer has dropped it, which is the cancellation trigger (spec
    /// §4.5, §5 "Weak references to consumer state").
    pub fn queue_wref(&self) -> Option<Arc<BoundedQueue>> {
        self.queue.lock().upgrade()
    }

    /// Deduplicated, order-stable list of cache tiles this query needs
    /// across all of its production tiles (spec §3
    /// `list_of_cache_fp`/`dict_of_min_prod_idx_per_cache_fp`).
    pub fn list_of_cache_fp(&self) -> Vec<Footprint> {
        let mut seen: BTreeSet<(i64, i64)> = BTreeSet::new();
        let mut out = Vec::new();
        for p in &self.produced {
            for fp in &p.cache_fps {
                if seen.insert(fp.tiebreak_key()) {
                    out.push(*fp);
                }
            }
        }
        out
    }

    /// For each needed cache tile, the minimum production index among this
    /// query's production tiles that depends on it.
    pub fn dict_of_min_prod_idx_per_cache_fp(&self) -> HashMap<(i64, i64), usize> {
        let mut out: HashMap<(i64, i64), usize> = HashMap::new();
        for (idx, p) in self.produced.iter().enumerate() {
            for fp in &p.cache_fps {
                let key = fp.tiebreak_key();
                out.entry(key).and_modify(|m| *m = (*m).min(idx)).or_insert(idx);
            }
        }
        out
    }
}

/// Mutable bookkeeping the `QueriesHandler` keeps per live query (spec §3
/// "Query mutable state").
#[derive(Default)]
pub struct QueryMutableState {
    /// Number of arrays pushed into the consumer queue so far.
    pub produced_count: usize,
    /// Last sampled `queue.qsize()`.
    pub queue_size: usize,
    /// Staging area for arrays that arrived out of production-index order.
    pub produce_arrays_dict: HashMap<usize, Array>,
}

/// An output array: `(Y, X, C)`, or `(Y, X)` when `is_flat` and `C == 1`
/// (spec §6).
#[derive(Clone, Debug)]
pub struct Array {
    pub shape: (u32, u32, u32),
    pub data: Arc<Vec<f32>>,
}

impl Array {
    pub fn filled(shape: (u32, u32, u32), value: f32) -> Self {
        let n = shape.0 as usize * shape.1 as usize * shape.2 as usize;
        Self {
            shape,
            data: Arc::new(vec![value; n]),
        }
    }
}

/// A bounded, thread-safe FIFO of output arrays (spec §6 `queue_data`). The
/// scheduler thread calls [`BoundedQueue::push`] and never blocks; the
/// consumer thread calls [`BoundedQueue::recv`]/[`BoundedQueue::try_recv`].
/// Dropping every `Arc` to this queue is the cancellation trigger (spec §5).
pub struct BoundedQueue {
    capacity: usize,
    inner: Mutex<std::collections::VecDeque<Array>>,
    cond: parking_lot::Condvar,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            inner: Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
            cond: parking_lot::Condvar::new(),
        })
    }

    /// Current number of arrays waiting to be consumed (spec §4.5
    /// `queue.qsize()`).
    pub fn qsize(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Never blocks. Spec §4.6/§4.5 invariants guarantee there is always
    /// room by the time the scheduler calls this.
    pub fn push(&self, array: Array) {
        let mut guard = self.inner.lock();
        debug_assert!(guard.len() < self.capacity, "bounded queue overflow");
        guard.push_back(array);
        self.cond.notify_one();
    }

    /// Blocking receive for the consumer thread.
    pub fn recv(&self) -> Option<Array> {
        let mut guard = self.inner.lock();
        loop {
            if let Some(a) = guard.pop_front() {
                return Some(a);
            }
            self.cond.wait(&mut guard);
        }
    }

    pub fn try_recv(&self) -> Option<Array> {
        self.inner.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_push_then_recv_preserves_order() {
        let q = BoundedQueue::new(4);
        q.push(Array::filled((1, 1, 1), 1.0));
        q.push(Array::filled((1, 1, 1), 2.0));
        assert_eq!(q.try_recv().unwrap().data[0], 1.0);
        assert_eq!(q.try_recv().unwrap().data[0], 2.0);
        assert!(q.try_recv().is_none());
    }

    #[test]
    fn weak_queue_dies_when_consumer_drops_it() {
        let q = BoundedQueue::new(4);
        let produced = Vec::new();
        let qi = QueryInfo::new(
            1,
            produced,
            vec![0],
            Nodata::None,
            Interpolation::Nearest,
            false,
            5,
            None,
            None,
            &q,
        );
        assert!(qi.queue_wref().is_some());
        drop(q);
        assert!(qi.queue_wref().is_none());
    }
}
