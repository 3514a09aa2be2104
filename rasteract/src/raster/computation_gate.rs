//! The two computation gates (spec §4.9 "two-stage computation gating").
//!
//! `ComputationGate1` admits a cache tile's compute pipeline once the
//! driving query's pull rate has advanced far enough that the tile will be
//! needed soon. `ComputationGate2` further gates on primitive-queue
//! readiness before handing individual compute tiles to `Computer`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::descriptor::RasterDescriptor;
use crate::footprint::Footprint;
use crate::message::{Address, Envelope, Payload};
use crate::query::{Array, QueryId, QueryInfo};

use super::computer::ComputerMsg;
use super::RasterMsg;

#[derive(Debug)]
pub enum Gate1Msg {
    /// CacheSupervisor has an absent tile that needs computing, driven by
    /// the first query that discovered it absent.
    ComputeThoseCacheFiles { qi: Arc<QueryInfo>, cache_fp: Footprint },
    OutputQueueUpdate {
        qi: Arc<QueryInfo>,
        produced_count: usize,
        queue_size: usize,
    },
}

pub struct ComputationGate1 {
    raster_uid: u64,
    pulled_count: HashMap<QueryId, i64>,
    pending: HashMap<QueryId, Vec<(Arc<QueryInfo>, Footprint)>>,
}

impl ComputationGate1 {
    pub fn new(raster_uid: u64) -> Self {
        Self {
            raster_uid,
            pulled_count: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    fn bound(&self, qi: &QueryInfo) -> i64 {
        let pulled = self.pulled_count.get(&qi.id).copied().unwrap_or(0);
        pulled + qi.max_queue_size as i64 - 1
    }

    fn admit_envelope(&self, qi: Arc<QueryInfo>, cache_fp: Footprint) -> Envelope {
        Envelope::basic(
            Address::Raster(self.raster_uid),
            Payload::Raster(RasterMsg::Gate2(Gate2Msg::ComputeThisCacheFile { qi, cache_fp })),
        )
    }

    pub fn handle(&mut self, msg: Gate1Msg) -> Vec<Envelope> {
        match msg {
            Gate1Msg::ComputeThoseCacheFiles { qi, cache_fp } => {
                let min_prod_idx = *qi
                    .dict_of_min_prod_idx_per_cache_fp()
                    .get(&cache_fp.tiebreak_key())
                    .unwrap_or(&0);
                if (min_prod_idx as i64) <= self.bound(&qi) {
                    vec![self.admit_envelope(qi, cache_fp)]
                } else {
                    self.pending.entry(qi.id).or_default().push((qi, cache_fp));
                    Vec::new()
                }
            }
            Gate1Msg::OutputQueueUpdate { qi, produced_count, queue_size } => {
                self.pulled_count.insert(qi.id, produced_count as i64 - queue_size as i64);
                self.recheck(qi.id)
            }
        }
    }

    fn recheck(&mut self, qi: QueryId) -> Vec<Envelope> {
        let Some(list) = self.pending.get_mut(&qi) else {
            return Vec::new();
        };
        let pulled = self.pulled_count.get(&qi).copied().unwrap_or(0);
        let mut ready = Vec::new();
        list.retain(|(q, fp)| {
            let min_prod_idx = *q
                .dict_of_min_prod_idx_per_cache_fp()
                .get(&fp.tiebreak_key())
                .unwrap_or(&0);
            let b = pulled + q.max_queue_size as i64 - 1;
            if (min_prod_idx as i64) <= b {
                ready.push((q.clone(), *fp));
                false
            } else {
                true
            }
        });
        ready.into_iter().map(|(q, fp)| self.admit_envelope(q, fp)).collect()
    }

    pub fn cancel(&mut self, qi: QueryId) -> Vec<Envelope> {
        self.pulled_count.remove(&qi);
        self.pending.remove(&qi);
        Vec::new()
    }
}

#[derive(Debug)]
pub enum Gate2Msg {
    ComputeThisCacheFile { qi: Arc<QueryInfo>, cache_fp: Footprint },
    /// A nudge to re-check pending admissions — typically a droppable
    /// signal from a downstream raster acting as this one's primitive
    /// (spec §4.9 "recipe-of-recipe chaining").
    InputQueueUpdate,
}

/// Further gates on primitive-queue readiness before releasing compute
/// tiles to `Computer` (spec §4.9). Primitive queues are launched lazily,
/// once, against the whole raster footprint — primitives feed every cache
/// tile's compute, not just one, so there is one queue per primitive
/// descriptor rather than one per compute tile.
pub struct ComputationGate2 {
    descriptor: Arc<RasterDescriptor>,
    collected_count: usize,
    primitive_queues: Vec<Arc<crate::query::BoundedQueue>>,
    primitives_launched: bool,
    pending: VecDeque<(Arc<QueryInfo>, Footprint)>,
}

impl ComputationGate2 {
    pub fn new(descriptor: Arc<RasterDescriptor>) -> Self {
        Self {
            descriptor,
            collected_count: 0,
            primitive_queues: Vec::new(),
            primitives_launched: false,
            pending: VecDeque::new(),
        }
    }

    fn ensure_primitives_launched(&mut self) {
        if self.primitives_launched {
            return;
        }
        self.primitives_launched = true;
        for p in &self.descriptor.primitives {
            self.primitive_queues.push((p.launch_query)(self.descriptor.fp));
        }
    }

    fn min_primitive_qsize(&self) -> usize {
        self.primitive_queues.iter().map(|q| q.qsize()).min().unwrap_or(0)
    }

    pub fn handle(&mut self, msg: Gate2Msg) -> Vec<Envelope> {
        match msg {
            Gate2Msg::ComputeThisCacheFile { qi, cache_fp } => {
                if self.descriptor.primitives.is_empty() {
                    self.dispatch(&qi, cache_fp, &[])
                } else {
                    self.ensure_primitives_launched();
                    self.pending.push_back((qi, cache_fp));
                    self.try_admit()
                }
            }
            Gate2Msg::InputQueueUpdate => self.try_admit(),
        }
    }

    /// Keep-alive tick (spec §4.1 step 4) — re-checks pending admissions
    /// even with no fresh message, since primitive-queue growth otherwise
    /// has no other trigger.
    pub fn tick(&mut self) -> Vec<Envelope> {
        if self.primitives_launched {
            self.try_admit()
        } else {
            Vec::new()
        }
    }

    fn try_admit(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        let budget = self.collected_count + self.min_primitive_qsize();
        while self.collected_count < budget {
            let Some((qi, cache_fp)) = self.pending.pop_front() else {
                break;
            };
            self.collected_count += 1;
            let primitive_arrays: Vec<Array> = self
                .primitive_queues
                .iter()
                .filter_map(|q| q.try_recv())
                .collect();
            out.extend(self.dispatch(&qi, cache_fp, &primitive_arrays));
        }
        out
    }

    fn dispatch(&self, _qi: &Arc<QueryInfo>, cache_fp: Footprint, primitive_arrays: &[Array]) -> Vec<Envelope> {
        self.descriptor
            .compute_fps_of_cache_fp(&cache_fp)
            .into_iter()
            .map(|compute_fp| {
                Envelope::basic(
                    Address::Raster(self.descriptor.uid),
                    Payload::Raster(RasterMsg::Computer(ComputerMsg::ComputeThisArray {
                        cache_fp,
                        compute_fp,
                        primitive_arrays: primitive_arrays.to_vec(),
                    })),
                )
            })
            .collect()
    }

    pub fn cancel(&mut self, qi: QueryId) -> Vec<Envelope> {
        self.pending.retain(|(q, _)| q.id != qi);
        Vec::new()
    }
}
