//! QueriesHandler (spec §4.5): owns the lifecycle of every live query
//! against this raster — registration, in-order delivery to the consumer's
//! [`crate::query::BoundedQueue`], and detecting cancellation via the
//! weak-reference trick (spec §5 "Weak references to consumer state").

use std::collections::HashMap;
use std::sync::Arc;

use crate::descriptor::RasterDescriptor;
use crate::message::{Address, AgingKey, Envelope, Payload};
use crate::priorities_watcher::GlobalMsg;
use crate::query::{Array, QueryId, QueryInfo, QueryMutableState};

use super::cache_supervisor::CacheSupervisorMsg;
use super::computation_gate::{Gate1Msg, Gate2Msg};
use super::production_gate::ProductionGateMsg;
use super::RasterMsg;

#[derive(Debug)]
pub enum QueriesHandlerMsg {
    /// A fresh query is starting (spec §4.4 "collection phase starts").
    NewQuery { qi: Arc<QueryInfo> },
    /// One production tile finished assembling (spec §4.7's final step).
    MadeThisArray {
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        array: Array,
    },
}

pub struct QueriesHandler {
    raster_uid: u64,
    active: HashMap<QueryId, (Arc<QueryInfo>, QueryMutableState)>,
}

impl QueriesHandler {
    pub fn new(raster_uid: u64) -> Self {
        Self {
            raster_uid,
            active: HashMap::new(),
        }
    }

    pub fn handle(&mut self, msg: QueriesHandlerMsg, descriptor: &RasterDescriptor) -> Vec<Envelope> {
        match msg {
            QueriesHandlerMsg::NewQuery { qi } => self.new_query(qi, descriptor),
            QueriesHandlerMsg::MadeThisArray { qi, prod_idx, array } => {
                self.made_this_array(qi, prod_idx, array)
            }
        }
    }

    fn new_query(&mut self, qi: Arc<QueryInfo>, descriptor: &RasterDescriptor) -> Vec<Envelope> {
        self.active.insert(qi.id, (qi.clone(), QueryMutableState::default()));
        let raster_uid = descriptor.uid;

        let mut out = Vec::new();
        out.push(Envelope::basic(
            Address::Global,
            Payload::Global(GlobalMsg::AQueryNeedThoseCacheTiles {
                raster_uid,
                qi: qi.id,
                cache_fp_min_prod_idx: qi.dict_of_min_prod_idx_per_cache_fp().into_iter().collect(),
            }),
        ));
        for cache_fp in qi.list_of_cache_fp() {
            out.push(Envelope::basic(
                Address::Raster(raster_uid),
                Payload::Raster(RasterMsg::CacheSupervisor(CacheSupervisorMsg::RequestCacheTile {
                    qi: qi.clone(),
                    cache_fp,
                })),
            ));
        }
        out.push(Envelope::basic(
            Address::Raster(raster_uid),
            Payload::Raster(RasterMsg::ProductionGate(ProductionGateMsg::MakeThoseArrays { qi })),
        ));
        out
    }

    /// Stages `array` and flushes every production index that is now
    /// contiguous with what's already been pushed, preserving order even
    /// though tiles can finish out of sequence (spec §4.5 "in-order
    /// delivery"). Each array actually pushed also nudges the parent
    /// raster's `ComputationGate2`, if any (spec §4.5 "If the query has a
    /// parent, each push also emits a droppable `input_queue_update`"); once
    /// every production index has been delivered the query's record is
    /// destroyed (spec §4.5 "the query is complete and its record
    /// destroyed").
    fn made_this_array(&mut self, qi: Arc<QueryInfo>, prod_idx: usize, array: Array) -> Vec<Envelope> {
        let Some(queue) = qi.queue_wref() else {
            return self.broadcast_cancel(qi.id, qi.raster_uid);
        };
        let Some((_, state)) = self.active.get_mut(&qi.id) else {
            return Vec::new();
        };
        state.produce_arrays_dict.insert(prod_idx, array);
        let mut pushes = 0usize;
        while let Some(arr) = state.produce_arrays_dict.remove(&state.produced_count) {
            queue.push(arr);
            state.produced_count += 1;
            pushes += 1;
        }
        state.queue_size = queue.qsize();
        let (produced_count, queue_size) = (state.produced_count, state.queue_size);

        let mut out = self.emit_queue_update(&qi, produced_count, queue_size);
        if let Some(parent) = qi.parent_uid {
            out.extend((0..pushes).map(|_| {
                Envelope::droppable(
                    Address::Raster(parent),
                    Payload::Raster(RasterMsg::Gate2(Gate2Msg::InputQueueUpdate)),
                )
            }));
        }
        if produced_count == qi.produce_count() {
            self.active.remove(&qi.id);
        }
        out
    }

    fn emit_queue_update(&self, qi: &Arc<QueryInfo>, produced_count: usize, queue_size: usize) -> Vec<Envelope> {
        let raster_uid = qi.raster_uid;
        let key = AgingKey {
            method: "output_queue_update",
            id_args: (raster_uid, qi.id.0),
        };
        vec![
            Envelope::aging(
                Address::Global,
                key.clone(),
                Payload::Global(GlobalMsg::OutputQueueUpdate {
                    raster_uid,
                    qi: qi.id,
                    produced_count,
                    queue_size,
                }),
            ),
            Envelope::aging(
                Address::Raster(raster_uid),
                AgingKey { method: "production_gate_output_queue_update", ..key.clone() },
                Payload::Raster(RasterMsg::ProductionGate(ProductionGateMsg::OutputQueueUpdate {
                    qi: qi.clone(),
                    produced_count,
                    queue_size,
                })),
            ),
            Envelope::aging(
                Address::Raster(raster_uid),
                AgingKey { method: "gate1_output_queue_update", ..key },
                Payload::Raster(RasterMsg::Gate1(Gate1Msg::OutputQueueUpdate {
                    qi: qi.clone(),
                    produced_count,
                    queue_size,
                })),
            ),
        ]
    }

    fn broadcast_cancel(&mut self, qi: QueryId, raster_uid: u64) -> Vec<Envelope> {
        self.active.remove(&qi);
        vec![
            Envelope::basic(Address::Raster(raster_uid), Payload::Raster(RasterMsg::CancelThisQuery(qi))),
            Envelope::basic(Address::Global, Payload::Global(GlobalMsg::CancelThisQuery { qi })),
        ]
    }

    pub fn cancel(&mut self, qi: QueryId) -> Vec<Envelope> {
        self.active.remove(&qi);
        Vec::new()
    }

    /// Keep-alive tick (spec §4.1 step 4): re-samples every live query's
    /// queue so a consumer that is merely draining slowly (no new array
    /// pushed) still sees its pull-rate bookkeeping advance, and detects a
    /// dropped consumer even with no inbound message to trigger on.
    pub fn ext_receive_nothing(&mut self) -> Vec<Envelope> {
        let ids: Vec<QueryId> = self.active.keys().copied().collect();
        let mut out = Vec::new();
        for id in ids {
            let Some((qi, _)) = self.active.get(&id) else { continue };
            let qi = qi.clone();
            let Some(queue) = qi.queue_wref() else {
                out.extend(self.broadcast_cancel(id, qi.raster_uid));
                continue;
            };
            let qsize = queue.qsize();
            let Some((_, state)) = self.active.get_mut(&id) else { continue };
            if state.queue_size != qsize {
                state.queue_size = qsize;
                let produced_count = state.produced_count;
                out.extend(self.emit_queue_update(&qi, produced_count, qsize));
            }
        }
        out
    }
}
