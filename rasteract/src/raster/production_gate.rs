//! ProductionGate (spec §4.6): bounds how many production tiles of a query
//! are admitted to `Producer` at once, tracking each query's own pull rate.

use std::collections::HashMap;
use std::sync::Arc;

use crate::message::{Address, Envelope, Payload};
use crate::query::{QueryId, QueryInfo};

use super::producer::ProducerMsg;
use super::RasterMsg;

#[derive(Debug)]
pub enum ProductionGateMsg {
    /// A query just started; admit its first window of production tiles.
    MakeThoseArrays { qi: Arc<QueryInfo> },
    /// The consumer's pull rate changed; re-check the admission window.
    OutputQueueUpdate {
        qi: Arc<QueryInfo>,
        produced_count: usize,
        queue_size: usize,
    },
}

pub struct ProductionGate {
    raster_uid: u64,
    allowed_count: HashMap<QueryId, usize>,
}

impl ProductionGate {
    pub fn new(raster_uid: u64) -> Self {
        Self {
            raster_uid,
            allowed_count: HashMap::new(),
        }
    }

    pub fn handle(&mut self, msg: ProductionGateMsg) -> Vec<Envelope> {
        match msg {
            ProductionGateMsg::MakeThoseArrays { qi } => self.admit(&qi, 0),
            ProductionGateMsg::OutputQueueUpdate { qi, produced_count, queue_size } => {
                let pulled = produced_count as i64 - queue_size as i64;
                self.admit(&qi, pulled)
            }
        }
    }

    /// Admits production indices up to `pulled_count + max_queue_size`,
    /// clamped to the query's total (spec §4.6 "bounded backpressure").
    fn admit(&mut self, qi: &Arc<QueryInfo>, pulled_count: i64) -> Vec<Envelope> {
        let bound = (pulled_count + qi.max_queue_size as i64)
            .max(0) as usize;
        let bound = bound.min(qi.produce_count());
        let entry = self.allowed_count.entry(qi.id).or_insert(0);
        let mut out = Vec::new();
        while *entry < bound {
            out.push(Envelope::basic(
                Address::Raster(self.raster_uid),
                Payload::Raster(RasterMsg::Producer(ProducerMsg::MakeThisArray {
                    qi: qi.clone(),
                    prod_idx: *entry,
                })),
            ));
            *entry += 1;
        }
        out
    }

    pub fn cancel(&mut self, qi: QueryId) -> Vec<Envelope> {
        self.allowed_count.remove(&qi);
        Vec::new()
    }
}
