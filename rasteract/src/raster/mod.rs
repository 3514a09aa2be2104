//! Per-raster actors (spec §4.5-§4.13) and the aggregate message/dispatch
//! table that wires them together. Each raster registered with an
//! [`crate::engine::Engine`] owns one [`RasterActors`] bundle, exclusively
//! (spec §3 "Ownership").

pub mod accumulator;
pub mod cache_extractor;
pub mod cache_supervisor;
pub mod computation_gate;
pub mod computer;
pub mod file_checker;
pub mod merger;
pub mod producer;
pub mod production_gate;
pub mod queries_handler;
pub mod reader;
pub mod resampler;
pub mod writer;

use std::sync::Arc;

use crate::descriptor::RasterDescriptor;
use crate::message::Envelope;
use crate::pool::JobDone;
use crate::query::QueryId;

use accumulator::{Accumulator, AccumulatorMsg};
use cache_extractor::{CacheExtractor, CacheExtractorMsg};
use cache_supervisor::{CacheSupervisor, CacheSupervisorMsg};
use computation_gate::{ComputationGate1, ComputationGate2, Gate1Msg, Gate2Msg};
use computer::{Computer, ComputerMsg};
use merger::{Merger, MergerMsg};
use producer::{Producer, ProducerMsg};
use production_gate::{ProductionGate, ProductionGateMsg};
use queries_handler::{QueriesHandler, QueriesHandlerMsg};
use reader::{Reader, ReaderMsg};
use resampler::{Resampler, ResamplerMsg};

/// Every message a per-raster actor can receive, tagged by which actor it
/// targets (spec §2 group `Raster<uid>`).
#[derive(Debug)]
pub enum RasterMsg {
    QueriesHandler(QueriesHandlerMsg),
    ProductionGate(ProductionGateMsg),
    Producer(ProducerMsg),
    CacheSupervisor(CacheSupervisorMsg),
    CacheExtractor(CacheExtractorMsg),
    Reader(ReaderMsg),
    Resampler(ResamplerMsg),
    Gate1(Gate1Msg),
    Gate2(Gate2Msg),
    Computer(ComputerMsg),
    Accumulator(AccumulatorMsg),
    Merger(MergerMsg),
    /// A pool job this raster submitted has completed; which local actor
    /// handles it is determined by the `PoolOutcome` variant (spec §4.3
    /// "job_done to the sender").
    PoolJobDone(JobDone),
    /// Broadcast cancellation (spec §4.5 "Cancellation").
    CancelThisQuery(QueryId),
}

/// The full set of actors owned by one raster, plus the shared descriptor
/// they all read from.
pub struct RasterActors {
    pub descriptor: Arc<RasterDescriptor>,
    pub queries_handler: QueriesHandler,
    pub production_gate: ProductionGate,
    pub producer: Producer,
    pub cache_supervisor: CacheSupervisor,
    pub cache_extractor: CacheExtractor,
    pub reader: Reader,
    pub resampler: Resampler,
    pub gate1: ComputationGate1,
    pub gate2: ComputationGate2,
    pub computer: Computer,
    pub accumulator: Accumulator,
    pub merger: Merger,
}

impl RasterActors {
    pub fn new(descriptor: Arc<RasterDescriptor>) -> Self {
        Self {
            queries_handler: QueriesHandler::new(descriptor.uid),
            production_gate: ProductionGate::new(descriptor.uid),
            producer: Producer::new(descriptor.uid),
            cache_supervisor: CacheSupervisor::new(descriptor.clone()),
            cache_extractor: CacheExtractor::new(descriptor.uid),
            reader: Reader::new(descriptor.clone()),
            resampler: Resampler::new(descriptor.clone()),
            gate1: ComputationGate1::new(descriptor.uid),
            gate2: ComputationGate2::new(descriptor.clone()),
            computer: Computer::new(descriptor.clone()),
            accumulator: Accumulator::new(descriptor.clone()),
            merger: Merger::new(descriptor.clone()),
            descriptor,
        }
    }

    pub fn uid(&self) -> u64 {
        self.descriptor.uid
    }

    /// Routes one message to its target actor and returns the envelopes it
    /// produced. This is the `(actor_kind, message_tag)` dispatch table
    /// design notes §9 calls for.
    pub fn dispatch(&mut self, msg: RasterMsg) -> Vec<Envelope> {
        match msg {
            RasterMsg::QueriesHandler(m) => self.queries_handler.handle(m, &self.descriptor),
            RasterMsg::ProductionGate(m) => self.production_gate.handle(m),
            RasterMsg::Producer(m) => self.producer.handle(m, &self.descriptor),
            RasterMsg::CacheSupervisor(m) => self.cache_supervisor.handle(m),
            RasterMsg::CacheExtractor(m) => self.cache_extractor.handle(m, &self.descriptor),
            RasterMsg::Reader(m) => self.reader.handle(m),
            RasterMsg::Resampler(m) => self.resampler.handle(m),
            RasterMsg::Gate1(m) => self.gate1.handle(m),
            RasterMsg::Gate2(m) => self.gate2.handle(m),
            RasterMsg::Computer(m) => self.computer.handle(m),
            RasterMsg::Accumulator(m) => self.accumulator.handle(m),
            RasterMsg::Merger(m) => self.merger.handle(m),
            RasterMsg::PoolJobDone(JobDone { job_id, outcome }) => {
                self.route_job_done(job_id, outcome)
            }
            RasterMsg::CancelThisQuery(qi) => self.cancel_query(qi),
        }
    }

    fn route_job_done(&mut self, job_id: crate::ids::JobId, outcome: crate::pool::PoolOutcome) -> Vec<Envelope> {
        use crate::pool::PoolOutcome::*;
        match outcome {
            Sample(r) => self.reader.job_done(job_id, r),
            Resampled(r) => self.resampler.job_done(job_id, r),
            Computed(r) => self.computer.job_done(job_id, r, &self.descriptor),
            Merged(r) => self.merger.job_done(job_id, r),
            Written { cache_key, result } => self.cache_supervisor.write_job_done(job_id, cache_key, result),
            Checked(r) => self.cache_supervisor.check_job_done(job_id, r),
        }
    }

    /// Every per-raster actor drops state for `qi` (spec §4.5
    /// "Cancellation", §5).
    fn cancel_query(&mut self, qi: QueryId) -> Vec<Envelope> {
        let mut out = Vec::new();
        out.extend(self.queries_handler.cancel(qi));
        out.extend(self.production_gate.cancel(qi));
        out.extend(self.producer.cancel(qi));
        out.extend(self.cache_extractor.cancel(qi));
        out.extend(self.gate1.cancel(qi));
        out.extend(self.gate2.cancel(qi));
        out
    }

    /// Keep-alive tick for the per-raster actors that need periodic
    /// polling rather than only reacting to messages (spec §4.1 step 4,
    /// §4.5 "Ticking").
    pub fn ext_receive_nothing(&mut self) -> Vec<Envelope> {
        let mut out = self.queries_handler.ext_receive_nothing();
        out.extend(self.gate2.tick());
        out
    }
}
