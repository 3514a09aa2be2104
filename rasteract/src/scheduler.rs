//! The dispatch loop (spec §4.1): a LIFO stack of in-flight envelopes,
//! drained depth-first, with aging-message collapse and keep-alive ticking
//! for the actors that need to notice state changes with no message of
//! their own to react to.
//!
//! Design notes §9 call for "(GroupKind, GroupId, ActorKind)" addressing
//! and closed sum types rather than dynamic dispatch; [`Scheduler`] is the
//! piece that resolves an [`Address`] to the actor owning it and routes the
//! envelope's payload to that actor's own `handle`/`dispatch` method.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::ids::RasterUid;
use crate::message::{AgingKey, Delivery, Envelope, Payload};
use crate::descriptor::RasterDescriptor;
use crate::pool::{PoolId, PoolMsg, WaitingRoom, WaitingRoomMsg, WorkingRoom};
use crate::priorities_watcher::GlobalPrioritiesWatcher;
use crate::raster::RasterActors;
use std::sync::Arc;

use crate::message::Address;

struct PoolState {
    waiting_room: WaitingRoom,
    working_room: WorkingRoom,
}

/// Owns every registered actor and the message stack connecting them.
/// Single-threaded by construction — the whole point of the design (spec
/// §1 "a single-threaded, message-passing scheduler").
pub struct Scheduler {
    rasters: HashMap<RasterUid, RasterActors>,
    pools: HashMap<PoolId, PoolState>,
    watcher: GlobalPrioritiesWatcher,
    stack: Vec<Envelope>,
    aging_latest: HashMap<AgingKey, u64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            rasters: HashMap::new(),
            pools: HashMap::new(),
            watcher: GlobalPrioritiesWatcher::new(),
            stack: Vec::new(),
            aging_latest: HashMap::new(),
        }
    }

    pub fn register_raster(&mut self, descriptor: Arc<RasterDescriptor>) {
        self.rasters.insert(descriptor.uid, RasterActors::new(descriptor));
    }

    pub fn register_pool(&mut self, pool_id: PoolId, worker_count: usize) -> Result<(), EngineError> {
        let handle = crate::pool::arc_handle(worker_count)?;
        self.pools.insert(
            pool_id,
            PoolState {
                waiting_room: WaitingRoom::new(pool_id, worker_count),
                working_room: WorkingRoom::new(pool_id, handle),
            },
        );
        Ok(())
    }

    /// Enqueues one envelope (spec §4.1 step 3 "drain one external
    /// message" — collapsed here into "push it, it's drained on the next
    /// round" since there is no separate ingress thread in this
    /// implementation; see DESIGN.md).
    pub fn submit(&mut self, env: Envelope) {
        self.push(env);
    }

    fn push(&mut self, env: Envelope) {
        if let Delivery::Aging { key, seq } = &env.delivery {
            self.aging_latest
                .entry(key.clone())
                .and_modify(|latest| *latest = (*latest).max(*seq))
                .or_insert(*seq);
        }
        self.stack.push(env);
    }

    fn is_stale(&self, env: &Envelope) -> bool {
        match &env.delivery {
            Delivery::Aging { key, seq } => self
                .aging_latest
                .get(key)
                .is_some_and(|latest| *latest != *seq),
            _ => false,
        }
    }

    /// One full dispatch round: drains the stack (cascading every message
    /// it produces), then round-robin ticks every keep-alive actor (spec
    /// §4.1 steps 2 and 4). Returns whether any work happened.
    pub fn tick(&mut self) -> bool {
        let mut progress = false;

        while let Some(env) = self.stack.pop() {
            progress = true;
            if self.is_stale(&env) {
                continue;
            }
            let produced = self.dispatch_one(env);
            for e in produced {
                self.push(e);
            }
        }

        let mut keep_alive = Vec::new();
        for actors in self.rasters.values_mut() {
            keep_alive.extend(actors.ext_receive_nothing());
        }
        for pool in self.pools.values_mut() {
            keep_alive.extend(pool.working_room.ext_receive_nothing());
        }
        if !keep_alive.is_empty() {
            progress = true;
            for e in keep_alive {
                self.push(e);
            }
        }

        progress
    }

    /// Drains rounds until one makes no progress.
    pub fn run_until_idle(&mut self) {
        while self.tick() {}
    }

    fn dispatch_one(&mut self, env: Envelope) -> Vec<Envelope> {
        let Envelope { to, delivery, payload } = env;
        match to {
            Address::Global => match payload {
                Payload::Global(m) => self.watcher.handle(m),
                _ => {
                    tracing::error!("message addressed to Global carried a non-Global payload");
                    Vec::new()
                }
            },
            Address::Raster(uid) => match payload {
                Payload::Raster(m) => match self.rasters.get_mut(&uid) {
                    Some(actors) => actors.dispatch(m),
                    None => {
                        self.log_missing_recipient(&delivery, "raster", uid);
                        Vec::new()
                    }
                },
                _ => {
                    tracing::error!(raster_uid = uid, "message addressed to a raster carried a non-Raster payload");
                    Vec::new()
                }
            },
            Address::Pool(pool_id) => match payload {
                Payload::Pool(m) => self.dispatch_pool(pool_id, m, &delivery),
                _ => {
                    tracing::error!(?pool_id, "message addressed to a pool carried a non-Pool payload");
                    Vec::new()
                }
            },
            // The only payload ever broadcast this way is a priorities
            // snapshot (spec §4.4): `Priorities` is cheap to clone, so this
            // is the one case where fanning an envelope out to every
            // currently-registered pool doesn't need the envelope itself to
            // be `Clone`.
            Address::AllPools => match payload {
                Payload::Pool(PoolMsg::WaitingRoom(WaitingRoomMsg::PrioritiesUpdated(p))) => {
                    let ids: Vec<PoolId> = self.pools.keys().copied().collect();
                    let mut out = Vec::new();
                    for id in ids {
                        out.extend(self.dispatch_pool(
                            id,
                            PoolMsg::WaitingRoom(WaitingRoomMsg::PrioritiesUpdated(p.clone())),
                            &delivery,
                        ));
                    }
                    out
                }
                _ => {
                    tracing::error!("AllPools broadcast received an unsupported payload");
                    Vec::new()
                }
            },
        }
    }

    fn dispatch_pool(&mut self, pool_id: PoolId, msg: PoolMsg, delivery: &Delivery) -> Vec<Envelope> {
        let Some(pool) = self.pools.get_mut(&pool_id) else {
            self.log_missing_recipient(delivery, "pool", pool_id);
            return Vec::new();
        };
        match msg {
            PoolMsg::WaitingRoom(m) => pool.waiting_room.handle(m),
            PoolMsg::WorkingRoom(m) => pool.working_room.handle(m),
        }
    }

    fn log_missing_recipient(&self, delivery: &Delivery, kind: &'static str, id: impl std::fmt::Debug) {
        match delivery {
            // Droppable messages to a torn-down recipient are routine (spec
            // §4.1 "Message types"), not worth more than a trace line.
            Delivery::Droppable => tracing::trace!(?id, kind, "dropping message to a torn-down recipient"),
            _ => tracing::error!(?id, kind, "message addressed to an unregistered recipient"),
        }
    }

    /// Collects every fatal error raised by a user kernel (`compute_array`/
    /// `merge_arrays`) since the last call, across every registered raster
    /// (spec §7).
    pub fn collect_errors(&self) -> Vec<(RasterUid, EngineError)> {
        let mut out = Vec::new();
        for (uid, actors) in &self.rasters {
            let mut computer_errors = actors.computer.error_sink().lock();
            out.extend(computer_errors.drain(..).map(|e| (*uid, e)));
            drop(computer_errors);
            let mut merger_errors = actors.merger.error_sink().lock();
            out.extend(merger_errors.drain(..).map(|e| (*uid, e)));
        }
        out
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DType, Nodata, PoolAssignments};
    use crate::footprint::{AffineGrid, Footprint};
    use crate::query::Array;
    use crate::query_builder::build_query_info;
    use crate::query::BoundedQueue;
    use crate::raster::queries_handler::QueriesHandlerMsg;
    use crate::raster::RasterMsg;
    use crate::message::Payload;

    fn grid() -> AffineGrid {
        AffineGrid {
            tl_x: 0.0,
            tl_y: 0.0,
            px_w: 1.0,
            px_h: -1.0,
        }
    }

    fn descriptor() -> Arc<RasterDescriptor> {
        Arc::new(RasterDescriptor {
            uid: 1,
            fp: Footprint::new(grid(), (8, 8)),
            dtype: DType::F32,
            channel_count: 1,
            nodata: Nodata::None,
            cache_dir: None,
            cache_tile_size: (8, 8),
            compute_tile_size: (8, 8),
            max_resampling_size: None,
            primitives: Vec::new(),
            pools: PoolAssignments::default(),
            compute_array: Arc::new(|fp, _, _| Ok(Array::filled((fp.height(), fp.width(), 1), 7.0))),
            merge_arrays: Arc::new(|fp, arrays| {
                let (_, array) = arrays.iter().next().expect("one compute tile");
                Ok(Array {
                    shape: (fp.height(), fp.width(), 1),
                    data: array.data.clone(),
                })
            }),
        })
    }

    #[test]
    fn a_trivial_query_runs_to_completion_inline() {
        let mut scheduler = Scheduler::new();
        let d = descriptor();
        scheduler.register_raster(d.clone());

        let queue = BoundedQueue::new(4);
        let qi = Arc::new(build_query_info(
            &d,
            &[Footprint::new(grid(), (8, 8))],
            vec![0],
            Nodata::None,
            crate::descriptor::Interpolation::Nearest,
            false,
            4,
            None,
            None,
            &queue,
        ));
        scheduler.submit(Envelope::basic(
            Address::Raster(1),
            Payload::Raster(RasterMsg::QueriesHandler(QueriesHandlerMsg::NewQuery { qi })),
        ));
        scheduler.run_until_idle();

        let array = queue.try_recv().expect("one array produced");
        assert_eq!(array.data[0], 7.0);
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn dropping_the_queue_eventually_stops_the_query() {
        let mut scheduler = Scheduler::new();
        let d = descriptor();
        scheduler.register_raster(d.clone());

        let queue = BoundedQueue::new(1);
        let qi = Arc::new(build_query_info(
            &d,
            &[Footprint::new(grid(), (8, 8)), Footprint::new(grid(), (8, 8))],
            vec![0],
            Nodata::None,
            crate::descriptor::Interpolation::Nearest,
            false,
            1,
            None,
            None,
            &queue,
        ));
        scheduler.submit(Envelope::basic(
            Address::Raster(1),
            Payload::Raster(RasterMsg::QueriesHandler(QueriesHandlerMsg::NewQuery { qi })),
        ));
        drop(queue);
        // Should not panic or loop forever even though the consumer is gone.
        scheduler.run_until_idle();
    }
}
