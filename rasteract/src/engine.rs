//! The public façade (spec §6 "Query API"): owns the single scheduler
//! thread and the thread-safe ingress external threads push messages into
//! (spec §5 "Thread-safety boundary").
//!
//! Grounded on the teacher's `app::bootstrap`/`service::orchestrator` split
//! between "build the wiring once" and "run a background loop" — here
//! collapsed into one `Engine` since there is a single scheduler rather
//! than several cooperating services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::descriptor::{Interpolation, Nodata, RasterDescriptor};
use crate::error::EngineError;
use crate::footprint::Footprint;
use crate::ids::RasterUid;
use crate::message::{Address, Envelope, Payload};
use crate::pool::PoolId;
use crate::query::BoundedQueue;
use crate::query_builder::build_query_info;
use crate::raster::queries_handler::QueriesHandlerMsg;
use crate::raster::RasterMsg;
use crate::scheduler::Scheduler;

/// Builds an [`Engine`]: register every raster and pool up front, then
/// `build()` to hand ownership of the wiring to the scheduler thread.
///
/// Registration is not part of the message protocol (spec §4.1 only
/// dispatches already-registered actors), so unlike `queue_data` it happens
/// synchronously before the scheduler thread starts, mirroring how the
/// external `DataSource` façade (spec §1, out of scope here) registers
/// rasters once at startup rather than mid-run.
pub struct EngineBuilder {
    config: EngineConfig,
    rasters: Vec<Arc<RasterDescriptor>>,
    pools: Vec<(PoolId, usize)>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            rasters: Vec::new(),
            pools: Vec::new(),
        }
    }

    pub fn with_raster(mut self, descriptor: Arc<RasterDescriptor>) -> Self {
        self.rasters.push(descriptor);
        self
    }

    pub fn with_pool(mut self, pool_id: PoolId, worker_count: usize) -> Self {
        self.pools.push((pool_id, worker_count));
        self
    }

    pub fn build(self) -> Result<Arc<Engine>, EngineError> {
        let mut scheduler = Scheduler::new();
        let mut descriptors = HashMap::new();
        for d in self.rasters {
            descriptors.insert(d.uid, d.clone());
            scheduler.register_raster(d);
        }
        for (pool_id, worker_count) in self.pools {
            scheduler.register_pool(pool_id, worker_count)?;
        }

        let (ingress_tx, ingress_rx) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let fatal = Arc::new(Mutex::new(None));

        let engine = Arc::new(Engine {
            config: self.config.clone(),
            descriptors: Mutex::new(descriptors),
            ingress_tx,
            stop: stop.clone(),
            errors: errors.clone(),
            fatal: fatal.clone(),
            handle: Mutex::new(None),
        });

        let idle_sleep = self.config.idle_sleep;
        let handle = std::thread::Builder::new()
            .name("rasteract-scheduler".into())
            .spawn(move || run_scheduler_loop(scheduler, ingress_rx, stop, errors, fatal, idle_sleep))
            .map_err(|e| EngineError::Config(format!("failed to spawn scheduler thread: {e}")))?;
        *engine.handle.lock() = Some(handle);

        Ok(engine)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The single scheduler thread's body (spec §4.1 dispatch algorithm, steps
/// 3-6): drain one external message per round, tick, sleep when idle, exit
/// on the stop flag. Each round runs behind `catch_unwind` so a panic inside
/// `scheduler.tick()` (a user kernel or pool job run inline with no pool
/// assigned) is captured as an `EngineError::SchedulerPanicked` and handed
/// to the user thread on its next call, rather than taking this thread down
/// silently (spec §7 "Scheduler exception"). The `errors`/`fatal` mutexes
/// are `parking_lot`'s, matching `raster::computer`/`raster::merger`'s own
/// error sinks, so there is no poisoning to recover from on that path
/// either.
fn run_scheduler_loop(
    mut scheduler: Scheduler,
    ingress_rx: Receiver<Envelope>,
    stop: Arc<AtomicBool>,
    errors: Arc<Mutex<Vec<(RasterUid, EngineError)>>>,
    fatal: Arc<Mutex<Option<EngineError>>>,
    idle_sleep: std::time::Duration,
) {
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let round = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut progress = false;
            while let Ok(env) = ingress_rx.try_recv() {
                progress = true;
                scheduler.submit(env);
            }
            if scheduler.tick() {
                progress = true;
            }
            let fresh = scheduler.collect_errors();
            if !fresh.is_empty() {
                errors.lock().extend(fresh);
            }
            progress
        }));
        let progress = match round {
            Ok(progress) => progress,
            Err(payload) => {
                let message = panic_message(&*payload);
                tracing::error!(panic = %message, "scheduler thread panicked, stopping engine");
                *fatal.lock() = Some(EngineError::SchedulerPanicked(message));
                stop.store(true, Ordering::Release);
                return;
            }
        };
        if !progress {
            if stop.load(Ordering::Acquire) {
                return;
            }
            std::thread::sleep(idle_sleep);
        }
    }
}

/// Owns the scheduler thread and every registered raster descriptor; the
/// single entry point the user thread calls into (spec §6 "Query API").
pub struct Engine {
    config: EngineConfig,
    descriptors: Mutex<HashMap<RasterUid, Arc<RasterDescriptor>>>,
    ingress_tx: Sender<Envelope>,
    stop: Arc<AtomicBool>,
    errors: Arc<Mutex<Vec<(RasterUid, EngineError)>>>,
    fatal: Arc<Mutex<Option<EngineError>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Launches a query against a registered raster (spec §6 `queue_data`).
    /// Returns the bounded queue output arrays will be pushed to, in
    /// `produce_fps` order; dropping it cancels the query.
    #[allow(clippy::too_many_arguments)]
    pub fn queue_data(
        &self,
        raster_uid: RasterUid,
        produce_fps: &[Footprint],
        channel_ids: Vec<u32>,
        is_flat: bool,
        dst_nodata: Nodata,
        interpolation: Interpolation,
        max_queue_size: Option<usize>,
    ) -> Result<Arc<BoundedQueue>, EngineError> {
        self.queue_data_for_parent(
            raster_uid,
            produce_fps,
            channel_ids,
            is_flat,
            dst_nodata,
            interpolation,
            max_queue_size,
            None,
            None,
        )
    }

    /// As [`Engine::queue_data`], but tagging the query with the parent
    /// recipe raster that launched it (spec §3 `parent_uid`/`key_in_parent`,
    /// "recipe-of-recipe chaining"). Used by `PrimitiveDescriptor::launch_query`
    /// closures wired at raster-registration time.
    #[allow(clippy::too_many_arguments)]
    pub fn queue_data_for_parent(
        &self,
        raster_uid: RasterUid,
        produce_fps: &[Footprint],
        channel_ids: Vec<u32>,
        is_flat: bool,
        dst_nodata: Nodata,
        interpolation: Interpolation,
        max_queue_size: Option<usize>,
        parent_uid: Option<RasterUid>,
        key_in_parent: Option<String>,
    ) -> Result<Arc<BoundedQueue>, EngineError> {
        let descriptor = self
            .descriptors
            .lock()
            .get(&raster_uid)
            .cloned()
            .ok_or_else(|| EngineError::UnknownRaster(raster_uid.to_string()))?;

        let max_queue_size = max_queue_size.unwrap_or(self.config.default_max_queue_size);
        let queue = BoundedQueue::new(max_queue_size);
        let qi = Arc::new(build_query_info(
            &descriptor,
            produce_fps,
            channel_ids,
            dst_nodata,
            interpolation,
            is_flat,
            max_queue_size,
            parent_uid,
            key_in_parent,
            &queue,
        ));

        self.ingress_tx
            .send(Envelope::basic(
                Address::Raster(raster_uid),
                Payload::Raster(RasterMsg::QueriesHandler(QueriesHandlerMsg::NewQuery { qi })),
            ))
            .map_err(|_| EngineError::Cancelled)?;

        Ok(queue)
    }

    /// A closure suitable for [`crate::descriptor::PrimitiveDescriptor::launch_query`]:
    /// queries `raster_uid` for `fp` as a primitive feed of `consumer_uid`. A
    /// misconfigured recipe-of-recipe (primitive not registered with this
    /// engine) is recoverable, not fatal (spec §7 "recovered locally"): the
    /// failure is recorded against `consumer_uid` for `take_errors` and the
    /// closure still returns a queue, just one with nothing to deliver, so
    /// `ComputationGate2` simply never admits rather than the scheduler
    /// thread panicking.
    pub fn primitive_launcher(
        self: &Arc<Self>,
        raster_uid: RasterUid,
        consumer_uid: RasterUid,
        key_in_parent: String,
    ) -> Arc<dyn Fn(Footprint) -> Arc<BoundedQueue> + Send + Sync> {
        let engine = self.clone();
        Arc::new(move |fp: Footprint| {
            match engine.queue_data_for_parent(
                raster_uid,
                &[fp],
                vec![0],
                false,
                Nodata::None,
                Interpolation::Nearest,
                None,
                Some(consumer_uid),
                Some(key_in_parent.clone()),
            ) {
                Ok(queue) => queue,
                Err(e) => {
                    tracing::error!(
                        primitive_raster = raster_uid,
                        consumer_raster = consumer_uid,
                        error = %e,
                        "failed to launch primitive query"
                    );
                    engine.errors.lock().push((consumer_uid, e));
                    BoundedQueue::new(0)
                }
            }
        })
    }

    /// Drains every fatal user-kernel/pool-job error raised since the last
    /// call (spec §7 "propagates to the user thread on the next scheduler
    /// interaction").
    pub fn take_errors(&self) -> Vec<(RasterUid, EngineError)> {
        std::mem::take(&mut self.errors.lock())
    }

    /// Drains a captured scheduler-thread panic, if one has stopped the
    /// engine (spec §7 "Scheduler exception"). Once this returns `Some`,
    /// the scheduler thread has exited and no further queries will be
    /// serviced; callers should treat it like any other fatal `EngineError`
    /// rather than call `take_errors` in a loop expecting more progress.
    pub fn take_fatal_error(&self) -> Option<EngineError> {
        self.fatal.lock().take()
    }

    /// Stops the scheduler thread and waits for it to exit. Idempotent.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DType, PoolAssignments};
    use crate::footprint::AffineGrid;
    use crate::query::Array;

    fn grid() -> AffineGrid {
        AffineGrid {
            tl_x: 0.0,
            tl_y: 0.0,
            px_w: 1.0,
            px_h: -1.0,
        }
    }

    fn descriptor(uid: RasterUid) -> Arc<RasterDescriptor> {
        Arc::new(RasterDescriptor {
            uid,
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
            compute_array: Arc::new(|fp, _, _| Ok(Array::filled((fp.height(), fp.width(), 1), 3.14))),
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
    fn queue_data_delivers_one_array_end_to_end() {
        let engine = EngineBuilder::new(EngineConfig::new())
            .with_raster(descriptor(1))
            .build()
            .expect("engine builds");

        let queue = engine
            .queue_data(
                1,
                &[Footprint::new(grid(), (8, 8))],
                vec![0],
                false,
                Nodata::None,
                Interpolation::Nearest,
                Some(4),
            )
            .expect("raster is registered");

        let array = queue.recv().expect("scheduler thread eventually produces it");
        assert_eq!(array.data[0], 3.14);
        engine.shutdown();
    }

    #[test]
    fn unknown_raster_is_a_config_error_not_a_panic() {
        let engine = EngineBuilder::new(EngineConfig::new())
            .build()
            .expect("engine builds");
        let result = engine.queue_data(
            99,
            &[Footprint::new(grid(), (8, 8))],
            vec![0],
            false,
            Nodata::None,
            Interpolation::Nearest,
            None,
        );
        assert!(matches!(result, Err(EngineError::UnknownRaster(_))));
        engine.shutdown();
    }
}
