//! Two-room pool actors multiplexing a thread pool under a token
//! discipline (spec §2, §4.2, §4.3, §9 "Two-layer token bucket").

pub mod waiting_room;
pub mod working_room;

use std::sync::Arc;

use rayon::ThreadPool;

pub use waiting_room::{WaitingRoom, WaitingRoomMsg};
pub use working_room::{WorkingRoom, WorkingRoomMsg};

use crate::error::{CacheError, EngineError};
use crate::footprint::Footprint;
use crate::ids::JobId;
use crate::message::Address;
use crate::query::{Array, QueryId};
use crate::raster::file_checker::CheckStatus;
use crate::raster::writer::WrittenFile;

/// Identity of a registered pool instance. Multiple rasters may share one
/// `PoolId` (spec §5 "Pools: shared by multiple rasters").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub u32);

static NEXT_POOL_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(1);

impl PoolId {
    pub fn next() -> Self {
        PoolId(NEXT_POOL_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

/// A worker pool with a fixed worker count (spec §6 "Pool abstraction").
/// Backed by `rayon`, the same crate the teacher already depends on and
/// uses elsewhere for bounded parallel CPU work (`pipeline::cpu_limiter`).
///
/// The reference implementation here is thread-pool-backed only: `rayon`
/// workers share the scheduler's address space, matching spec §6's
/// `same_address_space = true` branch. A worker-*process* pool would need
/// an IPC transport for closures and results that is out of scope for this
/// transformation (see DESIGN.md's Open Question resolution) — the trait
/// boundary (`apply`/poll-by-`JobId`) is shaped so one could be added
/// without touching `WaitingRoom`/`WorkingRoom`.
pub struct ThreadPoolHandle {
    pool: ThreadPool,
}

impl ThreadPoolHandle {
    pub fn new(worker_count: usize) -> Result<Self, EngineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_count.max(1))
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build pool thread pool: {e}")))?;
        Ok(Self { pool })
    }

    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `f` on the pool, delivering its result on `tx` when done. The
    /// caller (`WorkingRoom`) holds the receiving half and polls it
    /// non-blockingly each scheduler tick.
    pub fn spawn(&self, f: impl FnOnce() -> PoolOutcome + Send + 'static) -> crossbeam_channel::Receiver<PoolOutcome> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.pool.spawn(move || {
            let outcome = f();
            let _ = tx.send(outcome);
        });
        rx
    }
}

/// The three waiting classes a job is tagged with (spec §4.2).
#[derive(Clone, Debug)]
pub enum WaitingClass {
    /// Always the most urgent (checksum verification, writer flushes —
    /// anything on the critical path to an at-most-one cache computation).
    MaxPriority,
    /// A job serving one production tile of one query.
    Production {
        qi: QueryId,
        prod_idx: usize,
        action_priority: u8,
        footprint: Footprint,
    },
    /// A job serving one cache tile, shared by every query that depends on
    /// it.
    Cache {
        raster_uid: crate::ids::RasterUid,
        cache_fp: Footprint,
        action_priority: u8,
        footprint: Footprint,
    },
}

/// Outcome of a pool job (spec §4.10-§4.13). One variant per kind of
/// producer that submits work through a pool; kept as a single sum type
/// rather than a generic so `WaitingRoom`/`WorkingRoom` can hold
/// heterogeneous pending jobs (design notes §9 "sum types of messages").
#[derive(Debug)]
pub enum PoolOutcome {
    Sample(Result<Array, CacheError>),
    Resampled(Result<Array, EngineError>),
    Computed(Result<Array, EngineError>),
    Merged(Result<Array, EngineError>),
    Written {
        /// Carried alongside the result (not just inside `Ok`) so a failed
        /// write still tells `CacheSupervisor` which tile's `computing`
        /// flag to clear (spec §7 "recovered locally").
        cache_key: (i64, i64),
        result: Result<WrittenFile, CacheError>,
    },
    Checked(Result<CheckStatus, CacheError>),
}

/// A unit of pool work: what it is (for ordering), who to notify, and the
/// closure that does the work on a pool thread.
pub struct PoolJob {
    pub id: JobId,
    pub class: WaitingClass,
    /// Where to route the `job_done` message once this job completes.
    pub origin: Address,
    pub run: Box<dyn FnOnce() -> PoolOutcome + Send>,
}

impl std::fmt::Debug for PoolJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolJob")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("origin", &self.origin)
            .finish()
    }
}

/// A completed job, as delivered to the origin actor.
#[derive(Debug)]
pub struct JobDone {
    pub job_id: JobId,
    pub outcome: PoolOutcome,
}

/// Messages addressed to one of a pool's two actors (spec §2 "Pool<pool_id>").
#[derive(Debug)]
pub enum PoolMsg {
    WaitingRoom(WaitingRoomMsg),
    WorkingRoom(WorkingRoomMsg),
}

pub(crate) fn arc_handle(worker_count: usize) -> Result<Arc<ThreadPoolHandle>, EngineError> {
    Ok(Arc::new(ThreadPoolHandle::new(worker_count)?))
}
