//! Small identifier newtypes shared across the scheduler.

/// Identity of a registered raster (spec §3 "Identity (uid)").
pub type RasterUid = u64;

/// Identity of a pool job, threaded from `WaitingRoom` through
/// `WorkingRoom` back to `job_done`/`salvage_token` (supplemented from
/// `buzzard/_actors/pool_job.py`, see SPEC_FULL.md §14).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

static NEXT_JOB_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl JobId {
    pub fn next() -> Self {
        JobId(NEXT_JOB_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}
