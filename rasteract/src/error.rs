//! Error types for the engine.
//!
//! Mirrors the teacher's split between a cache-shaped error enum
//! (`cache::traits::CacheError`) and an app-level error enum
//! (`app::error::AppError`): [`CacheError`] is always caught and converted
//! into a tile-absent transition inside [`crate::raster::cache_supervisor`]
//! (spec §7, "recovered locally"), while [`EngineError`] is the only error
//! family that ever reaches the user thread.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while validating or writing a single cache file.
///
/// Never escapes the raster it occurred in: `CacheSupervisor` and
/// `FileChecker` catch every variant and log a `warn!` before treating the
/// tile as `absent`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file {path:?} footprint does not match its cache tile")]
    FootprintMismatch { path: PathBuf },

    #[error("cache file {path:?} dtype {found} does not match raster dtype {expected}")]
    DtypeMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },

    #[error("cache file {path:?} has {found} bands, expected {expected}")]
    BandCountMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("cache file {path:?} checksum {found} does not match filename digest {expected}")]
    ChecksumMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },

    #[error("cache file {path:?} name does not embed a valid checksum")]
    MalformedFilename { path: PathBuf },

    #[error("I/O error on cache file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    /// The on-disk path implicated in this error, if any. Lets a caller
    /// (`FileChecker`) delete the offending file on any failure without
    /// matching every variant (spec §4.13 "On any failure, delete the file
    /// and report absent").
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            CacheError::FootprintMismatch { path }
            | CacheError::DtypeMismatch { path, .. }
            | CacheError::BandCountMismatch { path, .. }
            | CacheError::ChecksumMismatch { path, .. }
            | CacheError::MalformedFilename { path }
            | CacheError::Io { path, .. } => Some(path),
        }
    }
}

/// Fatal errors that propagate to the user thread on the next interaction
/// with the scheduler (spec §7 "Scheduler exception" / "Pool job
/// exception" / "User-kernel misbehavior").
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("compute_array for {compute_fp:?} returned shape {found:?}, expected {expected:?}")]
    ComputeShapeMismatch {
        compute_fp: String,
        found: (u32, u32, u32),
        expected: (u32, u32, u32),
    },

    #[error("merge_arrays for a cache tile returned {found} channels, expected {expected}")]
    MergeChannelMismatch { found: u32, expected: u32 },

    #[error("user kernel panicked: {0}")]
    KernelPanic(String),

    #[error("pool job panicked: {0}")]
    PoolJobPanic(String),

    #[error("scheduler thread panicked: {0}")]
    SchedulerPanicked(String),

    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error("raster {0} is not registered with this engine")]
    UnknownRaster(String),

    #[error("query was cancelled")]
    Cancelled,
}
