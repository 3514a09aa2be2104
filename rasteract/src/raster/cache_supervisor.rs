//! CacheSupervisor (spec §4.9 component table row "Cache supervisor"):
//! owns the status of every cache tile and is the sole trigger of
//! `FileChecker`/`Writer`/compute-gate requests, which is what keeps a
//! cache tile's computation to at most one in flight at a time (spec §5
//! "at most one in-flight computation per cache tile", resolved in
//! DESIGN.md).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::descriptor::RasterDescriptor;
use crate::error::CacheError;
use crate::footprint::Footprint;
use crate::ids::JobId;
use crate::message::{Address, Envelope, Payload};
use crate::query::{Array, QueryInfo};

use super::cache_extractor::{CacheExtractorMsg, CacheSource};
use super::computation_gate::Gate1Msg;
use super::file_checker::{CheckStatus, FileChecker, FileCheckerMsg};
use super::writer::{Writer, WrittenFile, WriterMsg};
use super::RasterMsg;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Status {
    Checking,
    Absent,
    Ready,
}

#[derive(Debug)]
pub enum CacheSupervisorMsg {
    /// A query has started depending on this cache tile (spec §4.4
    /// "collection phase"); kicks off the status check the first time any
    /// query asks about a given tile.
    RequestCacheTile { qi: Arc<QueryInfo>, cache_fp: Footprint },
    /// Merger finished combining this cache tile's compute arrays.
    WriteThisCacheTile { cache_fp: Footprint, array: Array },
}

pub struct CacheSupervisor {
    descriptor: Arc<RasterDescriptor>,
    status: HashMap<(i64, i64), Status>,
    /// The first query that discovered a tile `Absent`; used to name the
    /// `qi` the compute gate request is attributed to. Cleared once the
    /// compute has been dispatched, enforcing at-most-one.
    computing: HashSet<(i64, i64)>,
    /// cache_fp for a tile still in `Checking`, kept so `check_job_done`
    /// (whose `CheckStatus` only carries the `(i64,i64)` key) can still
    /// build full envelopes.
    cache_fps: HashMap<(i64, i64), Footprint>,
    /// The query that triggered a tile's file check, kept so a disk-absent
    /// verdict (which arrives with no `qi` of its own) still has one to
    /// attribute the compute-gate request to.
    checking_driver: HashMap<(i64, i64), Arc<QueryInfo>>,
    memory: HashMap<(i64, i64), Array>,
    file_checker: FileChecker,
    writer: Writer,
}

impl CacheSupervisor {
    pub fn new(descriptor: Arc<RasterDescriptor>) -> Self {
        Self {
            descriptor,
            status: HashMap::new(),
            computing: HashSet::new(),
            cache_fps: HashMap::new(),
            checking_driver: HashMap::new(),
            memory: HashMap::new(),
            file_checker: FileChecker::new(),
            writer: Writer::new(),
        }
    }

    pub fn handle(&mut self, msg: CacheSupervisorMsg) -> Vec<Envelope> {
        match msg {
            CacheSupervisorMsg::RequestCacheTile { qi, cache_fp } => self.request(qi, cache_fp),
            CacheSupervisorMsg::WriteThisCacheTile { cache_fp, array } => self.write_tile(cache_fp, array),
        }
    }

    fn request(&mut self, qi: Arc<QueryInfo>, cache_fp: Footprint) -> Vec<Envelope> {
        let key = cache_fp.tiebreak_key();
        self.cache_fps.entry(key).or_insert(cache_fp);
        match self.status.get(&key).copied() {
            None => {
                self.status.insert(key, Status::Checking);
                match &self.descriptor.cache_dir {
                    Some(dir) => {
                        self.checking_driver.insert(key, qi.clone());
                        let fname_prefix = self.descriptor.fname_prefix_of_cache_fp(&cache_fp);
                        let msg = FileCheckerMsg::CheckThisCacheTile {
                            cache_key: key,
                            cache_dir: dir.clone(),
                            fname_prefix,
                            expected_width: cache_fp.width(),
                            expected_height: cache_fp.height(),
                            expected_channels: self.descriptor.channel_count,
                            expected_dtype: self.descriptor.dtype,
                        };
                        self.file_checker.handle(msg, self.descriptor.uid, self.descriptor.pools.io)
                    }
                    // A memory-backed raster has nothing on disk to probe;
                    // every tile starts life absent.
                    None => self.on_absent(key, cache_fp, Some(qi)),
                }
            }
            Some(Status::Absent) => self.on_absent(key, cache_fp, Some(qi)),
            Some(Status::Checking) | Some(Status::Ready) => Vec::new(),
        }
    }

    fn on_absent(&mut self, key: (i64, i64), cache_fp: Footprint, driver: Option<Arc<QueryInfo>>) -> Vec<Envelope> {
        self.status.insert(key, Status::Absent);
        let Some(qi) = driver else {
            return Vec::new();
        };
        if !self.computing.insert(key) {
            return Vec::new();
        }
        vec![Envelope::basic(
            Address::Raster(self.descriptor.uid),
            Payload::Raster(RasterMsg::Gate1(Gate1Msg::ComputeThoseCacheFiles { qi, cache_fp })),
        )]
    }

    fn write_tile(&mut self, cache_fp: Footprint, array: Array) -> Vec<Envelope> {
        let key = cache_fp.tiebreak_key();
        match &self.descriptor.cache_dir {
            None => {
                self.memory.insert(key, array.clone());
                self.mark_ready(key, CacheSource::Memory(array))
            }
            Some(dir) => {
                let fname_prefix = self.descriptor.fname_prefix_of_cache_fp(&cache_fp);
                let msg = WriterMsg::WriteThisArray {
                    cache_key: key,
                    cache_fp,
                    array,
                    cache_dir: dir.clone(),
                    fname_prefix,
                    channel_count: self.descriptor.channel_count,
                    dtype: self.descriptor.dtype,
                };
                self.writer.handle(msg, self.descriptor.uid, self.descriptor.pools.io)
            }
        }
    }

    fn mark_ready(&mut self, key: (i64, i64), source: CacheSource) -> Vec<Envelope> {
        self.status.insert(key, Status::Ready);
        self.computing.remove(&key);
        vec![Envelope::basic(
            Address::Raster(self.descriptor.uid),
            Payload::Raster(RasterMsg::CacheExtractor(CacheExtractorMsg::TileBecameReady {
                cache_key: key,
                source,
            })),
        )]
    }

    /// Routes a completed file check: `Found` becomes `Ready`, `Absent`
    /// drives the at-most-one compute request, and an `Err` is treated the
    /// same as `Absent` after logging (spec §7 "Cache file
    /// corruption/inconsistency" — `FileChecker` already deletes the
    /// offending file before this is ever reached).
    pub fn check_job_done(&mut self, _job_id: JobId, result: Result<CheckStatus, CacheError>) -> Vec<Envelope> {
        match result {
            Ok(CheckStatus::Found { cache_key, path }) => self.mark_ready(cache_key, CacheSource::Disk(path)),
            Ok(CheckStatus::Absent { cache_key }) => {
                let Some(cache_fp) = self.cache_fps.get(&cache_key).copied() else {
                    return Vec::new();
                };
                let driver = self.checking_driver.remove(&cache_key);
                self.on_absent(cache_key, cache_fp, driver)
            }
            Err(e) => {
                // `FileChecker` normalizes every failure into `Ok(Absent)`
                // after deleting the offending file; `CacheError::path()`
                // is `Some` for every variant, so this arm is unreachable in
                // practice and exists only because the type is a `Result`.
                tracing::warn!(error = %e, "cache file check failed");
                Vec::new()
            }
        }
    }

    /// Routes a completed write: success makes the tile `Ready` for every
    /// waiting query; failure is logged and the tile's `computing` flag is
    /// cleared so it reverts to plain `Absent` — a later query re-triggers
    /// the whole check/compute/write cycle instead of hanging forever
    /// behind a wedged at-most-one guard (spec §7 "recovered locally").
    pub fn write_job_done(
        &mut self,
        _job_id: JobId,
        cache_key: (i64, i64),
        result: Result<WrittenFile, CacheError>,
    ) -> Vec<Envelope> {
        match result {
            Ok(WrittenFile { cache_key, path }) => self.mark_ready(cache_key, CacheSource::Disk(path)),
            Err(e) => {
                tracing::error!(error = %e, "writing cache tile failed, tile will be retried on next query");
                self.status.insert(cache_key, Status::Absent);
                self.computing.remove(&cache_key);
                Vec::new()
            }
        }
    }
}
