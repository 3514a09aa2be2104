//! CacheExtractor (spec §4.9 component table row "Cache extractor"): delays
//! per-query cache reads until their cache tiles become readable, then
//! forwards each tile's bytes to `Producer` as it is read.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::descriptor::RasterDescriptor;
use crate::error::CacheError;
use crate::footprint::Footprint;
use crate::message::{Address, Envelope, Payload};
use crate::query::{Array, QueryId, QueryInfo};

use super::producer::ProducerMsg;
use super::reader::ReaderMsg;
use super::RasterMsg;

/// Where a ready cache tile's bytes live. Most rasters persist to disk; a
/// raster configured without a `cache_dir` keeps its merged tiles in
/// process memory instead (see `CacheSupervisor`, DESIGN.md).
#[derive(Clone)]
pub enum CacheSource {
    Disk(PathBuf),
    Memory(Array),
}

type Waiter = (Arc<QueryInfo>, usize, Footprint);

#[derive(Debug)]
pub enum CacheExtractorMsg {
    /// Producer asks for every cache tile covering one production tile's
    /// sample footprint (spec §4.7 "sample_those_cache_files_to_an_array").
    SampleTheseCacheFiles {
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        cache_fps: Vec<Footprint>,
    },
    /// CacheSupervisor broadcasts a tile's readiness (check succeeded, or a
    /// fresh write just completed).
    TileBecameReady {
        cache_key: (i64, i64),
        source: CacheSource,
    },
    /// Reader reports a completed disk read.
    TileRead {
        cache_key: (i64, i64),
        result: Result<Array, CacheError>,
    },
}

pub struct CacheExtractor {
    raster_uid: u64,
    ready: HashMap<(i64, i64), CacheSource>,
    waiting_for_ready: HashMap<(i64, i64), Vec<Waiter>>,
    waiting_for_read: HashMap<(i64, i64), Vec<Waiter>>,
}

impl CacheExtractor {
    pub fn new(raster_uid: u64) -> Self {
        Self {
            raster_uid,
            ready: HashMap::new(),
            waiting_for_ready: HashMap::new(),
            waiting_for_read: HashMap::new(),
        }
    }

    pub fn handle(&mut self, msg: CacheExtractorMsg, descriptor: &RasterDescriptor) -> Vec<Envelope> {
        match msg {
            CacheExtractorMsg::SampleTheseCacheFiles { qi, prod_idx, cache_fps } => {
                let mut out = Vec::new();
                for fp in cache_fps {
                    let key = fp.tiebreak_key();
                    match self.ready.get(&key).cloned() {
                        Some(source) => out.extend(self.start_read(qi.clone(), prod_idx, fp, source, descriptor)),
                        None => self
                            .waiting_for_ready
                            .entry(key)
                            .or_default()
                            .push((qi.clone(), prod_idx, fp)),
                    }
                }
                out
            }
            CacheExtractorMsg::TileBecameReady { cache_key, source } => {
                self.ready.insert(cache_key, source.clone());
                let waiters = self.waiting_for_ready.remove(&cache_key).unwrap_or_default();
                let mut out = Vec::new();
                for (qi, prod_idx, fp) in waiters {
                    out.extend(self.start_read(qi, prod_idx, fp, source.clone(), descriptor));
                }
                out
            }
            CacheExtractorMsg::TileRead { cache_key, result } => self.finish_read(cache_key, result),
        }
    }

    fn start_read(
        &mut self,
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        fp: Footprint,
        source: CacheSource,
        descriptor: &RasterDescriptor,
    ) -> Vec<Envelope> {
        match source {
            CacheSource::Memory(array) => vec![self.sampled_envelope(qi, prod_idx, fp, Ok(array))],
            CacheSource::Disk(path) => {
                let key = fp.tiebreak_key();
                self.waiting_for_read.entry(key).or_default().push((qi, prod_idx, fp));
                vec![Envelope::basic(
                    Address::Raster(self.raster_uid),
                    Payload::Raster(RasterMsg::Reader(ReaderMsg::ReadTile {
                        cache_key: key,
                        path,
                        cache_fp: fp,
                        dtype: descriptor.dtype,
                        channel_count: descriptor.channel_count,
                    })),
                )]
            }
        }
    }

    /// A read result can have more than one waiter (two production tiles
    /// needing the same cache tile concurrently); `CacheError` doesn't
    /// implement `Clone` so each waiter gets its own re-wrapped copy of the
    /// failure message rather than sharing the original.
    fn finish_read(&mut self, cache_key: (i64, i64), result: Result<Array, CacheError>) -> Vec<Envelope> {
        let waiters = self.waiting_for_read.remove(&cache_key).unwrap_or_default();
        let shared: Result<Array, String> = result.map_err(|e| e.to_string());
        waiters
            .into_iter()
            .map(|(qi, prod_idx, cache_fp)| {
                let result = shared.clone().map_err(|msg| CacheError::Io {
                    path: PathBuf::new(),
                    source: std::io::Error::other(msg),
                });
                self.sampled_envelope(qi, prod_idx, cache_fp, result)
            })
            .collect()
    }

    fn sampled_envelope(
        &self,
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        cache_fp: Footprint,
        result: Result<Array, CacheError>,
    ) -> Envelope {
        Envelope::basic(
            Address::Raster(self.raster_uid),
            Payload::Raster(RasterMsg::Producer(ProducerMsg::SampledTileReady {
                qi,
                prod_idx,
                cache_fp,
                result,
            })),
        )
    }

    /// Drops any pending interest belonging to a cancelled query (spec §4.5
    /// "Cancellation"). In-flight reader jobs are left to finish; their
    /// results simply find no waiter left when they land.
    pub fn cancel(&mut self, qi: QueryId) -> Vec<Envelope> {
        for v in self.waiting_for_ready.values_mut() {
            v.retain(|(q, _, _)| q.id != qi);
        }
        for v in self.waiting_for_read.values_mut() {
            v.retain(|(q, _, _)| q.id != qi);
        }
        Vec::new()
    }
}
