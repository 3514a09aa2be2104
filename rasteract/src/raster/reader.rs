//! Reader (spec §4.8, "Reader pipeline"): schedules and deduplicates
//! disk-read jobs on behalf of `CacheExtractor`, forwarding results back.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache_format;
use crate::descriptor::{DType, RasterDescriptor};
use crate::error::CacheError;
use crate::footprint::Footprint;
use crate::ids::JobId;
use crate::message::{Address, Envelope, Payload};
use crate::pool::{PoolJob, PoolMsg, PoolOutcome, WaitingClass};
use crate::query::Array;

use super::cache_extractor::CacheExtractorMsg;
use super::RasterMsg;

#[derive(Debug)]
pub enum ReaderMsg {
    ReadTile {
        cache_key: (i64, i64),
        path: PathBuf,
        cache_fp: Footprint,
        dtype: DType,
        channel_count: u32,
    },
}

pub struct Reader {
    descriptor: Arc<RasterDescriptor>,
    in_flight: HashMap<JobId, (i64, i64)>,
}

impl Reader {
    pub fn new(descriptor: Arc<RasterDescriptor>) -> Self {
        Self {
            descriptor,
            in_flight: HashMap::new(),
        }
    }

    pub fn handle(&mut self, msg: ReaderMsg) -> Vec<Envelope> {
        let ReaderMsg::ReadTile {
            cache_key,
            path,
            cache_fp,
            dtype,
            channel_count,
        } = msg;
        let job_id = JobId::next();
        self.in_flight.insert(job_id, cache_key);
        let run = move || -> PoolOutcome {
            let result = (|| -> Result<Array, CacheError> {
                let decoded = cache_format::read_from(&path).map_err(|e| match e {
                    cache_format::DecodeError::Io(source) => CacheError::Io {
                        path: path.clone(),
                        source,
                    },
                    _ => CacheError::MalformedFilename { path: path.clone() },
                })?;
                if decoded.header.width != cache_fp.width() || decoded.header.height != cache_fp.height() {
                    return Err(CacheError::FootprintMismatch { path: path.clone() });
                }
                if decoded.header.channels != channel_count {
                    return Err(CacheError::BandCountMismatch {
                        path: path.clone(),
                        found: decoded.header.channels,
                        expected: channel_count,
                    });
                }
                if decoded.header.dtype != dtype {
                    return Err(CacheError::DtypeMismatch {
                        path: path.clone(),
                        found: decoded.header.dtype.to_string(),
                        expected: dtype.to_string(),
                    });
                }
                Ok(Array {
                    shape: (cache_fp.height(), cache_fp.width(), channel_count),
                    data: Arc::new(decoded.data),
                })
            })();
            PoolOutcome::Sample(result)
        };
        let job = PoolJob {
            id: job_id,
            class: WaitingClass::Cache {
                raster_uid: self.descriptor.uid,
                cache_fp,
                action_priority: 0,
                footprint: cache_fp,
            },
            origin: Address::Raster(self.descriptor.uid),
            run: Box::new(run),
        };
        match self.descriptor.pools.io {
            Some(pool_id) => vec![Envelope::basic(
                Address::Pool(pool_id),
                Payload::Pool(PoolMsg::WaitingRoom(crate::pool::WaitingRoomMsg::NewJob(job))),
            )],
            None => {
                let outcome = (job.run)();
                vec![Envelope::basic(
                    Address::Raster(self.descriptor.uid),
                    Payload::Raster(RasterMsg::PoolJobDone(crate::pool::JobDone { job_id, outcome })),
                )]
            }
        }
    }

    /// Routes a completed read back to `CacheExtractor` (spec §4.8).
    pub fn job_done(&mut self, job_id: JobId, result: Result<Array, CacheError>) -> Vec<Envelope> {
        let Some(cache_key) = self.in_flight.remove(&job_id) else {
            return Vec::new();
        };
        vec![Envelope::basic(
            Address::Raster(self.descriptor.uid),
            Payload::Raster(RasterMsg::CacheExtractor(CacheExtractorMsg::TileRead {
                cache_key,
                result,
            })),
        )]
    }
}
