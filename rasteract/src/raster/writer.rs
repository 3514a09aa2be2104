//! Writer (spec §4.12): schedules the disk-write job for a freshly merged
//! cache tile. Holds no persistent per-tile state — completion is routed
//! straight to `CacheSupervisor` (see `raster::RasterActors::route_job_done`).

use std::path::PathBuf;

use crate::cache_format::{self, CacheFileHeader};
use crate::error::CacheError;
use crate::footprint::Footprint;
use crate::ids::JobId;
use crate::message::{Address, Envelope, Payload};
use crate::pool::{PoolJob, PoolMsg, PoolOutcome, WaitingClass};
use crate::query::Array;

use super::RasterMsg;

#[derive(Debug)]
pub enum WriterMsg {
    WriteThisArray {
        cache_key: (i64, i64),
        cache_fp: Footprint,
        array: Array,
        cache_dir: PathBuf,
        fname_prefix: String,
        channel_count: u32,
        dtype: crate::descriptor::DType,
    },
}

/// The final written file, as reported to `CacheSupervisor` (spec §4.12
/// "notifies CacheSupervisor with the final path").
#[derive(Debug)]
pub struct WrittenFile {
    pub cache_key: (i64, i64),
    pub path: PathBuf,
}

#[derive(Default)]
pub struct Writer;

impl Writer {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&mut self, msg: WriterMsg, raster_uid: u64, pool: Option<crate::pool::PoolId>) -> Vec<Envelope> {
        let WriterMsg::WriteThisArray {
            cache_key,
            cache_fp,
            array,
            cache_dir,
            fname_prefix,
            channel_count,
            dtype,
        } = msg;
        let job_id = JobId::next();
        let run = move || -> PoolOutcome {
            let header = CacheFileHeader {
                width: cache_fp.width(),
                height: cache_fp.height(),
                channels: channel_count,
                dtype,
            };
            let result = (|| -> Result<WrittenFile, CacheError> {
                let checksum = cache_format::checksum64(
                    &array
                        .data
                        .iter()
                        .flat_map(|v| v.to_le_bytes())
                        .collect::<Vec<u8>>(),
                );
                let name = cache_format::filename(&fname_prefix, checksum);
                let path = cache_dir.join(name);
                cache_format::write_to(&path, &header, &array.data).map_err(|source| CacheError::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(WrittenFile { cache_key, path })
            })();
            PoolOutcome::Written { cache_key, result }
        };
        let job = PoolJob {
            id: job_id,
            class: WaitingClass::MaxPriority,
            origin: Address::Raster(raster_uid),
            run: Box::new(run),
        };
        match pool {
            Some(pool_id) => vec![Envelope::basic(
                Address::Pool(pool_id),
                Payload::Pool(PoolMsg::WaitingRoom(crate::pool::WaitingRoomMsg::NewJob(job))),
            )],
            None => {
                // No pool assigned for writes: run inline on the scheduler
                // thread. Acceptable since writes are rare relative to reads.
                let outcome = (job.run)();
                vec![Envelope::basic(
                    Address::Raster(raster_uid),
                    Payload::Raster(RasterMsg::PoolJobDone(crate::pool::JobDone {
                        job_id,
                        outcome,
                    })),
                )]
            }
        }
    }
}
