//! Merger (spec §4.11-§4.12 handoff): runs the user-supplied `merge_arrays`
//! kernel over one cache tile's full set of compute arrays, then forwards
//! the result to `CacheSupervisor` for writing.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::RasterDescriptor;
use crate::error::EngineError;
use crate::footprint::Footprint;
use crate::ids::JobId;
use crate::message::{Address, Envelope, Payload};
use crate::pool::{PoolJob, PoolMsg, PoolOutcome, WaitingClass};
use crate::query::Array;

use super::cache_supervisor::CacheSupervisorMsg;
use super::RasterMsg;

#[derive(Debug)]
pub enum MergerMsg {
    MergeThoseArrays {
        cache_fp: Footprint,
        arrays: HashMap<(i64, i64), Array>,
    },
}

pub struct Merger {
    descriptor: Arc<RasterDescriptor>,
    in_flight: HashMap<JobId, Footprint>,
    errors: Arc<Mutex<VecDeque<EngineError>>>,
}

impl Merger {
    pub fn new(descriptor: Arc<RasterDescriptor>) -> Self {
        Self {
            descriptor,
            in_flight: HashMap::new(),
            errors: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn error_sink(&self) -> Arc<Mutex<VecDeque<EngineError>>> {
        self.errors.clone()
    }

    pub fn handle(&mut self, msg: MergerMsg) -> Vec<Envelope> {
        let MergerMsg::MergeThoseArrays { cache_fp, arrays } = msg;
        let job_id = JobId::next();
        self.in_flight.insert(job_id, cache_fp);

        let merge_arrays = self.descriptor.merge_arrays.clone();
        let channel_count = self.descriptor.channel_count;
        let run = move || -> PoolOutcome {
            let result = merge_arrays(&cache_fp, &arrays).and_then(|array| {
                let expected = (cache_fp.height(), cache_fp.width(), channel_count);
                if array.shape != expected {
                    Err(EngineError::MergeChannelMismatch {
                        found: array.shape.2,
                        expected: channel_count,
                    })
                } else {
                    Ok(array)
                }
            });
            PoolOutcome::Merged(result)
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
        vec![match self.descriptor.pools.merge {
            Some(pool_id) => Envelope::basic(
                Address::Pool(pool_id),
                Payload::Pool(PoolMsg::WaitingRoom(crate::pool::WaitingRoomMsg::NewJob(job))),
            ),
            None => {
                let outcome = (job.run)();
                Envelope::basic(
                    Address::Raster(self.descriptor.uid),
                    Payload::Raster(RasterMsg::PoolJobDone(crate::pool::JobDone {
                        job_id: job.id,
                        outcome,
                    })),
                )
            }
        }]
    }

    /// Routes a completed merge to `CacheSupervisor`'s write step, or
    /// escalates a user-kernel failure to the process-wide error sink (spec
    /// §7 "User-kernel misbehavior"), same treatment as `Computer`.
    pub fn job_done(&mut self, job_id: JobId, result: Result<Array, EngineError>) -> Vec<Envelope> {
        let Some(cache_fp) = self.in_flight.remove(&job_id) else {
            return Vec::new();
        };
        match result {
            Ok(array) => vec![Envelope::basic(
                Address::Raster(self.descriptor.uid),
                Payload::Raster(RasterMsg::CacheSupervisor(CacheSupervisorMsg::WriteThisCacheTile {
                    cache_fp,
                    array,
                })),
            )],
            Err(e) => {
                self.errors.lock().push_back(e);
                Vec::new()
            }
        }
    }
}
