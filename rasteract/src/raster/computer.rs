//! Computer (spec §4.10): runs the user-supplied `compute_array` kernel for
//! one compute footprint, pulling one array per primitive from the queues
//! `ComputationGate2` already waited on.

use std::collections::HashMap;
use std::collections::HashSet;
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

use super::accumulator::AccumulatorMsg;
use super::RasterMsg;

#[derive(Debug)]
pub enum ComputerMsg {
    ComputeThisArray {
        cache_fp: Footprint,
        compute_fp: Footprint,
        primitive_arrays: Vec<Array>,
    },
}

pub struct Computer {
    descriptor: Arc<RasterDescriptor>,
    in_flight: HashMap<JobId, (Footprint, Footprint)>,
    /// Compute footprints already dispatched and not yet completed (spec
    /// §4.10 "Dedup"). Redundant with `CacheSupervisor`'s at-most-one
    /// guarantee at the cache-tile level, but kept here too since the spec
    /// names it as this actor's own safeguard (spec §9 Open Question).
    dispatched: HashSet<(i64, i64)>,
    errors: Arc<Mutex<VecDeque<EngineError>>>,
}

impl Computer {
    pub fn new(descriptor: Arc<RasterDescriptor>) -> Self {
        Self {
            descriptor,
            in_flight: HashMap::new(),
            dispatched: HashSet::new(),
            errors: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn error_sink(&self) -> Arc<Mutex<VecDeque<EngineError>>> {
        self.errors.clone()
    }

    pub fn handle(&mut self, msg: ComputerMsg) -> Vec<Envelope> {
        let ComputerMsg::ComputeThisArray {
            cache_fp,
            compute_fp,
            primitive_arrays,
        } = msg;
        if !self.dispatched.insert(compute_fp.tiebreak_key()) {
            return Vec::new();
        }
        let job_id = JobId::next();
        self.in_flight.insert(job_id, (cache_fp, compute_fp));

        let compute_array = self.descriptor.compute_array.clone();
        let channel_count = self.descriptor.channel_count;
        let primitive_fps = vec![compute_fp; primitive_arrays.len()];
        let run = move || -> PoolOutcome {
            let result = compute_array(&compute_fp, &primitive_fps, &primitive_arrays).and_then(|array| {
                let expected = (compute_fp.height(), compute_fp.width(), channel_count);
                if array.shape != expected {
                    Err(EngineError::ComputeShapeMismatch {
                        compute_fp: format!("{:?}", compute_fp.tiebreak_key()),
                        found: array.shape,
                        expected,
                    })
                } else {
                    Ok(array)
                }
            });
            PoolOutcome::Computed(result)
        };
        let job = PoolJob {
            id: job_id,
            class: WaitingClass::Cache {
                raster_uid: self.descriptor.uid,
                cache_fp,
                action_priority: 0,
                footprint: compute_fp,
            },
            origin: Address::Raster(self.descriptor.uid),
            run: Box::new(run),
        };
        vec![match self.descriptor.pools.compute {
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

    /// Routes a completed compute to the accumulator, or escalates a
    /// user-kernel failure to the process-wide error sink (spec §7
    /// "User-kernel misbehavior").
    pub fn job_done(
        &mut self,
        job_id: JobId,
        result: Result<Array, EngineError>,
        _descriptor: &RasterDescriptor,
    ) -> Vec<Envelope> {
        let Some((cache_fp, compute_fp)) = self.in_flight.remove(&job_id) else {
            return Vec::new();
        };
        self.dispatched.remove(&compute_fp.tiebreak_key());
        match result {
            Ok(array) => vec![Envelope::basic(
                Address::Raster(self.descriptor.uid),
                Payload::Raster(RasterMsg::Accumulator(AccumulatorMsg::ArrayReady {
                    cache_fp,
                    compute_fp,
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
