//! Pool working room (spec §4.3).

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::ids::JobId;
use crate::message::{Address, Envelope, Payload};
use crate::raster::RasterMsg;

use super::{JobDone, PoolId, PoolJob, PoolMsg, PoolOutcome, ThreadPoolHandle, WaitingRoomMsg};

/// Messages a `WorkingRoom` receives (spec §4.3).
#[derive(Debug)]
pub enum WorkingRoomMsg {
    LaunchJobWithToken(PoolJob),
    CancelJob(JobId),
}

struct Running {
    rx: Receiver<PoolOutcome>,
    origin: Address,
}

/// Submits jobs to the underlying pool when handed a token, polls
/// completions, emits `job_done`/`salvage_token` (spec §4.3).
pub struct WorkingRoom {
    pool_id: PoolId,
    pool: Arc<ThreadPoolHandle>,
    running: HashMap<JobId, Running>,
}

impl WorkingRoom {
    pub fn new(pool_id: PoolId, pool: Arc<ThreadPoolHandle>) -> Self {
        Self {
            pool_id,
            pool,
            running: HashMap::new(),
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn handle(&mut self, msg: WorkingRoomMsg) -> Vec<Envelope> {
        match msg {
            WorkingRoomMsg::LaunchJobWithToken(job) => {
                let PoolJob {
                    id, origin, run, ..
                } = job;
                let rx = self.pool.spawn(run);
                self.running.insert(id, Running { rx, origin });
                Vec::new()
            }
            WorkingRoomMsg::CancelJob(job_id) => {
                if self.running.remove(&job_id).is_some() {
                    vec![self.salvage_envelope()]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Keep-alive tick: checks every running job for readiness, emitting
    /// `job_done` to the sender and `salvage_token` back to the waiting
    /// room for each (spec §4.3).
    pub fn ext_receive_nothing(&mut self) -> Vec<Envelope> {
        let mut done = Vec::new();
        self.running.retain(|job_id, running| {
            match running.rx.try_recv() {
                Ok(outcome) => {
                    done.push((*job_id, running.origin, outcome));
                    false
                }
                Err(crossbeam_channel::TryRecvError::Empty) => true,
                Err(crossbeam_channel::TryRecvError::Disconnected) => false,
            }
        });
        let mut out = Vec::with_capacity(done.len() * 2);
        for (job_id, origin, outcome) in done {
            out.push(Envelope::basic(
                origin,
                Payload::Raster(RasterMsg::PoolJobDone(JobDone { job_id, outcome })),
            ));
            out.push(self.salvage_envelope());
        }
        out
    }

    fn salvage_envelope(&self) -> Envelope {
        Envelope::basic(
            Address::Pool(self.pool_id),
            Payload::Pool(PoolMsg::WaitingRoom(WaitingRoomMsg::SalvageToken)),
        )
    }
}
