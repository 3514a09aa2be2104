//! Pool waiting room (spec §4.2).

use crate::message::{Address, Envelope, Payload};
use crate::priority::Priorities;

use super::{PoolId, PoolJob, PoolMsg, WaitingClass};

/// Sortable urgency key; ascending = more urgent (spec §4.2 "Urgency
/// ordering").
type UrgencyKey = (u8, i64, u8, (i64, i64));

fn urgency_key(job: &PoolJob, priorities: &Priorities) -> UrgencyKey {
    match &job.class {
        WaitingClass::MaxPriority => (0, i64::MIN, 0, (i64::MIN, i64::MIN)),
        WaitingClass::Production {
            qi,
            prod_idx,
            action_priority,
            footprint,
        } => (
            1,
            priorities.prio_of_prod_tile(*qi, *prod_idx),
            *action_priority,
            footprint.tiebreak_key(),
        ),
        WaitingClass::Cache {
            raster_uid,
            cache_fp,
            action_priority,
            footprint,
        } => (
            1,
            priorities.prio_of_cache_tile(*raster_uid, cache_fp.tiebreak_key()),
            *action_priority,
            footprint.tiebreak_key(),
        ),
    }
}

/// Messages a `WaitingRoom` receives (spec §4.2).
#[derive(Debug)]
pub enum WaitingRoomMsg {
    /// A new job is available to be scheduled.
    NewJob(PoolJob),
    /// A token came back (job finished, was cancelled, or was salvaged by
    /// the `WorkingRoom`).
    SalvageToken,
    /// The global priority watcher broadcast a new view.
    PrioritiesUpdated(Priorities),
    /// A job still sitting in the waiting room (not yet handed a token)
    /// should be dropped — used on query cancellation.
    DropPendingJob(crate::ids::JobId),
}

/// Holds pending jobs and a token budget equal to the pool's worker count
/// (spec §4.2).
pub struct WaitingRoom {
    pool_id: PoolId,
    idle_tokens: usize,
    pending: Vec<PoolJob>,
    priorities: Priorities,
}

impl WaitingRoom {
    pub fn new(pool_id: PoolId, total_tokens: usize) -> Self {
        Self {
            pool_id,
            idle_tokens: total_tokens,
            pending: Vec::new(),
            priorities: Priorities::dummy(),
        }
    }

    pub fn idle_tokens(&self) -> usize {
        self.idle_tokens
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn handle(&mut self, msg: WaitingRoomMsg) -> Vec<Envelope> {
        match msg {
            WaitingRoomMsg::NewJob(job) => self.pending.push(job),
            WaitingRoomMsg::SalvageToken => self.idle_tokens += 1,
            WaitingRoomMsg::PrioritiesUpdated(p) => self.priorities = p,
            WaitingRoomMsg::DropPendingJob(job_id) => {
                self.pending.retain(|j| j.id != job_id);
            }
        }
        self.dispatch_tokens()
    }

    /// Greedily emits at most `min(idle_tokens, pending.len())`
    /// `token_to_working_room` envelopes, each bound to the currently most
    /// urgent job (spec §4.2).
    fn dispatch_tokens(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while self.idle_tokens > 0 && !self.pending.is_empty() {
            let priorities = &self.priorities;
            let Some((best_idx, _)) = self
                .pending
                .iter()
                .enumerate()
                .map(|(i, j)| (i, urgency_key(j, priorities)))
                .min_by(|a, b| a.1.cmp(&b.1))
            else {
                break;
            };
            let job = self.pending.remove(best_idx);
            self.idle_tokens -= 1;
            out.push(Envelope::basic(
                Address::Pool(self.pool_id),
                Payload::Pool(PoolMsg::WorkingRoom(
                    super::WorkingRoomMsg::LaunchJobWithToken(job),
                )),
            ));
        }
        out
    }
}
