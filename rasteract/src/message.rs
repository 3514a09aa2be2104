//! Addressing and the message envelope (spec §2, §4.1, §9).
//!
//! Design notes §9 call for replacing free-form string addresses with
//! `(GroupKind, GroupId, ActorKind)` triples and a closed sum type of
//! messages rather than dynamic dispatch. [`Address`] is that triple
//! (the actor kind is implicit in which payload variant is carried);
//! [`Payload`] is the sum type, one variant per per-raster/per-pool/global
//! actor, each wrapping that actor's own message enum.

use crate::ids::RasterUid;
use crate::pool::PoolId;
use crate::pool::{PoolMsg, PoolOutcome};
use crate::priorities_watcher::GlobalMsg;
use crate::raster::RasterMsg;

/// Destination of a [`Message`]. Spec §4.1 allows absolute, relative
/// (resolved against the sender's own group), and pool-wildcard
/// addresses; relative addressing is handled by callers constructing the
/// right `Address` variant with the sender's own raster/pool id in hand
/// rather than a separate resolution pass, which keeps every `Envelope`
/// self-contained once built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    Global,
    Raster(RasterUid),
    Pool(PoolId),
    /// `/Pool*/<Name>` — expanded by the scheduler into one envelope per
    /// currently-registered pool (spec §4.1 wildcard resolution).
    AllPools,
}

/// Delivery guarantee for a message (spec §4.1 "Message types").
#[derive(Clone, Debug)]
pub enum Delivery {
    /// Guaranteed delivery; delivery to an absent recipient is a logic
    /// error.
    Basic,
    /// Silently discarded if the recipient has been torn down.
    Droppable,
    /// Coalescable: the scheduler keeps an index from `AgingKey` to the
    /// sequence number of the most recently *created* aging message with
    /// that key; a popped aging envelope whose `seq` no longer matches the
    /// index is stale and is dropped without dispatch (spec §4.1 step 2,
    /// §8 invariant 8).
    Aging { key: AgingKey, seq: u64 },
}

/// Identifies the coalescable subject of an [`Delivery::Aging`] message:
/// the logical "recipient method" plus the arguments that make two aging
/// messages about the "same thing" (spec §4.1).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AgingKey {
    pub method: &'static str,
    pub id_args: (RasterUid, u64),
}

static NEXT_AGING_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Allocates the next aging sequence number. Exposed so `Envelope::aging`
/// and tests can both mint sequence numbers consistently.
pub fn next_aging_seq() -> u64 {
    NEXT_AGING_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// The payload of every message in the system, grouped by destination
/// group (spec §2 "Global", "Raster<uid>", "Pool<pool_id>").
#[derive(Debug)]
pub enum Payload {
    Global(GlobalMsg),
    Raster(RasterMsg),
    Pool(PoolMsg),
}

/// One message in flight. Produced by actor method calls, consumed by the
/// scheduler's dispatch loop (spec §4.1).
#[derive(Debug)]
pub struct Envelope {
    pub to: Address,
    pub delivery: Delivery,
    pub payload: Payload,
}

impl Envelope {
    pub fn basic(to: Address, payload: Payload) -> Self {
        Self {
            to,
            delivery: Delivery::Basic,
            payload,
        }
    }

    pub fn droppable(to: Address, payload: Payload) -> Self {
        Self {
            to,
            delivery: Delivery::Droppable,
            payload,
        }
    }

    pub fn aging(to: Address, key: AgingKey, payload: Payload) -> Self {
        Self {
            to,
            delivery: Delivery::Aging {
                key,
                seq: next_aging_seq(),
            },
            payload,
        }
    }
}

/// Outcome of a pool job, handed back from `WorkingRoom` to the requesting
/// raster actor (see `crate::pool`). Re-exported here so `raster::*`
/// modules building response envelopes don't need to reach into `pool`.
pub type JobOutcome = PoolOutcome;
