//! The global lease index: every outstanding delivery's ackId and deadline.

use std::time::Instant;

use tokio::task::JoinHandle;

use crate::time::PreciseDate;

/// A live lease: the right to process a pulled message until `deadline`.
pub struct ActiveLease {
    pub subscription: String,
    pub message_id: String,
    pub ordering_key: Option<String>,
    pub deadline: PreciseDate,
    pub created_at: Instant,
    /// The task that fires `MessageQueue::expire_lease` at `deadline`;
    /// aborted on ack/nack/modAck/unregister.
    pub timer: JoinHandle<()>,
}

/// An entry in the global lease index.
///
/// `Revoked` is a tombstone left behind by `unregister_subscription`: the
/// timer is already aborted and the subscription's queues are gone, but the
/// ackId is kept around so a late `ack`/`nack`/`modify_ack_deadline` call
/// distinguishes "this ackId never existed" (INVALID_ARGUMENT) from "it
/// existed, but its subscription was torn down underneath it"
/// (FAILED_PRECONDITION). The orphan-lease GC pass reclaims these once they
/// age past the orphan GC threshold.
pub enum LeaseEntry {
    Active(ActiveLease),
    Revoked { created_at: Instant },
}

impl LeaseEntry {
    pub fn created_at(&self) -> Instant {
        match self {
            LeaseEntry::Active(lease) => lease.created_at,
            LeaseEntry::Revoked { created_at } => *created_at,
        }
    }
}
