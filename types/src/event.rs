//! Append-only round journal.

use crate::draw::VerificationStatus;
use crate::hash::Hash32;
use crate::round::{FailureKind, RoundId, RoundStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Created {
        prize_pool: u64,
        config_digest: Hash32,
        commitment: Hash32,
    },
    Closed {
        closed_at_ms: u64,
    },
    Cancelled,
    SnapshotTaken {
        tickets: usize,
        digest: Hash32,
    },
    StatusChanged {
        from: RoundStatus,
        to: RoundStatus,
    },
    DrawRecorded {
        numbers: crate::Numbers,
        status: VerificationStatus,
    },
    PlanAccepted {
        items: usize,
        items_total: u64,
        treasury_amount: u64,
    },
    ItemSubmitted {
        ticket_id: String,
        attempt: u32,
    },
    ItemConfirmed {
        ticket_id: String,
        tx_ref: String,
    },
    ItemFailed {
        ticket_id: String,
        attempts: u32,
        error: String,
    },
    SettlementRetried {
        reset_items: usize,
    },
    RoundResumed {
        stage: RoundStatus,
    },
    Failed {
        kind: FailureKind,
        stage: RoundStatus,
        message: String,
    },
}

/// One journal entry. `sequence` is assigned by the store and is dense per
/// round, starting at zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundEvent {
    pub round_id: RoundId,
    pub sequence: u64,
    pub at_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}
