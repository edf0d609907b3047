//! Common types used throughout the draw settlement engine.
//!
//! Everything here is plain data: rounds and their configuration, ticket
//! snapshots, draw results, payout plans, settlement records, the round event
//! journal and the audit document. Behavior lives in `drawsettle-execution`.
//!
//! All money amounts are `u64` values in the smallest currency unit.

pub mod audit;
pub mod draw;
pub mod event;
pub mod hash;
pub mod payout;
pub mod round;
pub mod settlement;
pub mod ticket;

pub use audit::{AuditDocument, AuditDraw, AuditRound, AuditTicketRow};
pub use draw::{DrawResult, VerificationStatus};
pub use event::{EventKind, RoundEvent};
pub use hash::{digest_parts, Hash32, HexBytes, HASH_LEN};
pub use payout::{idempotency_key, Match, PayoutItem, PayoutPlan};
pub use round::{
    FailureKind, FailureRecord, MatchingRule, NumberRules, PrizeMode, Round, RoundConfig, RoundId,
    RoundStatus, TierShare, TierTable, ValidationError, BPS_DENOMINATOR,
};
pub use settlement::{ItemStatus, SettlementRecord};
pub use ticket::{Ticket, TicketSnapshot};

/// Number of values on a ticket and in a draw.
pub const NUMBERS_PER_TICKET: usize = 6;

/// Ordered numbers chosen on a ticket or drawn for a round.
pub type Numbers = [u8; NUMBERS_PER_TICKET];
