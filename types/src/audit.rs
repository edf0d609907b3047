//! Public audit document for a settled (or stopped) round.
//!
//! The document repeats every input a third party needs to re-run matching
//! and payout planning: the ticket numbers, the drawn numbers, the proof and
//! the commitment it opens. `digest` covers the serialized body so any copy
//! can be checked for alteration.

use crate::draw::VerificationStatus;
use crate::event::RoundEvent;
use crate::hash::{digest_parts, Hash32, HexBytes};
use crate::round::{FailureRecord, MatchingRule, PrizeMode, RoundId, RoundStatus, TierTable};
use crate::settlement::ItemStatus;
use crate::Numbers;
use serde::{Deserialize, Serialize};

const AUDIT_DOMAIN: &[u8] = b"drawsettle/audit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRound {
    pub id: RoundId,
    pub status: RoundStatus,
    pub prize_pool: u64,
    pub house_cut_bps: u32,
    pub matching_rule: MatchingRule,
    pub prize_mode: PrizeMode,
    pub tiers: TierTable,
    pub config_digest: Hash32,
    pub opened_at_ms: u64,
    pub closed_at_ms: Option<u64>,
    pub snapshot_digest: Option<Hash32>,
    pub failure: Option<FailureRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDraw {
    pub numbers: Numbers,
    pub proof: HexBytes,
    pub commitment: Hash32,
    pub status: VerificationStatus,
    pub recorded_at_ms: u64,
}

/// One line per ticket in the snapshot, winners and losers alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTicketRow {
    pub ticket_id: String,
    pub owner: String,
    pub numbers: Numbers,
    pub purchased_at_ms: u64,
    pub match_count: Option<u8>,
    pub tier: Option<u8>,
    pub amount: u64,
    pub idempotency_key: Option<String>,
    pub settlement_status: Option<ItemStatus>,
    pub tx_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDocument {
    pub round: AuditRound,
    pub draw: Option<AuditDraw>,
    pub tickets: Vec<AuditTicketRow>,
    pub treasury_amount: Option<u64>,
    pub events: Vec<RoundEvent>,
    pub exported_at_ms: u64,
    /// SHA-256 over the body with this field empty.
    pub digest: Hash32,
}

impl AuditDocument {
    /// Compute the body digest (ignores the current `digest` value).
    pub fn compute_digest(&self) -> Hash32 {
        let mut body = self.clone();
        body.digest = Hash32::default();
        let encoded = serde_json::to_vec(&body).unwrap_or_default();
        digest_parts(AUDIT_DOMAIN, &[&encoded])
    }

    /// Fill in `digest` for the current body.
    pub fn seal(mut self) -> Self {
        self.digest = self.compute_digest();
        self
    }

    pub fn verify(&self) -> bool {
        self.compute_digest() == self.digest
    }
}
