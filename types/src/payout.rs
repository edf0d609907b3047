//! Matches and payout plans.

use crate::hash::{digest_parts, Hash32};
use crate::round::RoundId;
use serde::{Deserialize, Serialize};

const PAYOUT_KEY_DOMAIN: &[u8] = b"drawsettle/payout";

/// Outcome of comparing one ticket with the draw.
///
/// Derived from (ticket, draw, rule) and never stored as authoritative state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub ticket_id: String,
    pub match_count: u8,
    /// Prize tier, `None` when the match count has no payout.
    pub tier: Option<u8>,
}

/// One transfer the plan asks the executor to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutItem {
    pub ticket_id: String,
    pub recipient: String,
    pub tier: u8,
    pub amount: u64,
    pub idempotency_key: String,
}

/// Deterministic allocation of a round's prize pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutPlan {
    pub round_id: RoundId,
    pub prize_pool: u64,
    /// Ordered by ticket id.
    pub items: Vec<PayoutItem>,
    /// House cut, unclaimed tier shares and split remainders.
    pub treasury_amount: u64,
    pub house_cut: u64,
}

impl PayoutPlan {
    /// Sum of item amounts, `None` on overflow.
    pub fn items_total(&self) -> Option<u64> {
        self.items
            .iter()
            .try_fold(0u64, |acc, item| acc.checked_add(item.amount))
    }

    /// Items plus treasury equal the pool exactly.
    pub fn is_balanced(&self) -> bool {
        self.items_total()
            .and_then(|total| total.checked_add(self.treasury_amount))
            == Some(self.prize_pool)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Key under which a payout is submitted to the ledger.
///
/// Derived only from (round, ticket, tier) so every retry and every resumed
/// worker produces the same key.
pub fn idempotency_key(round_id: RoundId, ticket_id: &str, tier: u8) -> String {
    let digest: Hash32 = digest_parts(
        PAYOUT_KEY_DOMAIN,
        &[&round_id.to_be_bytes(), ticket_id.as_bytes(), &[tier]],
    );
    digest.to_hex()
}
