//! Per-item settlement records: the payout audit trail.

use crate::payout::PayoutItem;
use crate::round::RoundId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    /// A transfer may be in flight; reconcile before resubmitting.
    Submitted,
    Confirmed,
    Failed,
}

impl ItemStatus {
    pub fn is_final(self) -> bool {
        matches!(self, ItemStatus::Confirmed | ItemStatus::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Submitted => "submitted",
            ItemStatus::Confirmed => "confirmed",
            ItemStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Execution state of one payout item. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub round_id: RoundId,
    pub ticket_id: String,
    pub recipient: String,
    pub tier: u8,
    pub amount: u64,
    pub idempotency_key: String,
    pub status: ItemStatus,
    #[serde(default)]
    pub tx_ref: Option<String>,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// The last submission may or may not have been applied. Such an item is
    /// only ever resubmitted after a ledger lookup says it was not.
    #[serde(default)]
    pub outcome_unknown: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl SettlementRecord {
    pub fn pending(round_id: RoundId, item: &PayoutItem, now_ms: u64) -> Self {
        Self {
            round_id,
            ticket_id: item.ticket_id.clone(),
            recipient: item.recipient.clone(),
            tier: item.tier,
            amount: item.amount,
            idempotency_key: item.idempotency_key.clone(),
            status: ItemStatus::Pending,
            tx_ref: None,
            attempts: 0,
            last_error: None,
            outcome_unknown: false,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// Whether this record describes exactly the given plan item.
    pub fn matches_item(&self, item: &PayoutItem) -> bool {
        self.ticket_id == item.ticket_id
            && self.recipient == item.recipient
            && self.tier == item.tier
            && self.amount == item.amount
            && self.idempotency_key == item.idempotency_key
    }
}
