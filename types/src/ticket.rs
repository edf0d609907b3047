//! Tickets and point-in-time ticket snapshots.

use crate::hash::{digest_parts, Hash32};
use crate::round::RoundId;
use crate::Numbers;
use serde::{Deserialize, Serialize};

const SNAPSHOT_DOMAIN: &[u8] = b"drawsettle/ticket-snapshot";

/// A sold ticket as reported by the ticket source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub owner: String,
    pub numbers: Numbers,
    pub round_id: RoundId,
    pub purchased_at_ms: u64,
}

/// Tickets valid for a round, normalized by ticket id and digested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketSnapshot {
    pub round_id: RoundId,
    pub as_of_ms: u64,
    pub tickets: Vec<Ticket>,
    pub digest: Hash32,
}

impl TicketSnapshot {
    pub fn new(round_id: RoundId, as_of_ms: u64, mut tickets: Vec<Ticket>) -> Self {
        tickets.sort_by(|a, b| a.id.cmp(&b.id));
        let digest = Self::compute_digest(round_id, as_of_ms, &tickets);
        Self {
            round_id,
            as_of_ms,
            tickets,
            digest,
        }
    }

    fn compute_digest(round_id: RoundId, as_of_ms: u64, tickets: &[Ticket]) -> Hash32 {
        let encoded = serde_json::to_vec(tickets).unwrap_or_default();
        digest_parts(
            SNAPSHOT_DOMAIN,
            &[&round_id.to_be_bytes(), &as_of_ms.to_be_bytes(), &encoded],
        )
    }

    /// Recompute the digest over the stored tickets.
    pub fn is_intact(&self) -> bool {
        Self::compute_digest(self.round_id, self.as_of_ms, &self.tickets) == self.digest
    }

    pub fn get(&self, ticket_id: &str) -> Option<&Ticket> {
        self.tickets
            .binary_search_by(|ticket| ticket.id.as_str().cmp(ticket_id))
            .ok()
            .map(|index| &self.tickets[index])
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}
