//! Interfaces to the systems the engine talks to.
//!
//! All three are remote in production (see the node crate's HTTP adapters)
//! and faked in tests (`mocks`). Every call may fail with a [`ServiceError`];
//! transient failures are retried by the caller, never by the implementation.

use crate::error::ServiceError;
use drawsettle_types::{Hash32, HexBytes, NumberRules, Numbers, RoundId, Ticket};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Read-only view of sold tickets.
pub trait TicketSource {
    /// Tickets sold for `round_id`. Implementations should honour `as_of_ms`;
    /// the reader drops anything purchased at or after it regardless.
    fn list_tickets(
        &self,
        round_id: RoundId,
        as_of_ms: u64,
    ) -> impl Future<Output = Result<Vec<Ticket>, ServiceError>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessRequest {
    pub round_id: RoundId,
    pub commitment: Hash32,
    pub numbers: NumberRules,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessResponse {
    pub numbers: Numbers,
    /// Pre-image of the round's commitment.
    pub proof: HexBytes,
}

/// Verifiable randomness oracle.
pub trait RandomnessService {
    fn request_random(
        &self,
        request: &RandomnessRequest,
    ) -> impl Future<Output = Result<RandomnessResponse, ServiceError>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub idempotency_key: String,
    pub from: String,
    pub to: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Confirmed,
    /// The key was seen before; `tx_ref` names the original transfer.
    AlreadyApplied,
    /// Accepted but not yet final. The payout stays unconfirmed until a
    /// lookup reports a final status.
    Pending,
}

impl TransferStatus {
    /// Whether funds have irrevocably moved.
    pub fn is_final(self) -> bool {
        matches!(self, TransferStatus::Confirmed | TransferStatus::AlreadyApplied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub status: TransferStatus,
    pub tx_ref: String,
}

/// Payment ledger.
///
/// A ledger that honours `idempotency_key` applies a transfer at most once
/// per key. For ledgers that do not, wrap them in
/// [`crate::settlement::DedupLedger`].
///
/// `transfer` returns `Ok` once the ledger has accepted the request. A
/// receipt whose status is not [final](TransferStatus::is_final) does not
/// confirm the payout; the executor polls [`Ledger::lookup_transfer`] until
/// it is.
pub trait Ledger {
    fn transfer(
        &self,
        request: &TransferRequest,
    ) -> impl Future<Output = Result<TransferReceipt, ServiceError>>;

    /// Look up a transfer by key. Used to reconcile items whose outcome was
    /// never recorded. Ledgers without lookup report `None`.
    fn lookup_transfer(
        &self,
        idempotency_key: &str,
    ) -> impl Future<Output = Result<Option<TransferReceipt>, ServiceError>> {
        let _ = idempotency_key;
        async { Ok(None) }
    }

    /// Whether a repeated `transfer` with the same key is applied at most
    /// once. When `false`, a request whose outcome is unknown is never
    /// resubmitted unless a lookup proves it was not applied.
    fn deduplicates_keys(&self) -> bool {
        true
    }

    /// Whether `lookup_transfer` returning `None` proves the key was never
    /// applied.
    fn lookup_is_complete(&self) -> bool {
        false
    }
}
