//! Payout execution.
//!
//! Each plan item moves through `Pending -> Submitted -> Confirmed | Failed`.
//! The record is persisted as `Submitted` (with its attempt count bumped)
//! before every ledger call, so after a crash the executor knows which items
//! may already have been paid and reconciles them through
//! [`Ledger::lookup_transfer`] before resubmitting under the same key.
//!
//! Against a ledger that does not deduplicate keys, a call that ends without
//! a definite answer (timeout, dropped connection, garbled response) is only
//! retried once a complete lookup shows the transfer was not applied.
//! Otherwise the item fails with `outcome_unknown` set, and
//! `retry_settlement` reconciles it again instead of resubmitting.

use crate::backoff::{sleep_with_jitter, with_timeout, RetryPolicy};
use crate::clock::Clock;
use crate::error::{EngineError, ServiceError};
use crate::lease::LeaseGuard;
use crate::services::{Ledger, TransferReceipt, TransferRequest, TransferStatus};
use crate::store::RoundStore;
use drawsettle_types::{EventKind, ItemStatus, PayoutPlan, SettlementRecord};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the ledger says about a key whose last submission went unanswered.
#[derive(Debug)]
enum Reconciliation {
    Applied(TransferReceipt),
    NotApplied,
    Unknown(String),
}

pub struct SettlementExecutor<L> {
    ledger: L,
    retry: RetryPolicy,
    call_timeout: Duration,
    concurrency: usize,
}

impl<L: Ledger> SettlementExecutor<L> {
    pub fn new(ledger: L, retry: RetryPolicy, call_timeout: Duration, concurrency: usize) -> Self {
        Self {
            ledger,
            retry,
            call_timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Drive every non-final settlement record of `plan` to a final status.
    ///
    /// Records already `Confirmed` or `Failed` are never touched. Up to
    /// `concurrency` items are in flight at once; the lease is renewed after
    /// each item completes. Returns all records for the round.
    pub async fn execute<S: RoundStore, C: Clock>(
        &self,
        store: &S,
        clock: &C,
        lease: &LeaseGuard,
        plan: &PayoutPlan,
        pool_account: &str,
    ) -> Result<Vec<SettlementRecord>, EngineError> {
        let records = store.get_settlements(plan.round_id)?;
        for item in &plan.items {
            if !records.iter().any(|record| record.matches_item(item)) {
                return Err(EngineError::DataIntegrity(format!(
                    "payout item for ticket {} has no matching settlement record",
                    item.ticket_id
                )));
            }
        }

        let open: Vec<SettlementRecord> = records
            .into_iter()
            .filter(|record| !record.status.is_final())
            .collect();
        debug!(round_id = plan.round_id, open = open.len(), "executing settlement");

        let mut outcomes = stream::iter(open)
            .map(|record| self.settle_item(store, clock, pool_account, record))
            .buffer_unordered(self.concurrency);
        while let Some(outcome) = outcomes.next().await {
            let record = outcome?;
            debug!(ticket_id = %record.ticket_id, status = %record.status, "item settled");
            lease.renew(store, clock.now_ms())?;
        }

        Ok(store.get_settlements(plan.round_id)?)
    }

    async fn settle_item<S: RoundStore, C: Clock>(
        &self,
        store: &S,
        clock: &C,
        pool_account: &str,
        mut record: SettlementRecord,
    ) -> Result<SettlementRecord, EngineError> {
        if record.status == ItemStatus::Submitted {
            match self.reconcile(&record.idempotency_key).await {
                Reconciliation::Applied(receipt) => {
                    info!(ticket_id = %record.ticket_id, "reconciled in-flight transfer");
                    return self.confirm(store, clock, record, receipt);
                }
                Reconciliation::NotApplied => {}
                Reconciliation::Unknown(reason) if !self.ledger.deduplicates_keys() => {
                    return self.fail_in_doubt(store, clock, record, reason);
                }
                Reconciliation::Unknown(reason) => {
                    warn!(ticket_id = %record.ticket_id, %reason, "transfer outcome unknown, resubmitting under the same key");
                }
            }
        }

        let request = TransferRequest {
            idempotency_key: record.idempotency_key.clone(),
            from: pool_account.to_string(),
            to: record.recipient.clone(),
            amount: record.amount,
        };
        let mut backoff = self.retry.initial_backoff;
        let mut session_attempts = 0;
        loop {
            session_attempts += 1;
            record.status = ItemStatus::Submitted;
            record.attempts += 1;
            record.updated_at_ms = clock.now_ms();
            store.put_settlement(&record)?;
            store.append_event(
                record.round_id,
                record.updated_at_ms,
                EventKind::ItemSubmitted {
                    ticket_id: record.ticket_id.clone(),
                    attempt: record.attempts,
                },
            )?;

            let err = match with_timeout(self.call_timeout, self.ledger.transfer(&request)).await {
                Ok(receipt) if receipt.status.is_final() => {
                    return self.confirm(store, clock, record, receipt)
                }
                Ok(receipt) => return self.await_final(store, clock, record, receipt).await,
                Err(err) => err,
            };

            if err.is_ambiguous() && !self.ledger.deduplicates_keys() {
                match self.reconcile(&request.idempotency_key).await {
                    Reconciliation::Applied(receipt) => {
                        info!(ticket_id = %record.ticket_id, error = %err, "unanswered transfer was applied");
                        return self.confirm(store, clock, record, receipt);
                    }
                    Reconciliation::NotApplied => {}
                    Reconciliation::Unknown(reason) => {
                        return self.fail_in_doubt(store, clock, record, format!("{err}; {reason}"));
                    }
                }
            }

            if err.is_transient() && session_attempts < self.retry.attempts() {
                warn!(
                    ticket_id = %record.ticket_id,
                    attempts = record.attempts,
                    error = %err,
                    "transfer failed, retrying"
                );
                record.last_error = Some(err.to_string());
                record.updated_at_ms = clock.now_ms();
                store.put_settlement(&record)?;
                sleep_with_jitter(backoff).await;
                backoff = self.retry.next_backoff(backoff);
                continue;
            }
            return self.fail(store, clock, record, err);
        }
    }

    /// Ask the ledger about `key`, retrying transient lookup failures and
    /// polling while the transfer is still pending.
    async fn reconcile(&self, key: &str) -> Reconciliation {
        let attempts = self.retry.attempts();
        let mut backoff = self.retry.initial_backoff;
        let mut last = String::new();
        for attempt in 1..=attempts {
            match with_timeout(self.call_timeout, self.ledger.lookup_transfer(key)).await {
                Ok(Some(receipt)) if receipt.status.is_final() => {
                    return Reconciliation::Applied(receipt)
                }
                Ok(Some(receipt)) => last = format!("transfer {} still pending", receipt.tx_ref),
                Ok(None) if self.ledger.lookup_is_complete() => return Reconciliation::NotApplied,
                Ok(None) => {
                    return Reconciliation::Unknown(
                        "ledger cannot rule out an earlier transfer".to_string(),
                    )
                }
                Err(err) if err.is_transient() => last = format!("transfer lookup failed: {err}"),
                Err(err) => return Reconciliation::Unknown(format!("transfer lookup failed: {err}")),
            }
            if attempt < attempts {
                sleep_with_jitter(backoff).await;
                backoff = self.retry.next_backoff(backoff);
            }
        }
        Reconciliation::Unknown(last)
    }

    /// The ledger accepted the transfer without settling it.
    async fn await_final<S: RoundStore, C: Clock>(
        &self,
        store: &S,
        clock: &C,
        mut record: SettlementRecord,
        receipt: TransferReceipt,
    ) -> Result<SettlementRecord, EngineError> {
        debug!(ticket_id = %record.ticket_id, tx_ref = %receipt.tx_ref, "transfer pending");
        record.tx_ref = Some(receipt.tx_ref);
        record.updated_at_ms = clock.now_ms();
        store.put_settlement(&record)?;
        match self.reconcile(&record.idempotency_key).await {
            Reconciliation::Applied(receipt) => self.confirm(store, clock, record, receipt),
            Reconciliation::NotApplied => self.fail_in_doubt(
                store,
                clock,
                record,
                "accepted transfer is no longer known to the ledger".to_string(),
            ),
            Reconciliation::Unknown(reason) => self.fail_in_doubt(store, clock, record, reason),
        }
    }

    fn confirm<S: RoundStore, C: Clock>(
        &self,
        store: &S,
        clock: &C,
        mut record: SettlementRecord,
        receipt: TransferReceipt,
    ) -> Result<SettlementRecord, EngineError> {
        record.status = ItemStatus::Confirmed;
        record.tx_ref = Some(receipt.tx_ref.clone());
        record.last_error = None;
        record.outcome_unknown = false;
        record.updated_at_ms = clock.now_ms();
        store.put_settlement(&record)?;
        store.append_event(
            record.round_id,
            record.updated_at_ms,
            EventKind::ItemConfirmed {
                ticket_id: record.ticket_id.clone(),
                tx_ref: receipt.tx_ref,
            },
        )?;
        Ok(record)
    }

    fn fail<S: RoundStore, C: Clock>(
        &self,
        store: &S,
        clock: &C,
        mut record: SettlementRecord,
        err: ServiceError,
    ) -> Result<SettlementRecord, EngineError> {
        warn!(ticket_id = %record.ticket_id, attempts = record.attempts, error = %err, "payout item failed");
        record.outcome_unknown = false;
        self.record_failure(store, clock, record, err.to_string())
    }

    /// Fail an item that may or may not have been paid.
    fn fail_in_doubt<S: RoundStore, C: Clock>(
        &self,
        store: &S,
        clock: &C,
        mut record: SettlementRecord,
        reason: String,
    ) -> Result<SettlementRecord, EngineError> {
        warn!(ticket_id = %record.ticket_id, attempts = record.attempts, %reason, "payout outcome unknown, not resubmitting");
        record.outcome_unknown = true;
        self.record_failure(store, clock, record, format!("outcome unknown: {reason}"))
    }

    fn record_failure<S: RoundStore, C: Clock>(
        &self,
        store: &S,
        clock: &C,
        mut record: SettlementRecord,
        error: String,
    ) -> Result<SettlementRecord, EngineError> {
        record.status = ItemStatus::Failed;
        record.last_error = Some(error.clone());
        record.updated_at_ms = clock.now_ms();
        store.put_settlement(&record)?;
        store.append_event(
            record.round_id,
            record.updated_at_ms,
            EventKind::ItemFailed {
                ticket_id: record.ticket_id.clone(),
                attempts: record.attempts,
                error,
            },
        )?;
        Ok(record)
    }
}

/// Adds per-key deduplication in front of a ledger that does not honour
/// idempotency keys itself.
///
/// A key whose transfer was accepted once is answered from memory and never
/// reaches the inner ledger again. The memory lives as long as the wrapper,
/// so it covers duplicate submissions within one worker process; across
/// restarts it is seeded from confirmed records with
/// [`DedupLedger::with_confirmed`].
///
/// A transfer that failed without a definite answer is not remembered, so
/// the wrapper still reports [`Ledger::deduplicates_keys`] as `false` and the
/// executor decides whether resubmitting is safe.
pub struct DedupLedger<L> {
    inner: L,
    accepted: Mutex<HashMap<String, TransferReceipt>>,
}

impl<L: Ledger> DedupLedger<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            accepted: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the dedup memory from settlement records already confirmed.
    pub fn with_confirmed<'a>(
        inner: L,
        records: impl IntoIterator<Item = &'a SettlementRecord>,
    ) -> Self {
        let accepted = records
            .into_iter()
            .filter(|record| record.status == ItemStatus::Confirmed)
            .filter_map(|record| {
                record.tx_ref.clone().map(|tx_ref| {
                    (
                        record.idempotency_key.clone(),
                        TransferReceipt {
                            status: TransferStatus::Confirmed,
                            tx_ref,
                        },
                    )
                })
            })
            .collect();
        Self {
            inner,
            accepted: Mutex::new(accepted),
        }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    fn remember(&self, key: &str, receipt: &TransferReceipt) {
        self.accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), receipt.clone());
    }

    /// The remembered receipt, reported as a repeat when it is final.
    fn remembered(&self, key: &str) -> Option<TransferReceipt> {
        self.accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|receipt| TransferReceipt {
                status: if receipt.status.is_final() {
                    TransferStatus::AlreadyApplied
                } else {
                    TransferStatus::Pending
                },
                tx_ref: receipt.tx_ref.clone(),
            })
    }
}

impl<L: Ledger> Ledger for DedupLedger<L> {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, ServiceError> {
        if let Some(receipt) = self.remembered(&request.idempotency_key) {
            debug!(key = %request.idempotency_key, "duplicate transfer suppressed");
            return Ok(receipt);
        }
        let receipt = self.inner.transfer(request).await?;
        self.remember(&request.idempotency_key, &receipt);
        Ok(receipt)
    }

    async fn lookup_transfer(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<TransferReceipt>, ServiceError> {
        let remembered = self.remembered(idempotency_key);
        if remembered
            .as_ref()
            .is_some_and(|receipt| receipt.status.is_final())
        {
            return Ok(remembered);
        }
        match self.inner.lookup_transfer(idempotency_key).await? {
            Some(receipt) => {
                self.remember(idempotency_key, &receipt);
                Ok(Some(receipt))
            }
            None => Ok(remembered),
        }
    }

    fn deduplicates_keys(&self) -> bool {
        false
    }

    fn lookup_is_complete(&self) -> bool {
        self.inner.lookup_is_complete()
    }
}
