//! Round lifecycle state machine.
//!
//! ```text
//! Open ──close──▶ Closed ──snapshot──▶ Drawing ──draw──▶ Matching ──plan──▶ Settling
//!   │                │                    │                  │                 │
//!   └─cancel─▶ Cancelled                  └───── any fatal error ─────▶ Failed  ├─▶ Settled
//!                                                                               └─▶ PartiallySettled
//! ```
//!
//! The persisted status always names the stage that runs next. Each stage
//! commits its output to the store before the status moves, so
//! [`RoundEngine::advance_round`] after a crash simply re-runs the stage the
//! status names; every stage is safe to repeat.
//!
//! Operator transitions sit outside the automatic path:
//! - `retry_settlement`: `PartiallySettled -> Settling`, failed items reset
//!   to `Pending` under their original idempotency keys. Items whose outcome
//!   is unknown go back to `Submitted` so they are reconciled first.
//! - `resume_round`: `Failed -> <failed stage>` once the cause is fixed.
//!
//! While a stage runs, a heartbeat renews the round lease every
//! `lease_renew_interval`, so a slow snapshot, oracle call or ledger call
//! cannot outlive the lease. A failed renewal abandons the stage.

use crate::audit::build_audit;
use crate::backoff::RetryPolicy;
use crate::clock::Clock;
use crate::error::EngineError;
use crate::lease::LeaseGuard;
use crate::match_engine::compute_matches;
use crate::oracle::{verify_recorded_draw, OracleClient};
use crate::payout_planner;
use crate::services::{Ledger, RandomnessService, TicketSource};
use crate::settlement::SettlementExecutor;
use crate::store::RoundStore;
use crate::ticket_reader::TicketReader;
use drawsettle_types::{
    AuditDocument, EventKind, FailureKind, FailureRecord, Hash32, ItemStatus, Round,
    RoundConfig, RoundId, RoundStatus, SettlementRecord,
};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Identity written into round leases.
    pub holder_id: String,
    pub lease_ttl: Duration,
    /// Heartbeat period while a stage runs; keep well under `lease_ttl`.
    pub lease_renew_interval: Duration,
    /// Upper bound on any single external call.
    pub call_timeout: Duration,
    pub ticket_retry: RetryPolicy,
    pub oracle_retry: RetryPolicy,
    pub settlement_retry: RetryPolicy,
    /// Payout items in flight at once.
    pub settlement_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            holder_id: "drawsettle".to_string(),
            lease_ttl: Duration::from_secs(60),
            lease_renew_interval: Duration::from_secs(20),
            call_timeout: Duration::from_secs(10),
            ticket_retry: RetryPolicy::default(),
            oracle_retry: RetryPolicy::default(),
            settlement_retry: RetryPolicy::default(),
            settlement_concurrency: 4,
        }
    }
}

/// Result of running one stage: the (possibly updated) round and the status
/// to move to.
type StageOutcome = Result<(Round, RoundStatus), EngineError>;

pub struct RoundEngine<S, T, R, L, C> {
    holder_id: String,
    lease_ttl_ms: u64,
    lease_renew_interval: Duration,
    store: S,
    tickets: TicketReader<T>,
    oracle: OracleClient<R>,
    executor: SettlementExecutor<L>,
    clock: C,
}

impl<S, T, R, L, C> RoundEngine<S, T, R, L, C>
where
    S: RoundStore,
    T: TicketSource,
    R: RandomnessService,
    L: Ledger,
    C: Clock,
{
    pub fn new(
        config: EngineConfig,
        store: S,
        source: T,
        randomness: R,
        ledger: L,
        clock: C,
    ) -> Self {
        Self {
            holder_id: config.holder_id,
            lease_ttl_ms: config.lease_ttl.as_millis() as u64,
            lease_renew_interval: config.lease_renew_interval.max(Duration::from_millis(1)),
            store,
            tickets: TicketReader::new(source, config.ticket_retry, config.call_timeout),
            oracle: OracleClient::new(randomness, config.oracle_retry, config.call_timeout),
            executor: SettlementExecutor::new(
                ledger,
                config.settlement_retry,
                config.call_timeout,
                config.settlement_concurrency,
            ),
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ledger(&self) -> &L {
        self.executor.ledger()
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Register a new round in `Open`.
    pub fn create_round(
        &self,
        round_id: RoundId,
        config: RoundConfig,
        prize_pool: u64,
        commitment: Hash32,
    ) -> Result<Round, EngineError> {
        let now = self.clock.now_ms();
        let round = Round::new(round_id, config, prize_pool, commitment, now)?;
        self.store.create_round(&round)?;
        self.store.append_event(
            round_id,
            now,
            EventKind::Created {
                prize_pool,
                config_digest: round.config_digest,
                commitment,
            },
        )?;
        info!(round_id, prize_pool, "round created");
        Ok(round)
    }

    pub fn get_round(&self, round_id: RoundId) -> Result<Round, EngineError> {
        self.store
            .get_round(round_id)?
            .ok_or(EngineError::RoundNotFound(round_id))
    }

    pub fn get_round_status(&self, round_id: RoundId) -> Result<RoundStatus, EngineError> {
        Ok(self.get_round(round_id)?.status)
    }

    /// Stop ticket sales: `Open -> Closed`, recording the close time that
    /// bounds the ticket snapshot.
    pub fn close_round(&self, round_id: RoundId) -> Result<Round, EngineError> {
        self.get_round(round_id)?;
        let lease = self.acquire(round_id)?;
        let result = self.close_locked(round_id);
        self.finish(lease, result)
    }

    fn close_locked(&self, round_id: RoundId) -> Result<Round, EngineError> {
        let mut round = self.get_round(round_id)?;
        self.ensure(&round, RoundStatus::Open, "close")?;
        let now = self.clock.now_ms();
        round.closed_at_ms = Some(now);
        self.store
            .append_event(round_id, now, EventKind::Closed { closed_at_ms: now })?;
        self.transition(round, RoundStatus::Closed)
    }

    /// `Open -> Cancelled`. No other status can be cancelled.
    pub fn cancel_round(&self, round_id: RoundId) -> Result<Round, EngineError> {
        self.get_round(round_id)?;
        let lease = self.acquire(round_id)?;
        let result = self.cancel_locked(round_id);
        self.finish(lease, result)
    }

    fn cancel_locked(&self, round_id: RoundId) -> Result<Round, EngineError> {
        let round = self.get_round(round_id)?;
        self.ensure(&round, RoundStatus::Open, "cancel")?;
        self.store
            .append_event(round_id, self.clock.now_ms(), EventKind::Cancelled)?;
        self.transition(round, RoundStatus::Cancelled)
    }

    /// Run stages until the round reaches a status with no automatic
    /// successor.
    ///
    /// A stage error with a failure classification moves the round to
    /// `Failed` and is reported through the returned round, not as `Err`.
    /// `Err` means the round was left untouched (lease held elsewhere, store
    /// failure) and calling again later is safe.
    pub async fn advance_round(&self, round_id: RoundId) -> Result<Round, EngineError> {
        self.get_round(round_id)?;
        let lease = self.acquire(round_id)?;
        let result = self.drive(&lease, round_id).await;
        self.finish(lease, result)
    }

    /// Re-attempt failed payout items of a `PartiallySettled` round.
    pub async fn retry_settlement(&self, round_id: RoundId) -> Result<Round, EngineError> {
        self.get_round(round_id)?;
        let lease = self.acquire(round_id)?;
        let result = match self.reset_failed_items(round_id) {
            Ok(()) => self.drive(&lease, round_id).await,
            Err(err) => Err(err),
        };
        self.finish(lease, result)
    }

    fn reset_failed_items(&self, round_id: RoundId) -> Result<(), EngineError> {
        let round = self.get_round(round_id)?;
        self.ensure(&round, RoundStatus::PartiallySettled, "retry settlement")?;
        let now = self.clock.now_ms();
        let mut reset_items = 0;
        for mut record in self.store.get_settlements(round_id)? {
            if record.status == ItemStatus::Failed {
                record.status = if record.outcome_unknown {
                    ItemStatus::Submitted
                } else {
                    ItemStatus::Pending
                };
                record.updated_at_ms = now;
                self.store.put_settlement(&record)?;
                reset_items += 1;
            }
        }
        self.store
            .append_event(round_id, now, EventKind::SettlementRetried { reset_items })?;
        info!(round_id, reset_items, "retrying failed payouts");
        self.set_status(round, RoundStatus::Settling)?;
        Ok(())
    }

    /// Re-enter the stage a `Failed` round stopped in.
    pub async fn resume_round(&self, round_id: RoundId) -> Result<Round, EngineError> {
        self.get_round(round_id)?;
        let lease = self.acquire(round_id)?;
        let result = match self.reenter_failed_stage(round_id) {
            Ok(()) => self.drive(&lease, round_id).await,
            Err(err) => Err(err),
        };
        self.finish(lease, result)
    }

    fn reenter_failed_stage(&self, round_id: RoundId) -> Result<(), EngineError> {
        let mut round = self.get_round(round_id)?;
        self.ensure(&round, RoundStatus::Failed, "resume")?;
        let stage = match &round.failure {
            Some(failure) if failure.stage.is_in_progress() => failure.stage,
            _ => {
                return Err(EngineError::InvalidTransition {
                    round_id,
                    status: round.status,
                    action: "resume without a failed stage",
                })
            }
        };
        round.failure = None;
        self.store.append_event(
            round_id,
            self.clock.now_ms(),
            EventKind::RoundResumed { stage },
        )?;
        info!(round_id, %stage, "resuming round");
        self.set_status(round, stage)?;
        Ok(())
    }

    /// Public audit document for the round in its current state.
    pub fn export_audit(&self, round_id: RoundId) -> Result<AuditDocument, EngineError> {
        let round = self.get_round(round_id)?;
        let document = build_audit(
            &round,
            self.store.get_snapshot(round_id)?.as_ref(),
            self.store.get_draw(round_id)?.as_ref(),
            self.store.get_plan(round_id)?.as_ref(),
            &self.store.get_settlements(round_id)?,
            self.store.events(round_id)?,
            self.clock.now_ms(),
        );
        Ok(document)
    }

    fn acquire(&self, round_id: RoundId) -> Result<LeaseGuard, EngineError> {
        LeaseGuard::acquire(
            &self.store,
            round_id,
            &self.holder_id,
            self.lease_ttl_ms,
            self.clock.now_ms(),
        )
    }

    /// Release the lease, reporting the operation's error first.
    fn finish<X>(&self, lease: LeaseGuard, result: Result<X, EngineError>) -> Result<X, EngineError> {
        let released = lease.release(&self.store);
        let value = result?;
        released?;
        Ok(value)
    }

    fn ensure(
        &self,
        round: &Round,
        expected: RoundStatus,
        action: &'static str,
    ) -> Result<(), EngineError> {
        if round.status != expected {
            return Err(EngineError::InvalidTransition {
                round_id: round.id,
                status: round.status,
                action,
            });
        }
        Ok(())
    }

    fn transition(&self, round: Round, to: RoundStatus) -> Result<Round, EngineError> {
        if !round.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                round_id: round.id,
                status: round.status,
                action: to.as_str(),
            });
        }
        self.set_status(round, to)
    }

    fn set_status(&self, mut round: Round, to: RoundStatus) -> Result<Round, EngineError> {
        let from = round.status;
        let now = self.clock.now_ms();
        round.status = to;
        round.updated_at_ms = now;
        self.store.put_round(&round)?;
        self.store
            .append_event(round.id, now, EventKind::StatusChanged { from, to })?;
        info!(round_id = round.id, %from, %to, "round status changed");
        Ok(round)
    }

    async fn drive(&self, lease: &LeaseGuard, round_id: RoundId) -> Result<Round, EngineError> {
        loop {
            let round = self.get_round(round_id)?;
            let stage = round.status;
            if !stage.is_in_progress() {
                return Ok(round);
            }
            lease.renew(&self.store, self.clock.now_ms())?;

            let outcome = match stage {
                RoundStatus::Closed => self.with_heartbeat(lease, self.take_snapshot(round)).await?,
                RoundStatus::Drawing => self.with_heartbeat(lease, self.draw(round)).await?,
                RoundStatus::Matching => {
                    self.with_heartbeat(lease, self.plan_payouts(round)).await?
                }
                RoundStatus::Settling => {
                    self.with_heartbeat(lease, self.settle(lease, round)).await?
                }
                _ => return Ok(round),
            };
            match outcome {
                Ok((round, next)) => {
                    self.transition(round, next)?;
                }
                Err(err) => match err.failure_kind() {
                    Some(kind) => return self.fail_round(round_id, stage, kind, &err),
                    None => return Err(err),
                },
            }
        }
    }

    /// Run `stage` while renewing the lease on a timer. The stage future is
    /// dropped as soon as a renewal fails.
    async fn with_heartbeat<F, X>(&self, lease: &LeaseGuard, stage: F) -> Result<X, EngineError>
    where
        F: Future<Output = X>,
    {
        let mut heartbeat = tokio::time::interval(self.lease_renew_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        tokio::pin!(stage);
        loop {
            tokio::select! {
                outcome = &mut stage => return Ok(outcome),
                _ = heartbeat.tick() => {
                    if let Err(err) = lease.renew(&self.store, self.clock.now_ms()) {
                        warn!(round_id = lease.round_id(), error = %err, "lease heartbeat failed, abandoning stage");
                        return Err(err);
                    }
                }
            }
        }
    }

    fn fail_round(
        &self,
        round_id: RoundId,
        stage: RoundStatus,
        kind: FailureKind,
        err: &EngineError,
    ) -> Result<Round, EngineError> {
        error!(round_id, %stage, %kind, error = %err, "round failed");
        let mut round = self.get_round(round_id)?;
        let now = self.clock.now_ms();
        let message = err.to_string();
        round.failure = Some(FailureRecord {
            kind,
            stage,
            message: message.clone(),
            at_ms: now,
        });
        self.store.append_event(
            round_id,
            now,
            EventKind::Failed {
                kind,
                stage,
                message,
            },
        )?;
        self.transition(round, RoundStatus::Failed)
    }

    /// Closed: freeze the ticket set as of the close time.
    async fn take_snapshot(&self, mut round: Round) -> StageOutcome {
        let as_of = round.closed_at_ms.ok_or_else(|| {
            EngineError::DataIntegrity(format!("round {} is closed without a close time", round.id))
        })?;
        let snapshot = self
            .tickets
            .snapshot(round.id, as_of, &round.config.numbers)
            .await?;
        match self.store.get_snapshot(round.id)? {
            Some(existing) if existing.digest != snapshot.digest => {
                return Err(EngineError::DataIntegrity(format!(
                    "ticket set for round {} changed between reads",
                    round.id
                )));
            }
            Some(_) => {}
            None => self.store.put_snapshot(&snapshot)?,
        }
        round.snapshot_digest = Some(snapshot.digest);
        self.store.append_event(
            round.id,
            self.clock.now_ms(),
            EventKind::SnapshotTaken {
                tickets: snapshot.len(),
                digest: snapshot.digest,
            },
        )?;
        Ok((round, RoundStatus::Drawing))
    }

    /// Drawing: obtain and verify the draw.
    async fn draw(&self, round: Round) -> StageOutcome {
        let draw = self
            .oracle
            .request_draw(&self.store, &round, self.clock.now_ms())
            .await?;
        self.store.append_event(
            round.id,
            self.clock.now_ms(),
            EventKind::DrawRecorded {
                numbers: draw.numbers,
                status: draw.status,
            },
        )?;
        if !draw.is_verified() {
            let reason = verify_recorded_draw(&round, &draw)
                .err()
                .map(|err| err.to_string())
                .unwrap_or_else(|| "recorded as unverifiable".to_string());
            return Err(EngineError::RandomnessUnverifiable {
                round_id: round.id,
                reason,
            });
        }
        Ok((round, RoundStatus::Matching))
    }

    /// Matching: re-check every input, then compute and accept the plan.
    async fn plan_payouts(&self, round: Round) -> StageOutcome {
        if !round.config_intact() {
            return Err(EngineError::DataIntegrity(format!(
                "round {} config no longer matches its digest",
                round.id
            )));
        }
        let snapshot = self.store.get_snapshot(round.id)?.ok_or_else(|| {
            EngineError::DataIntegrity(format!("round {} has no ticket snapshot", round.id))
        })?;
        if !snapshot.is_intact() || round.snapshot_digest != Some(snapshot.digest) {
            return Err(EngineError::DataIntegrity(format!(
                "stored ticket snapshot for round {} was altered",
                round.id
            )));
        }
        let reread = self
            .tickets
            .snapshot(round.id, snapshot.as_of_ms, &round.config.numbers)
            .await?;
        if reread.digest != snapshot.digest {
            return Err(EngineError::DataIntegrity(format!(
                "ticket set for round {} diverged since close ({} tickets at close, {} now)",
                round.id,
                snapshot.len(),
                reread.len()
            )));
        }

        let draw = self.store.get_draw(round.id)?.ok_or_else(|| {
            EngineError::DataIntegrity(format!("round {} has no recorded draw", round.id))
        })?;
        verify_recorded_draw(&round, &draw).map_err(|err| {
            EngineError::RandomnessUnverifiable {
                round_id: round.id,
                reason: err.to_string(),
            }
        })?;

        let matches = compute_matches(&snapshot.tickets, &draw.numbers, &round.config);
        let plan = payout_planner::plan(&round, &matches, &snapshot)?;
        let accepted = self.store.accept_plan(&plan)?;
        if accepted != plan {
            return Err(EngineError::DataIntegrity(format!(
                "recomputed payout plan for round {} differs from the accepted plan",
                round.id
            )));
        }

        let now = self.clock.now_ms();
        let existing: HashMap<String, SettlementRecord> = self
            .store
            .get_settlements(round.id)?
            .into_iter()
            .map(|record| (record.ticket_id.clone(), record))
            .collect();
        for item in &accepted.items {
            match existing.get(&item.ticket_id) {
                Some(record) if record.matches_item(item) => {}
                Some(_) => {
                    return Err(EngineError::DataIntegrity(format!(
                        "settlement record for ticket {} disagrees with the plan",
                        item.ticket_id
                    )))
                }
                None => self
                    .store
                    .put_settlement(&SettlementRecord::pending(round.id, item, now))?,
            }
        }

        let items_total = accepted.items_total().ok_or_else(|| {
            EngineError::ArithmeticInvariant("payout items overflow".to_string())
        })?;
        self.store.append_event(
            round.id,
            now,
            EventKind::PlanAccepted {
                items: accepted.items.len(),
                items_total,
                treasury_amount: accepted.treasury_amount,
            },
        )?;
        info!(
            round_id = round.id,
            winners = accepted.items.len(),
            items_total,
            treasury = accepted.treasury_amount,
            "payout plan accepted"
        );
        Ok((round, RoundStatus::Settling))
    }

    /// Settling: execute the accepted plan.
    async fn settle(&self, lease: &LeaseGuard, round: Round) -> StageOutcome {
        let plan = self.store.get_plan(round.id)?.ok_or_else(|| {
            EngineError::DataIntegrity(format!("round {} has no accepted plan", round.id))
        })?;
        let records = self
            .executor
            .execute(
                &self.store,
                &self.clock,
                lease,
                &plan,
                &round.config.pool_account,
            )
            .await?;
        let failed = records
            .iter()
            .filter(|record| record.status == ItemStatus::Failed)
            .count();
        if failed > 0 {
            warn!(round_id = round.id, failed, "round settled with failed payouts");
            return Ok((round, RoundStatus::PartiallySettled));
        }
        Ok((round, RoundStatus::Settled))
    }
}
