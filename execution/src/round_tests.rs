//! End-to-end round scenarios against the in-process fakes.

#[cfg(test)]
mod tests {
    use crate::error::{EngineError, ServiceError};
    use crate::mocks::{create_round_config, fixture_rules, MockWorld};
    use crate::store::RoundStore;
    use drawsettle_types::{
        idempotency_key, EventKind, FailureKind, ItemStatus, NumberRules, PrizeMode, RoundStatus,
        VerificationStatus,
    };

    const ROUND: u64 = 1;

    fn rules() -> NumberRules {
        fixture_rules()
    }

    /// Four tickets, two of them matching the draw exactly.
    fn two_winner_world() -> MockWorld {
        let world = MockWorld::new();
        let draw = world.draw_for(ROUND, &rules());
        let losing = world.losing_numbers(ROUND, &rules());
        world.sell(ROUND, "t-a", "alice", draw);
        world.sell(ROUND, "t-b", "bob", losing);
        world.sell(ROUND, "t-c", "carol", draw);
        world.sell(ROUND, "t-d", "dave", losing);
        world
    }

    #[tokio::test]
    async fn test_round_settles_end_to_end() {
        let world = two_winner_world();
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        engine.close_round(ROUND).unwrap();

        // Sold after close: must not take part.
        let draw = world.draw_for(ROUND, &rules());
        world.sell(ROUND, "t-late", "mallory", draw);

        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Settled);
        assert!(round.failure.is_none());

        let plan = world.store.get_plan(ROUND).unwrap().unwrap();
        let amounts: Vec<(&str, u64)> = plan
            .items
            .iter()
            .map(|item| (item.ticket_id.as_str(), item.amount))
            .collect();
        assert_eq!(amounts, vec![("t-a", 500), ("t-c", 500)]);
        assert_eq!(plan.treasury_amount, 0);
        assert!(plan.is_balanced());

        assert_eq!(world.ledger.balance("alice"), 500);
        assert_eq!(world.ledger.balance("carol"), 500);
        assert_eq!(world.ledger.balance("mallory"), 0);
        assert_eq!(world.ledger.balance("pool"), -1_000);
        assert_eq!(world.ledger.applied_for(&idempotency_key(ROUND, "t-a", 6)), 1);

        let snapshot = world.store.get_snapshot(ROUND).unwrap().unwrap();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(round.snapshot_digest, Some(snapshot.digest));

        let records = world.store.get_settlements(ROUND).unwrap();
        assert!(records
            .iter()
            .all(|record| record.status == ItemStatus::Confirmed && record.tx_ref.is_some()));

        // The lease is released once the call returns.
        assert!(world.store.lease(ROUND).is_none());
    }

    #[tokio::test]
    async fn test_event_journal_is_dense_and_ordered() {
        let world = two_winner_world();
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        engine.close_round(ROUND).unwrap();
        engine.advance_round(ROUND).await.unwrap();

        let events = world.store.events(ROUND).unwrap();
        for (index, event) in events.iter().enumerate() {
            assert_eq!(event.sequence, index as u64);
        }
        assert!(matches!(events[0].kind, EventKind::Created { prize_pool: 1_000, .. }));
        let statuses: Vec<RoundStatus> = events
            .iter()
            .filter_map(|event| match event.kind {
                EventKind::StatusChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                RoundStatus::Closed,
                RoundStatus::Drawing,
                RoundStatus::Matching,
                RoundStatus::Settling,
                RoundStatus::Settled,
            ]
        );
    }

    #[tokio::test]
    async fn test_audit_export_after_settlement() {
        let world = two_winner_world();
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        engine.close_round(ROUND).unwrap();
        engine.advance_round(ROUND).await.unwrap();

        let document = engine.export_audit(ROUND).unwrap();
        assert!(document.verify());
        assert_eq!(document.round.status, RoundStatus::Settled);
        assert_eq!(document.tickets.len(), 4);
        let draw = document.draw.as_ref().unwrap();
        assert_eq!(draw.status, VerificationStatus::Verified);
        assert_eq!(draw.numbers, world.draw_for(ROUND, &rules()));
        let paid: u64 = document.tickets.iter().map(|row| row.amount).sum();
        assert_eq!(paid, 1_000);
        let bob = document
            .tickets
            .iter()
            .find(|row| row.ticket_id == "t-b")
            .unwrap();
        assert_eq!(bob.match_count, Some(0));
        assert!(bob.settlement_status.is_none());

        let json = serde_json::to_string(&document).unwrap();
        let parsed: drawsettle_types::AuditDocument = serde_json::from_str(&json).unwrap();
        assert!(parsed.verify());
    }

    #[tokio::test]
    async fn test_single_winner_goes_to_earliest_purchase() {
        let world = two_winner_world();
        let engine = world.engine("worker-a");
        let mut config = create_round_config();
        config.prize_mode = PrizeMode::SingleWinner;
        engine
            .create_round(ROUND, config, 1_000, world.randomness.commitment(ROUND))
            .unwrap();
        engine.close_round(ROUND).unwrap();

        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Settled);
        let plan = world.store.get_plan(ROUND).unwrap().unwrap();
        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].ticket_id, "t-a");
        assert_eq!(plan.items[0].amount, 1_000);
        assert_eq!(world.ledger.balance("carol"), 0);
    }

    #[tokio::test]
    async fn test_round_without_winners_settles_to_treasury() {
        let world = MockWorld::new();
        let losing = world.losing_numbers(ROUND, &rules());
        world.sell(ROUND, "t-a", "alice", losing);
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        engine.close_round(ROUND).unwrap();

        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Settled);
        let plan = world.store.get_plan(ROUND).unwrap().unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.treasury_amount, 1_000);
        assert_eq!(world.ledger.applied_count(), 0);
    }

    #[tokio::test]
    async fn test_unverifiable_draw_fails_round_without_payouts() {
        let world = two_winner_world();
        world.randomness.tamper_proof();
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        engine.close_round(ROUND).unwrap();

        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Failed);
        let failure = round.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::RandomnessUnverifiable);
        assert_eq!(failure.stage, RoundStatus::Drawing);
        let draw = world.store.get_draw(ROUND).unwrap().unwrap();
        assert_eq!(draw.status, VerificationStatus::Unverifiable);
        assert!(world.store.get_plan(ROUND).unwrap().is_none());
        assert_eq!(world.ledger.applied_count(), 0);

        // The recorded draw is final: resuming fails the same way without
        // asking the oracle again.
        let round = engine.resume_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Failed);
        assert_eq!(
            round.failure.map(|failure| failure.kind),
            Some(FailureKind::RandomnessUnverifiable)
        );
        assert_eq!(world.randomness.calls(), 1);
    }

    #[tokio::test]
    async fn test_tampered_numbers_fail_round() {
        let world = two_winner_world();
        world.randomness.tamper_numbers();
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        engine.close_round(ROUND).unwrap();

        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Failed);
        assert_eq!(
            round.failure.map(|failure| failure.kind),
            Some(FailureKind::RandomnessUnverifiable)
        );
        assert_eq!(world.ledger.applied_count(), 0);
    }

    #[tokio::test]
    async fn test_oracle_exhaustion_then_divergent_reread() {
        let world = two_winner_world();
        world
            .randomness
            .fail_next(3, ServiceError::Unavailable("oracle down".to_string()));
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        engine.close_round(ROUND).unwrap();

        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Failed);
        let failure = round.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::TransientExhausted);
        assert_eq!(failure.stage, RoundStatus::Drawing);
        assert!(world.store.get_draw(ROUND).unwrap().is_none());

        // Upstream rewrites a ticket while the round sits in Failed.
        let draw = world.draw_for(ROUND, &rules());
        world.tickets.rewrite_numbers("t-b", draw);

        let round = engine.resume_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Failed);
        let failure = round.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::DataIntegrity);
        assert_eq!(failure.stage, RoundStatus::Matching);
        assert!(world.store.get_plan(ROUND).unwrap().is_none());
        assert_eq!(world.ledger.applied_count(), 0);

        let events = world.store.events(ROUND).unwrap();
        assert!(events
            .iter()
            .any(|event| matches!(event.kind, EventKind::RoundResumed { stage: RoundStatus::Drawing })));
    }

    #[tokio::test]
    async fn test_resume_after_oracle_recovers() {
        let world = two_winner_world();
        world
            .randomness
            .fail_next(3, ServiceError::Timeout(std::time::Duration::from_secs(1)));
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        engine.close_round(ROUND).unwrap();
        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Failed);

        let round = engine.resume_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Settled);
        assert!(round.failure.is_none());
        assert_eq!(world.ledger.balance("pool"), -1_000);
    }

    #[tokio::test]
    async fn test_oracle_rejection_is_not_retried() {
        let world = two_winner_world();
        world
            .randomness
            .fail_next(1, ServiceError::Rejected("unknown round".to_string()));
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        engine.close_round(ROUND).unwrap();

        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(
            round.failure.map(|failure| failure.kind),
            Some(FailureKind::ServiceRejected)
        );
        assert_eq!(world.randomness.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_item_then_retry_settlement() {
        let world = two_winner_world();
        let key_a = idempotency_key(ROUND, "t-a", 6);
        world
            .ledger
            .fail_next(&key_a, 3, ServiceError::Unavailable("ledger busy".to_string()));
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        engine.close_round(ROUND).unwrap();

        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::PartiallySettled);
        let records = world.store.get_settlements(ROUND).unwrap();
        let statuses: Vec<(&str, ItemStatus)> = records
            .iter()
            .map(|record| (record.ticket_id.as_str(), record.status))
            .collect();
        assert_eq!(
            statuses,
            vec![("t-a", ItemStatus::Failed), ("t-c", ItemStatus::Confirmed)]
        );
        assert_eq!(world.ledger.balance("alice"), 0);

        // Advancing a partially settled round is a no-op.
        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::PartiallySettled);
        assert_eq!(world.ledger.transfer_calls(&key_a), 3);

        let round = engine.retry_settlement(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Settled);
        assert_eq!(world.ledger.transfer_calls(&key_a), 4);
        assert_eq!(world.ledger.applied_for(&key_a), 1);
        assert_eq!(world.ledger.balance("alice"), 500);
        let record = world
            .store
            .get_settlements(ROUND)
            .unwrap()
            .into_iter()
            .find(|record| record.ticket_id == "t-a")
            .unwrap();
        assert_eq!(record.idempotency_key, key_a);
        assert_eq!(record.attempts, 4);
    }

    #[tokio::test]
    async fn test_retry_settlement_requires_partial_settlement() {
        let world = two_winner_world();
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        let err = engine.retry_settlement(ROUND).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                status: RoundStatus::Open,
                ..
            }
        ));
        let err = engine.resume_round(ROUND).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(engine.get_round_status(ROUND).unwrap(), RoundStatus::Open);
    }

    #[tokio::test]
    async fn test_cancel_only_while_open() {
        let world = two_winner_world();
        let engine = world.engine("worker-a");
        let commitment = world.randomness.commitment(ROUND);
        engine
            .create_round(ROUND, create_round_config(), 1_000, commitment)
            .unwrap();
        engine
            .create_round(2, create_round_config(), 1_000, world.randomness.commitment(2))
            .unwrap();

        let round = engine.cancel_round(ROUND).unwrap();
        assert_eq!(round.status, RoundStatus::Cancelled);
        assert!(matches!(
            engine.close_round(ROUND),
            Err(EngineError::InvalidTransition { .. })
        ));
        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Cancelled);

        engine.close_round(2).unwrap();
        assert!(matches!(
            engine.cancel_round(2),
            Err(EngineError::InvalidTransition {
                status: RoundStatus::Closed,
                ..
            })
        ));
        assert_eq!(engine.get_round_status(2).unwrap(), RoundStatus::Closed);
    }

    #[tokio::test]
    async fn test_advance_open_round_is_noop() {
        let world = two_winner_world();
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Open);
        assert_eq!(world.tickets.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_round() {
        let world = MockWorld::new();
        let engine = world.engine("worker-a");
        assert!(matches!(
            engine.advance_round(9).await,
            Err(EngineError::RoundNotFound(9))
        ));
        assert!(matches!(
            engine.export_audit(9),
            Err(EngineError::RoundNotFound(9))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let world = MockWorld::new();
        let engine = world.engine("worker-a");
        let mut config = create_round_config();
        config.house_cut_bps = 20_000;
        let err = engine
            .create_round(ROUND, config, 1_000, world.randomness.commitment(ROUND))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
        assert!(world.store.get_round(ROUND).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ticket_source_outage_is_retried() {
        let world = two_winner_world();
        world
            .tickets
            .fail_next(2, ServiceError::Timeout(std::time::Duration::from_secs(1)));
        let engine = world.engine("worker-a");
        engine
            .create_round(
                ROUND,
                create_round_config(),
                1_000,
                world.randomness.commitment(ROUND),
            )
            .unwrap();
        engine.close_round(ROUND).unwrap();

        let round = engine.advance_round(ROUND).await.unwrap();
        assert_eq!(round.status, RoundStatus::Settled);
        // Two failures and a success at close, one re-read while matching.
        assert_eq!(world.tickets.calls(), 4);
    }
}
