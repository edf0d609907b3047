//! Draw settlement engine.
//!
//! Drives a lottery round from close to payout: freezes the ticket set,
//! obtains and verifies the draw, matches tickets, plans the prize pool
//! allocation and executes payouts against an external ledger. The entry
//! point is [`RoundEngine`].
//!
//! ## Determinism requirements
//! - Matching and payout planning are pure functions of (snapshot, draw,
//!   round config). Do not read the clock or any randomness there.
//! - Outputs are ordered by ticket id; never let read order or hash-map
//!   iteration order reach a result.
//! - Amounts are integer smallest-currency units with checked arithmetic.
//!
//! ## Storage / recovery invariants
//! Every stage commits its output to the [`RoundStore`] before the round
//! status moves on, and every stage is safe to re-run. The draw and the
//! accepted plan are write-once. A payout record is persisted as `Submitted`
//! before its ledger call and the ledger is always called with the item's
//! deterministic idempotency key, so resuming after a crash never pays an
//! item twice.
//!
//! ## Minimal round (example)
//! ```rust,ignore
//! # #[cfg(feature = "mocks")]
//! # {
//! use drawsettle_execution::mocks::{create_round_config, MockLedger, MockRandomness, MockTicketSource};
//! use drawsettle_execution::{EngineConfig, InMemoryRoundStore, RoundEngine, SystemClock};
//!
//! # async fn example() -> Result<(), drawsettle_execution::EngineError> {
//! let randomness = MockRandomness::new([7; 32]);
//! let engine = RoundEngine::new(
//!     EngineConfig::default(),
//!     InMemoryRoundStore::new(),
//!     MockTicketSource::new(),
//!     randomness.clone(),
//!     MockLedger::new(),
//!     SystemClock,
//! );
//! engine.create_round(1, create_round_config(), 1_000, randomness.commitment(1))?;
//! engine.close_round(1)?;
//! let round = engine.advance_round(1).await?;
//! println!("round 1 is {}", round.status);
//! # Ok(())
//! # }
//! # }
//! ```

pub mod audit;
pub mod backoff;
pub mod clock;
pub mod error;
pub mod lease;
pub mod match_engine;
pub mod oracle;
pub mod payout_planner;
pub mod rng_pipeline;
pub mod round_machine;
pub mod services;
pub mod settlement;
pub mod store;
pub mod ticket_reader;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

#[cfg(test)]
mod round_tests;

pub use audit::build_audit;
pub use backoff::{retry_call, RetryPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, ServiceError};
pub use lease::LeaseGuard;
pub use match_engine::{compute_matches, count_matches, select_single_winner};
pub use oracle::{verify_draw, verify_recorded_draw, DrawVerificationError, OracleClient};
pub use payout_planner::plan as plan_payouts;
pub use rng_pipeline::{
    compute_commit, derive_draw_numbers, verify_commit_reveal, verify_commit_reveal_slices,
    CommitRevealError, CommitRevealPair, HashChain, COMMIT_REVEAL_LEN,
};
pub use round_machine::{EngineConfig, RoundEngine};
pub use services::{
    Ledger, RandomnessRequest, RandomnessResponse, RandomnessService, TicketSource,
    TransferReceipt, TransferRequest, TransferStatus,
};
pub use settlement::{DedupLedger, SettlementExecutor};
pub use store::{FileRoundStore, InMemoryRoundStore, Lease, RoundStore, StoreError};
pub use ticket_reader::TicketReader;
