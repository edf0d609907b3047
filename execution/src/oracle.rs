//! Randomness oracle client and draw verification.

use crate::backoff::{retry_call, RetryPolicy};
use crate::error::EngineError;
use crate::rng_pipeline::{derive_draw_numbers, verify_commit_reveal_slices, CommitRevealError};
use crate::services::{RandomnessRequest, RandomnessResponse, RandomnessService};
use crate::store::RoundStore;
use drawsettle_types::{DrawResult, Round, VerificationStatus};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DrawVerificationError {
    #[error(transparent)]
    CommitReveal(#[from] CommitRevealError),
    #[error("numbers {returned:?} do not match the proof (expected {expected:?})")]
    NumbersMismatch {
        returned: drawsettle_types::Numbers,
        expected: drawsettle_types::Numbers,
    },
}

/// Check an oracle response against the round's commitment.
///
/// The proof must open the commitment, and the numbers must be exactly the
/// ones derived from the proof under the round's number rules.
pub fn verify_draw(
    round: &Round,
    response: &RandomnessResponse,
) -> Result<(), DrawVerificationError> {
    let reveal = verify_commit_reveal_slices(round.commitment.as_bytes(), response.proof.as_ref())?;
    let expected = derive_draw_numbers(&reveal, round.id, &round.config.numbers)?;
    if expected != response.numbers {
        return Err(DrawVerificationError::NumbersMismatch {
            returned: response.numbers,
            expected,
        });
    }
    Ok(())
}

/// Verify a recorded draw after the fact (audits, re-reads).
pub fn verify_recorded_draw(round: &Round, draw: &DrawResult) -> Result<(), DrawVerificationError> {
    verify_draw(
        round,
        &RandomnessResponse {
            numbers: draw.numbers,
            proof: draw.proof.clone(),
        },
    )
}

pub struct OracleClient<R> {
    service: R,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl<R: RandomnessService> OracleClient<R> {
    pub fn new(service: R, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            service,
            retry,
            call_timeout,
        }
    }

    pub fn service(&self) -> &R {
        &self.service
    }

    /// Obtain the round's draw.
    ///
    /// A draw already in the store is returned as-is and the oracle is not
    /// called again. Otherwise the response is verified and recorded with its
    /// verification status; if another writer recorded first, theirs wins.
    pub async fn request_draw<S: RoundStore>(
        &self,
        store: &S,
        round: &Round,
        now_ms: u64,
    ) -> Result<DrawResult, EngineError> {
        if let Some(existing) = store.get_draw(round.id)? {
            debug!(round_id = round.id, "draw already recorded");
            return Ok(existing);
        }

        let request = RandomnessRequest {
            round_id: round.id,
            commitment: round.commitment,
            numbers: round.config.numbers,
        };
        let response = retry_call(&self.retry, self.call_timeout, "randomness request", || {
            self.service.request_random(&request)
        })
        .await?;

        let status = match verify_draw(round, &response) {
            Ok(()) => VerificationStatus::Verified,
            Err(err) => {
                warn!(round_id = round.id, error = %err, "draw failed verification");
                VerificationStatus::Unverifiable
            }
        };
        let draw = DrawResult {
            round_id: round.id,
            numbers: response.numbers,
            proof: response.proof,
            commitment: round.commitment,
            status,
            recorded_at_ms: now_ms,
        };
        let stored = store.record_draw(&draw)?;
        info!(round_id = round.id, numbers = ?stored.numbers, status = ?stored.status, "draw recorded");
        Ok(stored)
    }
}
