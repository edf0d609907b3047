//! Draw results returned by the randomness oracle.

use crate::hash::{Hash32, HexBytes};
use crate::round::RoundId;
use crate::Numbers;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Unverifiable,
}

/// The draw recorded for a round. Written exactly once, never replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawResult {
    pub round_id: RoundId,
    pub numbers: Numbers,
    /// Proof returned by the oracle (the commitment pre-image).
    pub proof: HexBytes,
    /// Commitment the proof was checked against.
    pub commitment: Hash32,
    pub status: VerificationStatus,
    pub recorded_at_ms: u64,
}

impl DrawResult {
    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified
    }
}
