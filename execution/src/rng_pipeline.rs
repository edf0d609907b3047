//! Commit-reveal randomness for draws.
//!
//! The randomness provider publishes `commit = SHA-256(reveal)` before a round
//! opens for sales. At draw time it discloses `reveal` as the proof, and the
//! draw numbers are a pure function of the reveal:
//!
//! ```text
//! word[i]   = SHA-256(reveal || round_id_be || counter_be || "draw")[0..8]
//! number[i] = min + (u64_be(word[i]) mod span)
//! ```
//!
//! `counter` starts at zero and increments for every hash. When the round
//! disallows duplicates, a candidate already drawn is skipped and the counter
//! moves on. Anyone holding the reveal reproduces the exact numbers.

use commonware_cryptography::sha256::Sha256;
use commonware_cryptography::Hasher;
use drawsettle_types::{Hash32, NumberRules, Numbers, NUMBERS_PER_TICKET};
use thiserror::Error;

/// Length of commit and reveal values in bytes.
pub const COMMIT_REVEAL_LEN: usize = 32;

const DRAW_DOMAIN: &[u8] = b"draw";

/// Upper bound on hashes per draw. Unreachable for validated rules; keeps a
/// bad rule set from spinning forever.
const MAX_DRAW_HASHES: u64 = 4_096;

/// A commit-reveal pair for one round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitRevealPair {
    pub commit: [u8; COMMIT_REVEAL_LEN],
    pub reveal: [u8; COMMIT_REVEAL_LEN],
}

impl CommitRevealPair {
    pub fn verify(&self) -> bool {
        verify_commit_reveal(&self.commit, &self.reveal)
    }

    pub fn commitment(&self) -> Hash32 {
        Hash32(self.commit)
    }
}

/// `commit = SHA-256(reveal)`
pub fn compute_commit(reveal: &[u8; COMMIT_REVEAL_LEN]) -> [u8; COMMIT_REVEAL_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(reveal);
    hasher.finalize().0
}

pub fn verify_commit_reveal(
    commit: &[u8; COMMIT_REVEAL_LEN],
    reveal: &[u8; COMMIT_REVEAL_LEN],
) -> bool {
    compute_commit(reveal) == *commit
}

/// Verify a proof of arbitrary length against a stored commitment.
///
/// Returns the reveal on success.
pub fn verify_commit_reveal_slices(
    commit: &[u8],
    reveal: &[u8],
) -> Result<[u8; COMMIT_REVEAL_LEN], CommitRevealError> {
    let commit: [u8; COMMIT_REVEAL_LEN] = commit
        .try_into()
        .map_err(|_| CommitRevealError::InvalidCommitLength(commit.len()))?;
    let reveal: [u8; COMMIT_REVEAL_LEN] = reveal
        .try_into()
        .map_err(|_| CommitRevealError::InvalidRevealLength(reveal.len()))?;
    if verify_commit_reveal(&commit, &reveal) {
        Ok(reveal)
    } else {
        Err(CommitRevealError::VerificationFailed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitRevealError {
    #[error("invalid commit length: {0} (expected 32)")]
    InvalidCommitLength(usize),
    #[error("invalid reveal length: {0} (expected 32)")]
    InvalidRevealLength(usize),
    #[error("reveal does not open the commitment")]
    VerificationFailed,
    #[error("number rules cannot produce a draw")]
    UnsatisfiableRules,
}

/// Derive the draw numbers for `round_id` from a disclosed reveal.
pub fn derive_draw_numbers(
    reveal: &[u8; COMMIT_REVEAL_LEN],
    round_id: u64,
    rules: &NumberRules,
) -> Result<Numbers, CommitRevealError> {
    if rules.validate().is_err() {
        return Err(CommitRevealError::UnsatisfiableRules);
    }
    let span = rules.span();
    let mut numbers = [0u8; NUMBERS_PER_TICKET];
    let mut filled = 0;
    let mut counter = 0u64;
    while filled < NUMBERS_PER_TICKET {
        if counter >= MAX_DRAW_HASHES {
            return Err(CommitRevealError::UnsatisfiableRules);
        }
        let mut hasher = Sha256::new();
        hasher.update(reveal);
        hasher.update(&round_id.to_be_bytes());
        hasher.update(&counter.to_be_bytes());
        hasher.update(DRAW_DOMAIN);
        let digest = hasher.finalize().0;
        counter += 1;

        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        let offset = (u64::from_be_bytes(word) % span) as u8;
        let candidate = rules.min + offset;
        if !rules.allow_duplicates && numbers[..filled].contains(&candidate) {
            continue;
        }
        numbers[filled] = candidate;
        filled += 1;
    }
    Ok(numbers)
}

/// Per-round reveals derived from one master secret.
///
/// The provider keeps the secret and publishes `precompute_commits` ahead of
/// time; each reveal stays hidden until its round is drawn.
#[derive(Clone)]
pub struct HashChain {
    master_secret: [u8; COMMIT_REVEAL_LEN],
}

impl HashChain {
    pub fn from_secret(master_secret: [u8; COMMIT_REVEAL_LEN]) -> Self {
        Self { master_secret }
    }

    pub fn generate(&self, round_id: u64) -> CommitRevealPair {
        let reveal = self.derive_reveal(round_id);
        let commit = compute_commit(&reveal);
        CommitRevealPair { commit, reveal }
    }

    pub fn derive_reveal(&self, round_id: u64) -> [u8; COMMIT_REVEAL_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(&self.master_secret);
        hasher.update(&round_id.to_be_bytes());
        hasher.finalize().0
    }

    pub fn precompute_commits(
        &self,
        start_round: u64,
        count: u64,
    ) -> Vec<(u64, [u8; COMMIT_REVEAL_LEN])> {
        let end_round = start_round.saturating_add(count);
        (start_round..end_round)
            .map(|round_id| (round_id, self.generate(round_id).commit))
            .collect()
    }
}
