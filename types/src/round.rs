//! Rounds, their immutable configuration and lifecycle status.

use crate::hash::{digest_parts, Hash32};
use crate::NUMBERS_PER_TICKET;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error as ThisError;

/// Unique round identifier.
pub type RoundId = u64;

/// Basis-point denominator for fractional shares.
pub const BPS_DENOMINATOR: u64 = 10_000;

const CONFIG_DOMAIN: &[u8] = b"drawsettle/round-config";

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ValidationError {
    #[error("number range is empty (min={min}, max={max})")]
    EmptyRange { min: u8, max: u8 },
    #[error("range {min}..={max} cannot hold {needed} distinct numbers")]
    RangeTooSmall { min: u8, max: u8, needed: usize },
    #[error("number {value} outside {min}..={max}")]
    NumberOutOfRange { value: u8, min: u8, max: u8 },
    #[error("duplicate number {value} not allowed")]
    DuplicateNumber { value: u8 },
    #[error("tier table is empty")]
    EmptyTierTable,
    #[error("tier {tier} must be between 1 and {max}")]
    InvalidTier { tier: u8, max: usize },
    #[error("tier {tier} has a zero share")]
    ZeroShare { tier: u8 },
    #[error("tier shares total {total} bps (max {max})")]
    SharesExceedPool { total: u64, max: u64 },
    #[error("house cut {bps} bps exceeds {max}")]
    HouseCutTooLarge { bps: u32, max: u64 },
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },
}

/// Lifecycle of a round.
///
/// The status names the stage that runs next, so a crashed worker resumes by
/// re-driving the persisted status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Open,
    Closed,
    Drawing,
    Matching,
    Settling,
    Settled,
    PartiallySettled,
    Failed,
    Cancelled,
}

impl RoundStatus {
    /// Successor on the happy path. `None` for statuses that do not advance
    /// on their own.
    pub fn next(self) -> Option<RoundStatus> {
        match self {
            RoundStatus::Closed => Some(RoundStatus::Drawing),
            RoundStatus::Drawing => Some(RoundStatus::Matching),
            RoundStatus::Matching => Some(RoundStatus::Settling),
            RoundStatus::Settling => Some(RoundStatus::Settled),
            _ => None,
        }
    }

    /// Whether the engine still has stage work to do for this status.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            RoundStatus::Closed
                | RoundStatus::Drawing
                | RoundStatus::Matching
                | RoundStatus::Settling
        )
    }

    /// No further automatic progress. `PartiallySettled` and `Failed` can be
    /// re-entered by an operator.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RoundStatus::Settled
                | RoundStatus::PartiallySettled
                | RoundStatus::Failed
                | RoundStatus::Cancelled
        )
    }

    /// Transitions the engine itself may perform.
    pub fn can_transition_to(self, to: RoundStatus) -> bool {
        use RoundStatus::*;
        matches!(
            (self, to),
            (Open, Closed)
                | (Open, Cancelled)
                | (Closed, Drawing)
                | (Drawing, Matching)
                | (Matching, Settling)
                | (Settling, Settled)
                | (Settling, PartiallySettled)
                | (Closed, Failed)
                | (Drawing, Failed)
                | (Matching, Failed)
                | (Settling, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoundStatus::Open => "open",
            RoundStatus::Closed => "closed",
            RoundStatus::Drawing => "drawing",
            RoundStatus::Matching => "matching",
            RoundStatus::Settling => "settling",
            RoundStatus::Settled => "settled",
            RoundStatus::PartiallySettled => "partially_settled",
            RoundStatus::Failed => "failed",
            RoundStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How ticket numbers are compared with the draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingRule {
    /// Count of positions where the ticket equals the draw.
    Positional,
    /// Number of distinct values present in both ticket and draw.
    #[default]
    Set,
    /// Size of the multiset intersection: a value drawn twice can be matched
    /// twice.
    Multiset,
}

/// Whether every qualifying ticket wins or only the best one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrizeMode {
    #[default]
    Tiered,
    /// Highest match count wins; ties go to the earliest purchase, then the
    /// smallest ticket id.
    SingleWinner,
}

/// Share of the distributable pool paid to one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierShare {
    /// Fraction of the distributable pool in basis points.
    Bps(u32),
    /// Fixed amount in smallest currency units.
    Fixed(u64),
}

/// Ordered mapping from match count to tier share.
pub type TierTable = BTreeMap<u8, TierShare>;

/// Allowed range and uniqueness of ticket and draw numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberRules {
    pub min: u8,
    pub max: u8,
    pub allow_duplicates: bool,
}

impl Default for NumberRules {
    fn default() -> Self {
        Self {
            min: 0,
            max: 9,
            allow_duplicates: true,
        }
    }
}

impl NumberRules {
    /// Number of distinct values in the range.
    pub fn span(&self) -> u64 {
        u64::from(self.max) - u64::from(self.min) + 1
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.min > self.max {
            return Err(ValidationError::EmptyRange {
                min: self.min,
                max: self.max,
            });
        }
        if !self.allow_duplicates && self.span() < NUMBERS_PER_TICKET as u64 {
            return Err(ValidationError::RangeTooSmall {
                min: self.min,
                max: self.max,
                needed: NUMBERS_PER_TICKET,
            });
        }
        Ok(())
    }

    /// Check a ticket or draw against the range and uniqueness rule.
    pub fn check(&self, numbers: &[u8]) -> Result<(), ValidationError> {
        for (index, &value) in numbers.iter().enumerate() {
            if value < self.min || value > self.max {
                return Err(ValidationError::NumberOutOfRange {
                    value,
                    min: self.min,
                    max: self.max,
                });
            }
            if !self.allow_duplicates && numbers[..index].contains(&value) {
                return Err(ValidationError::DuplicateNumber { value });
            }
        }
        Ok(())
    }
}

/// Configuration declared when a round is created. Never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundConfig {
    #[serde(default)]
    pub numbers: NumberRules,
    #[serde(default)]
    pub matching_rule: MatchingRule,
    #[serde(default)]
    pub prize_mode: PrizeMode,
    pub tiers: TierTable,
    #[serde(default)]
    pub house_cut_bps: u32,
    /// Account payouts are transferred from.
    pub pool_account: String,
    /// Sink for the house cut, unclaimed tiers and split remainders.
    pub treasury_account: String,
}

impl RoundConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.numbers.validate()?;
        if self.tiers.is_empty() {
            return Err(ValidationError::EmptyTierTable);
        }
        let mut total_bps = 0u64;
        for (&tier, share) in &self.tiers {
            if tier == 0 || usize::from(tier) > NUMBERS_PER_TICKET {
                return Err(ValidationError::InvalidTier {
                    tier,
                    max: NUMBERS_PER_TICKET,
                });
            }
            match *share {
                TierShare::Bps(0) | TierShare::Fixed(0) => {
                    return Err(ValidationError::ZeroShare { tier })
                }
                TierShare::Bps(bps) => total_bps += u64::from(bps),
                TierShare::Fixed(_) => {}
            }
        }
        if total_bps > BPS_DENOMINATOR {
            return Err(ValidationError::SharesExceedPool {
                total: total_bps,
                max: BPS_DENOMINATOR,
            });
        }
        if u64::from(self.house_cut_bps) > BPS_DENOMINATOR {
            return Err(ValidationError::HouseCutTooLarge {
                bps: self.house_cut_bps,
                max: BPS_DENOMINATOR,
            });
        }
        if self.pool_account.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "pool_account",
            });
        }
        if self.treasury_account.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "treasury_account",
            });
        }
        Ok(())
    }

    /// Digest binding the round to this exact configuration.
    pub fn digest(&self) -> Hash32 {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        digest_parts(CONFIG_DOMAIN, &[&encoded])
    }
}

/// Classification of a fatal stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DataIntegrity,
    RandomnessUnverifiable,
    TransientExhausted,
    /// An external service refused the request outright.
    ServiceRejected,
    ArithmeticInvariant,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::DataIntegrity => "data_integrity",
            FailureKind::RandomnessUnverifiable => "randomness_unverifiable",
            FailureKind::TransientExhausted => "transient_exhausted",
            FailureKind::ServiceRejected => "service_rejected",
            FailureKind::ArithmeticInvariant => "arithmetic_invariant",
        };
        f.write_str(name)
    }
}

/// Why and where a round stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    /// Stage that was executing; `resume_round` re-enters it.
    pub stage: RoundStatus,
    pub message: String,
    pub at_ms: u64,
}

/// Persisted state of one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub status: RoundStatus,
    pub config: RoundConfig,
    /// Digest of `config` taken at creation.
    pub config_digest: Hash32,
    pub prize_pool: u64,
    /// Randomness commitment registered before sales opened.
    pub commitment: Hash32,
    pub opened_at_ms: u64,
    #[serde(default)]
    pub closed_at_ms: Option<u64>,
    #[serde(default)]
    pub snapshot_digest: Option<Hash32>,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
    pub updated_at_ms: u64,
}

impl Round {
    pub fn new(
        id: RoundId,
        config: RoundConfig,
        prize_pool: u64,
        commitment: Hash32,
        opened_at_ms: u64,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        let config_digest = config.digest();
        Ok(Self {
            id,
            status: RoundStatus::Open,
            config,
            config_digest,
            prize_pool,
            commitment,
            opened_at_ms,
            closed_at_ms: None,
            snapshot_digest: None,
            failure: None,
            updated_at_ms: opened_at_ms,
        })
    }

    /// Whether the stored configuration still matches its creation digest.
    pub fn config_intact(&self) -> bool {
        self.config.digest() == self.config_digest
    }
}
