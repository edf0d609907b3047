//! Defaults for optional [crate::Config] fields.

pub const DEFAULT_LOG_LEVEL: &str = "info";
/// Prefix of the default lease holder name; the process id is appended.
pub const DEFAULT_HOLDER_ID: &str = "drawsettle-node";

pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_LEASE_TTL_MS: u64 = 60_000;
pub const DEFAULT_SETTLEMENT_CONCURRENCY: usize = 4;

/// Sustained transfer rate allowed against the ledger.
pub const DEFAULT_LEDGER_RATE_PER_SECOND: u32 = 20;
pub const DEFAULT_LEDGER_NATIVE_IDEMPOTENCY: bool = true;

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 200;
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 10_000;
