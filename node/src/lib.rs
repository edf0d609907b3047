use drawsettle_execution::{EngineConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::Level;
use url::Url;

pub mod defaults;
pub mod http;

/// Retry tunables for one class of external call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_backoff_ms: defaults::DEFAULT_RETRY_INITIAL_BACKOFF_MS,
            max_backoff_ms: defaults::DEFAULT_RETRY_MAX_BACKOFF_MS,
        }
    }
}

/// Configuration for the settlement node.
#[derive(Deserialize, Serialize)]
pub struct Config {
    /// Root of the round store.
    pub directory: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    /// Name written into round leases, for operators. Exclusion does not
    /// depend on it; defaults to a per-process name.
    #[serde(default = "default_holder_id")]
    pub holder_id: String,

    pub ticket_source_url: String,
    pub randomness_url: String,
    pub ledger_url: String,
    #[serde(default)]
    pub ledger_api_token: Option<String>,
    #[serde(default = "default_ledger_rate_per_second")]
    pub ledger_rate_per_second: u32,
    /// Whether the ledger honours idempotency keys itself. When false the
    /// node deduplicates transfers in front of it.
    #[serde(default = "default_ledger_native_idempotency")]
    pub ledger_native_idempotency: bool,
    /// Whether a 404 from the ledger's transfer lookup proves the transfer
    /// was never applied. Lets a deduplicated ledger resubmit after a lost
    /// response.
    #[serde(default)]
    pub ledger_lookup_authoritative: bool,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    #[serde(default = "default_settlement_concurrency")]
    pub settlement_concurrency: usize,
    #[serde(default)]
    pub ticket_retry: RetryConfig,
    #[serde(default)]
    pub oracle_retry: RetryConfig,
    #[serde(default)]
    pub settlement_retry: RetryConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} must be a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("{field} URL scheme must be http or https: {value}")]
    InvalidUrlScheme { field: &'static str, value: String },
    #[error("{field}: initial backoff {initial_ms}ms exceeds max backoff {max_ms}ms")]
    InvalidBackoff {
        field: &'static str,
        initial_ms: u64,
        max_ms: u64,
    },
    #[error("lease_ttl_ms ({lease_ttl_ms}) must exceed call_timeout_ms ({call_timeout_ms})")]
    LeaseTooShort {
        lease_ttl_ms: u64,
        call_timeout_ms: u64,
    },
}

pub struct ValidatedConfig {
    pub directory: PathBuf,
    pub log_level: Level,
    pub log_json: bool,

    pub ticket_source_url: Url,
    pub randomness_url: Url,
    pub ledger_url: Url,
    pub ledger_api_token: Option<String>,
    pub ledger_rate_per_second: NonZeroU32,
    pub ledger_native_idempotency: bool,
    pub ledger_lookup_authoritative: bool,

    pub call_timeout: Duration,
    pub engine: EngineConfig,
}

struct RedactedConfig<'a>(&'a Config);

impl fmt::Debug for RedactedConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cfg = self.0;
        f.debug_struct("Config")
            .field("directory", &cfg.directory)
            .field("log_level", &cfg.log_level)
            .field("log_json", &cfg.log_json)
            .field("holder_id", &cfg.holder_id)
            .field("ticket_source_url", &cfg.ticket_source_url)
            .field("randomness_url", &cfg.randomness_url)
            .field("ledger_url", &cfg.ledger_url)
            .field(
                "ledger_api_token",
                &cfg.ledger_api_token.as_ref().map(|_| "<redacted>"),
            )
            .field("ledger_rate_per_second", &cfg.ledger_rate_per_second)
            .field("ledger_native_idempotency", &cfg.ledger_native_idempotency)
            .field("ledger_lookup_authoritative", &cfg.ledger_lookup_authoritative)
            .field("call_timeout_ms", &cfg.call_timeout_ms)
            .field("lease_ttl_ms", &cfg.lease_ttl_ms)
            .field("settlement_concurrency", &cfg.settlement_concurrency)
            .field("ticket_retry", &cfg.ticket_retry)
            .field("oracle_retry", &cfg.oracle_retry)
            .field("settlement_retry", &cfg.settlement_retry)
            .finish()
    }
}

fn default_log_level() -> String {
    defaults::DEFAULT_LOG_LEVEL.to_string()
}

fn default_holder_id() -> String {
    format!("{}-{}", defaults::DEFAULT_HOLDER_ID, std::process::id())
}

fn default_ledger_rate_per_second() -> u32 {
    defaults::DEFAULT_LEDGER_RATE_PER_SECOND
}

fn default_ledger_native_idempotency() -> bool {
    defaults::DEFAULT_LEDGER_NATIVE_IDEMPOTENCY
}

fn default_call_timeout_ms() -> u64 {
    defaults::DEFAULT_CALL_TIMEOUT_MS
}

fn default_lease_ttl_ms() -> u64 {
    defaults::DEFAULT_LEASE_TTL_MS
}

fn default_settlement_concurrency() -> usize {
    defaults::DEFAULT_SETTLEMENT_CONCURRENCY
}

fn default_retry_max_attempts() -> u32 {
    defaults::DEFAULT_RETRY_MAX_ATTEMPTS
}

fn default_retry_initial_backoff_ms() -> u64 {
    defaults::DEFAULT_RETRY_INITIAL_BACKOFF_MS
}

fn default_retry_max_backoff_ms() -> u64 {
    defaults::DEFAULT_RETRY_MAX_BACKOFF_MS
}

fn ensure_nonzero_u64(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value: 0 });
    }
    Ok(())
}

fn nonzero_u32(field: &'static str, value: u32) -> Result<NonZeroU32, ConfigError> {
    NonZeroU32::new(value).ok_or(ConfigError::InvalidNonZero { field, value: 0 })
}

fn ensure_not_empty(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty { field });
    }
    Ok(())
}

fn parse_http_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(ConfigError::InvalidUrlScheme {
                field,
                value: value.to_string(),
            })
        }
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        });
    }
    Ok(url)
}

impl RetryConfig {
    fn validate(self, field: &'static str) -> Result<RetryPolicy, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidNonZero { field, value: 0 });
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff {
                field,
                initial_ms: self.initial_backoff_ms,
                max_ms: self.max_backoff_ms,
            });
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        })
    }
}

impl Config {
    pub fn redacted_debug(&self) -> impl fmt::Debug + '_ {
        RedactedConfig(self)
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        ensure_not_empty("directory", &self.directory)?;
        ensure_not_empty("holder_id", &self.holder_id)?;
        ensure_nonzero_u64("call_timeout_ms", self.call_timeout_ms)?;
        ensure_nonzero_u64("lease_ttl_ms", self.lease_ttl_ms)?;
        ensure_nonzero_u64("settlement_concurrency", self.settlement_concurrency as u64)?;
        if self.lease_ttl_ms <= self.call_timeout_ms {
            return Err(ConfigError::LeaseTooShort {
                lease_ttl_ms: self.lease_ttl_ms,
                call_timeout_ms: self.call_timeout_ms,
            });
        }
        let ledger_rate_per_second =
            nonzero_u32("ledger_rate_per_second", self.ledger_rate_per_second)?;
        let ticket_retry = self.ticket_retry.validate("ticket_retry")?;
        let oracle_retry = self.oracle_retry.validate("oracle_retry")?;
        let settlement_retry = self.settlement_retry.validate("settlement_retry")?;

        let ticket_source_url = parse_http_url("ticket_source_url", &self.ticket_source_url)?;
        let randomness_url = parse_http_url("randomness_url", &self.randomness_url)?;
        let ledger_url = parse_http_url("ledger_url", &self.ledger_url)?;

        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;

        let call_timeout = Duration::from_millis(self.call_timeout_ms);
        Ok(ValidatedConfig {
            directory: PathBuf::from(self.directory),
            log_level,
            log_json: self.log_json,
            ticket_source_url,
            randomness_url,
            ledger_url,
            ledger_api_token: self
                .ledger_api_token
                .filter(|token| !token.trim().is_empty()),
            ledger_rate_per_second,
            ledger_native_idempotency: self.ledger_native_idempotency,
            ledger_lookup_authoritative: self.ledger_lookup_authoritative,
            call_timeout,
            engine: EngineConfig {
                holder_id: self.holder_id,
                lease_ttl: Duration::from_millis(self.lease_ttl_ms),
                lease_renew_interval: Duration::from_millis(self.lease_ttl_ms / 3)
                    .max(Duration::from_millis(1)),
                call_timeout,
                ticket_retry,
                oracle_retry,
                settlement_retry,
                settlement_concurrency: self.settlement_concurrency,
            },
        })
    }
}
