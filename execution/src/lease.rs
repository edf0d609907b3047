use crate::error::EngineError;
use crate::store::{Lease, RoundStore};
use drawsettle_types::RoundId;
use tracing::debug;

/// A held round lease.
///
/// Not released on drop: a worker that dies mid-stage keeps the lease until
/// it expires.
#[derive(Debug)]
pub struct LeaseGuard {
    lease: Lease,
    ttl_ms: u64,
}

impl LeaseGuard {
    pub fn acquire<S: RoundStore>(
        store: &S,
        round_id: RoundId,
        holder: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<Self, EngineError> {
        let lease = store.acquire_lease(round_id, holder, now_ms, ttl_ms)?;
        debug!(round_id, holder, token = %lease.token, expires_at_ms = lease.expires_at_ms, "lease acquired");
        Ok(Self { lease, ttl_ms })
    }

    pub fn round_id(&self) -> RoundId {
        self.lease.round_id
    }

    pub fn holder(&self) -> &str {
        &self.lease.holder
    }

    pub fn token(&self) -> &str {
        &self.lease.token
    }

    /// Extend the lease; fails if another worker has taken it over.
    pub fn renew<S: RoundStore>(&self, store: &S, now_ms: u64) -> Result<(), EngineError> {
        let renewed = store.renew_lease(&self.lease, now_ms, self.ttl_ms)?;
        debug!(round_id = renewed.round_id, expires_at_ms = renewed.expires_at_ms, "lease renewed");
        Ok(())
    }

    pub fn release<S: RoundStore>(self, store: &S) -> Result<(), EngineError> {
        store.release_lease(&self.lease)?;
        debug!(round_id = self.lease.round_id, holder = %self.lease.holder, "lease released");
        Ok(())
    }
}
