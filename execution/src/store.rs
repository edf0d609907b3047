//! Durable round state.
//!
//! This module provides the [`RoundStore`] trait and two backends: an
//! in-memory store for tests and simulations, and a file store for
//! production. Every engine step commits its effects here before the round's
//! status moves on, so a restarted worker only needs the store to continue.
//!
//! # Write-once records
//!
//! The draw and the accepted payout plan are insert-if-absent: the first
//! write wins and later writers get the stored value back. Settlement records
//! are upserted by ticket id and never deleted. The journal is append-only
//! with a dense per-round sequence.
//!
//! # Directory layout ([`FileRoundStore`])
//!
//! ```text
//! {base_path}/
//! └── rounds/
//!     └── {round_id:016x}/
//!         ├── round.json
//!         ├── snapshot.json
//!         ├── draw.json
//!         ├── plan.json
//!         ├── settlements/
//!         │   └── {idempotency_key}.json
//!         ├── events.jsonl
//!         ├── lease.json
//!         └── .lock
//! ```
//!
//! Whole-file writes go through write-rename (temp file, `fsync`, rename), so
//! a crash mid-write leaves the previous version in place.
//!
//! # Leases
//!
//! Every acquisition mints a fresh random token. Renewing and releasing match
//! on that token, never on the holder name, so two workers configured with the
//! same holder id still exclude each other and a stale guard cannot touch a
//! lease granted after it.

use drawsettle_types::{
    DrawResult, EventKind, PayoutPlan, Round, RoundEvent, RoundId, SettlementRecord,
    TicketSnapshot,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("round {round_id} not found")]
    RoundNotFound { round_id: RoundId },

    #[error("round {round_id} already exists")]
    RoundExists { round_id: RoundId },

    #[error("round {round_id} is leased by {holder} until {expires_at_ms}")]
    LeaseHeld {
        round_id: RoundId,
        holder: String,
        expires_at_ms: u64,
    },

    #[error("lease on round {round_id} was lost")]
    LeaseLost { round_id: RoundId },

    #[error("round {round_id} is locked by another writer")]
    Locked { round_id: RoundId },

    #[error("store corrupted: {0}")]
    Corrupted(String),
}

/// Exclusive right to drive one round until `expires_at_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub round_id: RoundId,
    pub holder: String,
    /// Unique per acquisition.
    #[serde(default)]
    pub token: String,
    pub expires_at_ms: u64,
}

impl Lease {
    fn same_grant(&self, other: &Lease) -> bool {
        !self.token.is_empty() && self.token == other.token
    }
}

/// Storage backend for rounds and everything derived from them.
///
/// Implementations are shared between concurrent tasks, so every method
/// takes `&self`.
pub trait RoundStore: Send + Sync {
    /// Persist a new round. Fails with `RoundExists` if the id is taken.
    fn create_round(&self, round: &Round) -> Result<(), StoreError>;

    fn get_round(&self, round_id: RoundId) -> Result<Option<Round>, StoreError>;

    /// Overwrite an existing round.
    fn put_round(&self, round: &Round) -> Result<(), StoreError>;

    /// All round ids, ascending.
    fn list_rounds(&self) -> Result<Vec<RoundId>, StoreError>;

    fn put_snapshot(&self, snapshot: &TicketSnapshot) -> Result<(), StoreError>;

    fn get_snapshot(&self, round_id: RoundId) -> Result<Option<TicketSnapshot>, StoreError>;

    /// Store the draw unless one exists; returns whichever draw is stored.
    fn record_draw(&self, draw: &DrawResult) -> Result<DrawResult, StoreError>;

    fn get_draw(&self, round_id: RoundId) -> Result<Option<DrawResult>, StoreError>;

    /// Store the plan unless one exists; returns whichever plan is stored.
    fn accept_plan(&self, plan: &PayoutPlan) -> Result<PayoutPlan, StoreError>;

    fn get_plan(&self, round_id: RoundId) -> Result<Option<PayoutPlan>, StoreError>;

    /// Insert or replace the record for `(round_id, ticket_id)`.
    fn put_settlement(&self, record: &SettlementRecord) -> Result<(), StoreError>;

    /// Records for a round ordered by ticket id.
    fn get_settlements(&self, round_id: RoundId) -> Result<Vec<SettlementRecord>, StoreError>;

    /// Append a journal entry and return it with its assigned sequence.
    fn append_event(
        &self,
        round_id: RoundId,
        at_ms: u64,
        kind: EventKind,
    ) -> Result<RoundEvent, StoreError>;

    fn events(&self, round_id: RoundId) -> Result<Vec<RoundEvent>, StoreError>;

    /// Take the lease if it is free or expired. A live lease is never
    /// granted twice, whoever asks.
    fn acquire_lease(
        &self,
        round_id: RoundId,
        holder: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<Lease, StoreError>;

    /// Extend `lease`. Fails with `LeaseLost` if it was released or granted
    /// to someone else since.
    fn renew_lease(&self, lease: &Lease, now_ms: u64, ttl_ms: u64) -> Result<Lease, StoreError>;

    /// Drop `lease` if it is still the current grant.
    fn release_lease(&self, lease: &Lease) -> Result<(), StoreError>;
}

fn mint_token(holder: &str) -> String {
    format!(
        "{holder}:{}:{:016x}",
        std::process::id(),
        rand::random::<u64>()
    )
}

fn grant_lease(
    current: Option<&Lease>,
    round_id: RoundId,
    holder: &str,
    now_ms: u64,
    ttl_ms: u64,
) -> Result<Lease, StoreError> {
    if let Some(lease) = current {
        if lease.expires_at_ms > now_ms {
            return Err(StoreError::LeaseHeld {
                round_id,
                holder: lease.holder.clone(),
                expires_at_ms: lease.expires_at_ms,
            });
        }
    }
    Ok(Lease {
        round_id,
        holder: holder.to_string(),
        token: mint_token(holder),
        expires_at_ms: now_ms.saturating_add(ttl_ms),
    })
}

fn extend_lease(
    current: Option<&Lease>,
    ours: &Lease,
    now_ms: u64,
    ttl_ms: u64,
) -> Result<Lease, StoreError> {
    match current {
        Some(lease) if lease.same_grant(ours) => Ok(Lease {
            expires_at_ms: now_ms.saturating_add(ttl_ms),
            ..lease.clone()
        }),
        _ => Err(StoreError::LeaseLost {
            round_id: ours.round_id,
        }),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RoundEntry {
    round: Option<Round>,
    snapshot: Option<TicketSnapshot>,
    draw: Option<DrawResult>,
    plan: Option<PayoutPlan>,
    settlements: BTreeMap<String, SettlementRecord>,
    events: Vec<RoundEvent>,
    lease: Option<Lease>,
}

/// In-memory store. Clones share the same state, which lets a test hand the
/// same store to a "crashed" engine and to its replacement.
#[derive(Clone, Default)]
pub struct InMemoryRoundStore {
    rounds: Arc<Mutex<HashMap<RoundId, RoundEntry>>>,
}

impl InMemoryRoundStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RoundId, RoundEntry>> {
        self.rounds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lease, if any (test inspection).
    pub fn lease(&self, round_id: RoundId) -> Option<Lease> {
        self.lock().get(&round_id).and_then(|entry| entry.lease.clone())
    }
}

impl RoundStore for InMemoryRoundStore {
    fn create_round(&self, round: &Round) -> Result<(), StoreError> {
        let mut rounds = self.lock();
        let entry = rounds.entry(round.id).or_default();
        if entry.round.is_some() {
            return Err(StoreError::RoundExists { round_id: round.id });
        }
        entry.round = Some(round.clone());
        Ok(())
    }

    fn get_round(&self, round_id: RoundId) -> Result<Option<Round>, StoreError> {
        Ok(self.lock().get(&round_id).and_then(|entry| entry.round.clone()))
    }

    fn put_round(&self, round: &Round) -> Result<(), StoreError> {
        let mut rounds = self.lock();
        match rounds.get_mut(&round.id) {
            Some(entry) if entry.round.is_some() => {
                entry.round = Some(round.clone());
                Ok(())
            }
            _ => Err(StoreError::RoundNotFound { round_id: round.id }),
        }
    }

    fn list_rounds(&self) -> Result<Vec<RoundId>, StoreError> {
        let mut ids: Vec<RoundId> = self
            .lock()
            .iter()
            .filter(|(_, entry)| entry.round.is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn put_snapshot(&self, snapshot: &TicketSnapshot) -> Result<(), StoreError> {
        self.lock().entry(snapshot.round_id).or_default().snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn get_snapshot(&self, round_id: RoundId) -> Result<Option<TicketSnapshot>, StoreError> {
        Ok(self
            .lock()
            .get(&round_id)
            .and_then(|entry| entry.snapshot.clone()))
    }

    fn record_draw(&self, draw: &DrawResult) -> Result<DrawResult, StoreError> {
        let mut rounds = self.lock();
        let entry = rounds.entry(draw.round_id).or_default();
        Ok(entry.draw.get_or_insert_with(|| draw.clone()).clone())
    }

    fn get_draw(&self, round_id: RoundId) -> Result<Option<DrawResult>, StoreError> {
        Ok(self.lock().get(&round_id).and_then(|entry| entry.draw.clone()))
    }

    fn accept_plan(&self, plan: &PayoutPlan) -> Result<PayoutPlan, StoreError> {
        let mut rounds = self.lock();
        let entry = rounds.entry(plan.round_id).or_default();
        Ok(entry.plan.get_or_insert_with(|| plan.clone()).clone())
    }

    fn get_plan(&self, round_id: RoundId) -> Result<Option<PayoutPlan>, StoreError> {
        Ok(self.lock().get(&round_id).and_then(|entry| entry.plan.clone()))
    }

    fn put_settlement(&self, record: &SettlementRecord) -> Result<(), StoreError> {
        self.lock()
            .entry(record.round_id)
            .or_default()
            .settlements
            .insert(record.ticket_id.clone(), record.clone());
        Ok(())
    }

    fn get_settlements(&self, round_id: RoundId) -> Result<Vec<SettlementRecord>, StoreError> {
        Ok(self
            .lock()
            .get(&round_id)
            .map(|entry| entry.settlements.values().cloned().collect())
            .unwrap_or_default())
    }

    fn append_event(
        &self,
        round_id: RoundId,
        at_ms: u64,
        kind: EventKind,
    ) -> Result<RoundEvent, StoreError> {
        let mut rounds = self.lock();
        let entry = rounds.entry(round_id).or_default();
        let event = RoundEvent {
            round_id,
            sequence: entry.events.len() as u64,
            at_ms,
            kind,
        };
        entry.events.push(event.clone());
        Ok(event)
    }

    fn events(&self, round_id: RoundId) -> Result<Vec<RoundEvent>, StoreError> {
        Ok(self
            .lock()
            .get(&round_id)
            .map(|entry| entry.events.clone())
            .unwrap_or_default())
    }

    fn acquire_lease(
        &self,
        round_id: RoundId,
        holder: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<Lease, StoreError> {
        let mut rounds = self.lock();
        let entry = rounds.entry(round_id).or_default();
        let lease = grant_lease(entry.lease.as_ref(), round_id, holder, now_ms, ttl_ms)?;
        entry.lease = Some(lease.clone());
        Ok(lease)
    }

    fn renew_lease(&self, lease: &Lease, now_ms: u64, ttl_ms: u64) -> Result<Lease, StoreError> {
        let mut rounds = self.lock();
        let entry = rounds.entry(lease.round_id).or_default();
        let renewed = extend_lease(entry.lease.as_ref(), lease, now_ms, ttl_ms)?;
        entry.lease = Some(renewed.clone());
        Ok(renewed)
    }

    fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        if let Some(entry) = self.lock().get_mut(&lease.round_id) {
            if entry.lease.as_ref().is_some_and(|current| current.same_grant(lease)) {
                entry.lease = None;
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File store
// ─────────────────────────────────────────────────────────────────────────────

const LOCK_FILE: &str = ".lock";
const LOCK_POLL: Duration = Duration::from_millis(2);
const LOCK_WAIT: Duration = Duration::from_secs(1);
/// A lock file older than this was left by a writer that died holding it.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);

/// Exclusive `.lock` file in a round directory, removed on drop.
///
/// Created with `O_EXCL`, so it excludes writers in other processes sharing
/// the directory as well as other store handles in this one.
struct RoundLock {
    path: PathBuf,
}

impl RoundLock {
    fn acquire(round_id: RoundId, dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let started = Instant::now();
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path) {
                        warn!(round_id, path = %path.display(), "breaking stale round lock");
                        match std::fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                            Err(err) => return Err(err.into()),
                        }
                    }
                    if started.elapsed() >= LOCK_WAIT {
                        return Err(StoreError::Locked { round_id });
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn is_stale(path: &Path) -> bool {
        std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > LOCK_STALE_AFTER)
    }
}

impl Drop for RoundLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// File-backed store.
///
/// Read-modify-write operations (insert-if-absent, journal append, leases)
/// hold the round's `.lock` file, so several worker processes may share one
/// store directory. Handles within a process also queue on an in-memory mutex
/// before touching the file.
#[derive(Clone)]
pub struct FileRoundStore {
    rounds_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

/// Both halves of a round write lock, released in reverse order.
struct WriteGuard<'a> {
    _file: RoundLock,
    _process: MutexGuard<'a, ()>,
}

impl FileRoundStore {
    /// Create or open a store at the given path.
    pub fn open(base_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let rounds_dir = base_path.as_ref().join("rounds");
        std::fs::create_dir_all(&rounds_dir)?;
        Ok(Self {
            rounds_dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn guard(&self, round_id: RoundId) -> Result<WriteGuard<'_>, StoreError> {
        let process = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let file = RoundLock::acquire(round_id, &self.round_dir(round_id))?;
        Ok(WriteGuard {
            _file: file,
            _process: process,
        })
    }

    fn lock_path(&self, round_id: RoundId) -> PathBuf {
        self.round_dir(round_id).join(LOCK_FILE)
    }

    fn round_dir(&self, round_id: RoundId) -> PathBuf {
        self.rounds_dir.join(format!("{round_id:016x}"))
    }

    fn round_path(&self, round_id: RoundId) -> PathBuf {
        self.round_dir(round_id).join("round.json")
    }

    fn snapshot_path(&self, round_id: RoundId) -> PathBuf {
        self.round_dir(round_id).join("snapshot.json")
    }

    fn draw_path(&self, round_id: RoundId) -> PathBuf {
        self.round_dir(round_id).join("draw.json")
    }

    fn plan_path(&self, round_id: RoundId) -> PathBuf {
        self.round_dir(round_id).join("plan.json")
    }

    fn settlements_dir(&self, round_id: RoundId) -> PathBuf {
        self.round_dir(round_id).join("settlements")
    }

    fn events_path(&self, round_id: RoundId) -> PathBuf {
        self.round_dir(round_id).join("events.jsonl")
    }

    fn lease_path(&self, round_id: RoundId) -> PathBuf {
        self.round_dir(round_id).join("lease.json")
    }

    fn atomic_write<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(value)?;
        let temp_path = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        match std::fs::read(path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn insert_if_absent<T>(path: &Path, value: &T) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        if let Some(existing) = Self::read_json(path)? {
            return Ok(existing);
        }
        Self::atomic_write(path, value)?;
        Ok(value.clone())
    }

    fn truncate_torn_tail(path: &Path, file: &std::fs::File) -> Result<(), StoreError> {
        let data = std::fs::read(path)?;
        if data.is_empty() || data.ends_with(b"\n") {
            return Ok(());
        }
        let keep = data
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map_or(0, |index| index + 1);
        file.set_len(keep as u64)?;
        Ok(())
    }
}

impl RoundStore for FileRoundStore {
    fn create_round(&self, round: &Round) -> Result<(), StoreError> {
        let _guard = self.guard(round.id)?;
        let path = self.round_path(round.id);
        if path.exists() {
            return Err(StoreError::RoundExists { round_id: round.id });
        }
        Self::atomic_write(&path, round)
    }

    fn get_round(&self, round_id: RoundId) -> Result<Option<Round>, StoreError> {
        Self::read_json(&self.round_path(round_id))
    }

    fn put_round(&self, round: &Round) -> Result<(), StoreError> {
        let path = self.round_path(round.id);
        if !path.exists() {
            return Err(StoreError::RoundNotFound { round_id: round.id });
        }
        Self::atomic_write(&path, round)
    }

    fn list_rounds(&self) -> Result<Vec<RoundId>, StoreError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.rounds_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|name| u64::from_str_radix(name, 16).ok())
            else {
                continue;
            };
            if self.round_path(id).exists() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn put_snapshot(&self, snapshot: &TicketSnapshot) -> Result<(), StoreError> {
        Self::atomic_write(&self.snapshot_path(snapshot.round_id), snapshot)
    }

    fn get_snapshot(&self, round_id: RoundId) -> Result<Option<TicketSnapshot>, StoreError> {
        Self::read_json(&self.snapshot_path(round_id))
    }

    fn record_draw(&self, draw: &DrawResult) -> Result<DrawResult, StoreError> {
        let _guard = self.guard(draw.round_id)?;
        Self::insert_if_absent(&self.draw_path(draw.round_id), draw)
    }

    fn get_draw(&self, round_id: RoundId) -> Result<Option<DrawResult>, StoreError> {
        Self::read_json(&self.draw_path(round_id))
    }

    fn accept_plan(&self, plan: &PayoutPlan) -> Result<PayoutPlan, StoreError> {
        let _guard = self.guard(plan.round_id)?;
        Self::insert_if_absent(&self.plan_path(plan.round_id), plan)
    }

    fn get_plan(&self, round_id: RoundId) -> Result<Option<PayoutPlan>, StoreError> {
        Self::read_json(&self.plan_path(round_id))
    }

    fn put_settlement(&self, record: &SettlementRecord) -> Result<(), StoreError> {
        let path = self
            .settlements_dir(record.round_id)
            .join(format!("{}.json", record.idempotency_key));
        Self::atomic_write(&path, record)
    }

    fn get_settlements(&self, round_id: RoundId) -> Result<Vec<SettlementRecord>, StoreError> {
        let dir = self.settlements_dir(round_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read_json::<SettlementRecord>(&path)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.ticket_id.cmp(&b.ticket_id));
        Ok(records)
    }

    fn append_event(
        &self,
        round_id: RoundId,
        at_ms: u64,
        kind: EventKind,
    ) -> Result<RoundEvent, StoreError> {
        let _guard = self.guard(round_id)?;
        let path = self.events_path(round_id);
        let event = RoundEvent {
            round_id,
            sequence: self.events(round_id)?.len() as u64,
            at_ms,
            kind,
        };
        std::fs::create_dir_all(self.round_dir(round_id))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Self::truncate_torn_tail(&path, &file)?;
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(event)
    }

    fn events(&self, round_id: RoundId) -> Result<Vec<RoundEvent>, StoreError> {
        let data = match std::fs::read_to_string(self.events_path(round_id)) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        // Only newline-terminated lines are committed; anything after the
        // last newline is a torn append.
        let committed = match data.rfind('\n') {
            Some(end) => &data[..=end],
            None => "",
        };
        let mut events = Vec::new();
        for (index, line) in committed.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str::<RoundEvent>(line).map_err(|err| {
                StoreError::Corrupted(format!("round {round_id} journal line {index}: {err}"))
            })?;
            events.push(event);
        }
        Ok(events)
    }

    fn acquire_lease(
        &self,
        round_id: RoundId,
        holder: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<Lease, StoreError> {
        let _guard = self.guard(round_id)?;
        let path = self.lease_path(round_id);
        let current: Option<Lease> = Self::read_json(&path)?;
        let lease = grant_lease(current.as_ref(), round_id, holder, now_ms, ttl_ms)?;
        Self::atomic_write(&path, &lease)?;
        Ok(lease)
    }

    fn renew_lease(&self, lease: &Lease, now_ms: u64, ttl_ms: u64) -> Result<Lease, StoreError> {
        let _guard = self.guard(lease.round_id)?;
        let path = self.lease_path(lease.round_id);
        let current: Option<Lease> = Self::read_json(&path)?;
        let renewed = extend_lease(current.as_ref(), lease, now_ms, ttl_ms)?;
        Self::atomic_write(&path, &renewed)?;
        Ok(renewed)
    }

    fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let _guard = self.guard(lease.round_id)?;
        let path = self.lease_path(lease.round_id);
        let current: Option<Lease> = Self::read_json(&path)?;
        if current.is_some_and(|current| current.same_grant(lease)) {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
