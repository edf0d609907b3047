//! In-process fakes of the ticket source, randomness oracle and ledger,
//! fixtures for building rounds and tickets, and [`MockWorld`] for running
//! whole engines against them.
//!
//! Every fake is a cheap `Clone` handle over shared state so a test can keep
//! one copy for inspection while the engine owns another.

use crate::backoff::RetryPolicy;
use crate::clock::{Clock, ManualClock};
use crate::error::ServiceError;
use crate::round_machine::{EngineConfig, RoundEngine};
use crate::rng_pipeline::{derive_draw_numbers, HashChain, COMMIT_REVEAL_LEN};
use crate::services::{
    Ledger, RandomnessRequest, RandomnessResponse, RandomnessService, TicketSource,
    TransferReceipt, TransferRequest, TransferStatus,
};
use crate::store::InMemoryRoundStore;
use drawsettle_types::{
    Hash32, HexBytes, MatchingRule, NumberRules, Numbers, PrizeMode, Round, RoundConfig,
    RoundId, Ticket, TierShare, TierTable, NUMBERS_PER_TICKET,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Six distinct numbers from 1 to 40.
pub fn fixture_rules() -> NumberRules {
    NumberRules {
        min: 1,
        max: 40,
        allow_duplicates: false,
    }
}

/// Round config paying the whole distributable pool to six-match tickets.
pub fn create_round_config() -> RoundConfig {
    RoundConfig {
        numbers: fixture_rules(),
        matching_rule: MatchingRule::Set,
        prize_mode: PrizeMode::Tiered,
        tiers: TierTable::from([(6, TierShare::Bps(10_000))]),
        house_cut_bps: 0,
        pool_account: "pool".to_string(),
        treasury_account: "treasury".to_string(),
    }
}

/// An open round with a 1_000 unit pool and the given commitment.
pub fn round_with_commitment(round_id: RoundId, commitment: Hash32) -> Round {
    Round::new(round_id, create_round_config(), 1_000, commitment, 0)
        .unwrap_or_else(|err| panic!("fixture config is valid: {err}"))
}

pub fn create_ticket(
    id: &str,
    owner: &str,
    numbers: Numbers,
    round_id: RoundId,
    purchased_at_ms: u64,
) -> Ticket {
    Ticket {
        id: id.to_string(),
        owner: owner.to_string(),
        numbers,
        round_id,
        purchased_at_ms,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ticket source
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TicketSourceState {
    tickets: Vec<Ticket>,
    failures: VecDeque<ServiceError>,
    stalled: bool,
    calls: u32,
}

#[derive(Clone, Default)]
pub struct MockTicketSource {
    state: Arc<Mutex<TicketSourceState>>,
}

impl MockTicketSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, ticket: Ticket) {
        lock(&self.state).tickets.push(ticket);
    }

    /// Replace a ticket's numbers in place (simulates an upstream rewrite).
    pub fn rewrite_numbers(&self, ticket_id: &str, numbers: Numbers) {
        for ticket in lock(&self.state).tickets.iter_mut() {
            if ticket.id == ticket_id {
                ticket.numbers = numbers;
            }
        }
    }

    /// Fail the next `count` reads with `error`.
    pub fn fail_next(&self, count: usize, error: ServiceError) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.failures.push_back(error.clone());
        }
    }

    /// Reads never complete until [`MockTicketSource::unstall`].
    pub fn stall(&self) {
        lock(&self.state).stalled = true;
    }

    pub fn unstall(&self) {
        lock(&self.state).stalled = false;
    }

    pub fn calls(&self) -> u32 {
        lock(&self.state).calls
    }

    fn read(&self, round_id: RoundId) -> Option<Result<Vec<Ticket>, ServiceError>> {
        let mut state = lock(&self.state);
        state.calls += 1;
        if state.stalled {
            return None;
        }
        if let Some(error) = state.failures.pop_front() {
            return Some(Err(error));
        }
        // Reversed so callers never rely on source order.
        Some(Ok(state
            .tickets
            .iter()
            .rev()
            .filter(|ticket| ticket.round_id == round_id)
            .cloned()
            .collect()))
    }
}

impl TicketSource for MockTicketSource {
    async fn list_tickets(
        &self,
        round_id: RoundId,
        _as_of_ms: u64,
    ) -> Result<Vec<Ticket>, ServiceError> {
        match self.read(round_id) {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Randomness oracle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RandomnessState {
    failures: VecDeque<ServiceError>,
    calls: u32,
    tamper_numbers: bool,
    tamper_proof: bool,
}

/// Commit-reveal oracle backed by a [`HashChain`].
#[derive(Clone)]
pub struct MockRandomness {
    chain: HashChain,
    state: Arc<Mutex<RandomnessState>>,
}

impl MockRandomness {
    pub fn new(secret: [u8; COMMIT_REVEAL_LEN]) -> Self {
        Self {
            chain: HashChain::from_secret(secret),
            state: Arc::new(Mutex::new(RandomnessState::default())),
        }
    }

    /// Commitment to register when creating `round_id`.
    pub fn commitment(&self, round_id: RoundId) -> Hash32 {
        self.chain.generate(round_id).commitment()
    }

    /// Numbers an honest draw for `round_id` produces.
    pub fn expected_numbers(&self, round_id: RoundId, rules: &NumberRules) -> Option<Numbers> {
        derive_draw_numbers(&self.chain.derive_reveal(round_id), round_id, rules).ok()
    }

    /// Return numbers that do not follow from the proof.
    pub fn tamper_numbers(&self) {
        lock(&self.state).tamper_numbers = true;
    }

    /// Return a proof that does not open the commitment.
    pub fn tamper_proof(&self) {
        lock(&self.state).tamper_proof = true;
    }

    pub fn fail_next(&self, count: usize, error: ServiceError) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.failures.push_back(error.clone());
        }
    }

    pub fn calls(&self) -> u32 {
        lock(&self.state).calls
    }
}

impl RandomnessService for MockRandomness {
    async fn request_random(
        &self,
        request: &RandomnessRequest,
    ) -> Result<RandomnessResponse, ServiceError> {
        let mut state = lock(&self.state);
        state.calls += 1;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        let mut reveal = self.chain.derive_reveal(request.round_id);
        let mut numbers = derive_draw_numbers(&reveal, request.round_id, &request.numbers)
            .map_err(|err| ServiceError::Rejected(err.to_string()))?;
        if state.tamper_numbers {
            let rules = request.numbers;
            numbers[0] = if numbers[0] == rules.max {
                rules.min
            } else {
                numbers[0] + 1
            };
        }
        if state.tamper_proof {
            reveal[0] ^= 0xff;
        }
        Ok(RandomnessResponse {
            numbers,
            proof: HexBytes(reveal.to_vec()),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────────────────────────

struct LedgerState {
    native_idempotency: bool,
    supports_lookup: bool,
    receipts: HashMap<String, String>,
    applied: Vec<TransferRequest>,
    transfer_calls: HashMap<String, u32>,
    failures: HashMap<String, VecDeque<ServiceError>>,
    rejections: HashMap<String, String>,
    dropped_responses: HashSet<String>,
    pending_lookups: HashMap<String, u32>,
    block_after: Option<usize>,
    balances: HashMap<String, i128>,
    next_tx: u64,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            native_idempotency: true,
            supports_lookup: true,
            receipts: HashMap::new(),
            applied: Vec::new(),
            transfer_calls: HashMap::new(),
            failures: HashMap::new(),
            rejections: HashMap::new(),
            dropped_responses: HashSet::new(),
            pending_lookups: HashMap::new(),
            block_after: None,
            balances: HashMap::new(),
            next_tx: 0,
        }
    }
}

enum LedgerAction {
    Respond(Result<TransferReceipt, ServiceError>),
    Hang,
}

/// Ledger with fault injection and full bookkeeping.
///
/// By default it honours idempotency keys and supports lookups.
#[derive(Clone, Default)]
pub struct MockLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger that applies every call, even repeated keys, and cannot look
    /// transfers up.
    pub fn without_idempotency() -> Self {
        let ledger = Self::default();
        {
            let mut state = lock(&ledger.state);
            state.native_idempotency = false;
            state.supports_lookup = false;
        }
        ledger
    }

    /// Keep lookups working on a ledger built with
    /// [`MockLedger::without_idempotency`].
    pub fn with_lookup(self) -> Self {
        lock(&self.state).supports_lookup = true;
        self
    }

    /// Answer the transfer for `key` as pending, and keep reporting it
    /// pending for the next `lookups` lookups before it turns final.
    pub fn settle_slowly(&self, key: &str, lookups: u32) {
        lock(&self.state)
            .pending_lookups
            .insert(key.to_string(), lookups);
    }

    /// Fail the next `count` transfers for `key` with `error`.
    pub fn fail_next(&self, key: &str, count: usize, error: ServiceError) {
        let mut state = lock(&self.state);
        let queue = state.failures.entry(key.to_string()).or_default();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Reject every transfer for `key`.
    pub fn reject(&self, key: &str, reason: &str) {
        lock(&self.state)
            .rejections
            .insert(key.to_string(), reason.to_string());
    }

    /// Apply the next transfer for `key` but report a timeout to the caller.
    pub fn drop_response_once(&self, key: &str) {
        lock(&self.state).dropped_responses.insert(key.to_string());
    }

    /// Once `count` transfers have been applied, further transfer calls
    /// never complete.
    pub fn block_after(&self, count: usize) {
        lock(&self.state).block_after = Some(count);
    }

    pub fn unblock(&self) {
        lock(&self.state).block_after = None;
    }

    /// Number of transfers actually applied, duplicates included.
    pub fn applied_count(&self) -> usize {
        lock(&self.state).applied.len()
    }

    pub fn applied_transfers(&self) -> Vec<TransferRequest> {
        lock(&self.state).applied.clone()
    }

    /// How many times a transfer for `key` was applied.
    pub fn applied_for(&self, key: &str) -> usize {
        lock(&self.state)
            .applied
            .iter()
            .filter(|request| request.idempotency_key == key)
            .count()
    }

    /// Calls made to `transfer` for `key`, whatever their outcome.
    pub fn transfer_calls(&self, key: &str) -> u32 {
        lock(&self.state)
            .transfer_calls
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    pub fn balance(&self, account: &str) -> i128 {
        lock(&self.state)
            .balances
            .get(account)
            .copied()
            .unwrap_or_default()
    }

    fn decide(&self, request: &TransferRequest) -> LedgerAction {
        let mut state = lock(&self.state);
        let key = request.idempotency_key.clone();
        *state.transfer_calls.entry(key.clone()).or_default() += 1;

        if let Some(error) = state
            .failures
            .get_mut(&key)
            .and_then(|queue| queue.pop_front())
        {
            return LedgerAction::Respond(Err(error));
        }
        if let Some(reason) = state.rejections.get(&key) {
            return LedgerAction::Respond(Err(ServiceError::Rejected(reason.clone())));
        }
        if state.native_idempotency {
            if let Some(tx_ref) = state.receipts.get(&key) {
                return LedgerAction::Respond(Ok(TransferReceipt {
                    status: TransferStatus::AlreadyApplied,
                    tx_ref: tx_ref.clone(),
                }));
            }
        }
        if state
            .block_after
            .is_some_and(|limit| state.applied.len() >= limit)
        {
            return LedgerAction::Hang;
        }

        state.next_tx += 1;
        let tx_ref = format!("tx-{:04}", state.next_tx);
        let amount = i128::from(request.amount);
        *state.balances.entry(request.from.clone()).or_default() -= amount;
        *state.balances.entry(request.to.clone()).or_default() += amount;
        state.applied.push(request.clone());
        state.receipts.entry(key.clone()).or_insert_with(|| tx_ref.clone());

        if state.dropped_responses.remove(&key) {
            return LedgerAction::Respond(Err(ServiceError::Timeout(Duration::from_secs(30))));
        }
        let status = if state.pending_lookups.contains_key(&key) {
            TransferStatus::Pending
        } else {
            TransferStatus::Confirmed
        };
        LedgerAction::Respond(Ok(TransferReceipt { status, tx_ref }))
    }
}

impl Ledger for MockLedger {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, ServiceError> {
        match self.decide(request) {
            LedgerAction::Respond(result) => result,
            LedgerAction::Hang => std::future::pending().await,
        }
    }

    async fn lookup_transfer(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<TransferReceipt>, ServiceError> {
        let mut state = lock(&self.state);
        if !state.supports_lookup {
            return Ok(None);
        }
        let Some(tx_ref) = state.receipts.get(idempotency_key).cloned() else {
            return Ok(None);
        };
        let status = match state.pending_lookups.get_mut(idempotency_key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                TransferStatus::Pending
            }
            _ => TransferStatus::AlreadyApplied,
        };
        Ok(Some(TransferReceipt { status, tx_ref }))
    }

    fn deduplicates_keys(&self) -> bool {
        lock(&self.state).native_idempotency
    }

    fn lookup_is_complete(&self) -> bool {
        lock(&self.state).supports_lookup
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine harness
// ─────────────────────────────────────────────────────────────────────────────

pub type MockEngine =
    RoundEngine<InMemoryRoundStore, MockTicketSource, MockRandomness, MockLedger, ManualClock>;

/// Retry policy with millisecond backoffs.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    }
}

/// Engine config for tests: short backoffs, one payout in flight.
pub fn fast_engine_config(holder_id: &str) -> EngineConfig {
    EngineConfig {
        holder_id: holder_id.to_string(),
        lease_ttl: Duration::from_secs(10),
        lease_renew_interval: Duration::from_millis(20),
        call_timeout: Duration::from_secs(1),
        ticket_retry: fast_retry(3),
        oracle_retry: fast_retry(3),
        settlement_retry: fast_retry(3),
        settlement_concurrency: 1,
    }
}

/// Shared fakes an engine (or several competing engines) runs against.
#[derive(Clone)]
pub struct MockWorld {
    pub store: InMemoryRoundStore,
    pub tickets: MockTicketSource,
    pub randomness: MockRandomness,
    pub ledger: MockLedger,
    pub clock: ManualClock,
}

impl Default for MockWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWorld {
    pub fn new() -> Self {
        Self {
            store: InMemoryRoundStore::new(),
            tickets: MockTicketSource::new(),
            randomness: MockRandomness::new([7; COMMIT_REVEAL_LEN]),
            ledger: MockLedger::new(),
            clock: ManualClock::new(1_000),
        }
    }

    pub fn engine(&self, holder_id: &str) -> MockEngine {
        self.engine_with(fast_engine_config(holder_id))
    }

    pub fn engine_with(&self, config: EngineConfig) -> MockEngine {
        RoundEngine::new(
            config,
            self.store.clone(),
            self.tickets.clone(),
            self.randomness.clone(),
            self.ledger.clone(),
            self.clock.clone(),
        )
    }

    /// Numbers the oracle will draw for `round_id` under `rules`.
    pub fn draw_for(&self, round_id: RoundId, rules: &NumberRules) -> Numbers {
        self.randomness
            .expected_numbers(round_id, rules)
            .unwrap_or_else(|| panic!("rules for round {round_id} cannot produce a draw"))
    }

    /// Numbers sharing no value with the draw for `round_id`, distinct
    /// whenever the range allows it.
    pub fn losing_numbers(&self, round_id: RoundId, rules: &NumberRules) -> Numbers {
        let draw = self.draw_for(round_id, rules);
        let unused: Vec<u8> = (rules.min..=rules.max)
            .filter(|value| !draw.contains(value))
            .collect();
        let first = *unused
            .first()
            .unwrap_or_else(|| panic!("every value in range is drawn for round {round_id}"));
        let mut numbers = [first; NUMBERS_PER_TICKET];
        if unused.len() >= NUMBERS_PER_TICKET {
            numbers.copy_from_slice(&unused[..NUMBERS_PER_TICKET]);
        } else if !rules.allow_duplicates {
            panic!("not enough undrawn values for round {round_id}");
        }
        numbers
    }

    /// Sell a ticket for `round_id` at the current clock time, then tick the
    /// clock so a close right after still includes it.
    pub fn sell(&self, round_id: RoundId, id: &str, owner: &str, numbers: Numbers) {
        let now = self.clock.now_ms();
        self.tickets.add(create_ticket(id, owner, numbers, round_id, now));
        self.clock.advance(1);
    }
}
