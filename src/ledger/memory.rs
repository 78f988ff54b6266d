//! In-memory reference ledger
//!
//! Enforces the same rules as the deployed HTLC contract. Every call validates
//! fully before it touches state, so a rejected call leaves the ledger exactly
//! as it was. Used for development networks and as the test double for
//! scenario tests.

use super::{CreateReceipt, LedgerContract, RateLimitStatus, SwapContract, ContractState, TxOptions};
use crate::clock::Clock;
use crate::config::NetworkConfig;
use crate::error::{RejectionReason, SwapError, SwapResult};
use crate::events::{EventBatch, LedgerEvent};
use crate::secret::{Commitments, HashFunction, HashLock, Secret};
use crate::types::{Address, ContractId, TxRef};

use async_trait::async_trait;
use sha3::{Digest, Keccak256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
struct RateEntry {
    count: u64,
    last: u64,
}

/// Most recent submissions kept for inspection
const SUBMISSION_HISTORY: usize = 256;

/// Events retained for cursor reads; a listener further behind skips ahead
const EVENT_HISTORY: usize = 4096;

#[derive(Default)]
struct LedgerState {
    contracts: HashMap<ContractId, SwapContract>,
    secrets: HashMap<ContractId, Secret>,
    balances: HashMap<Address, u128>,
    rate: HashMap<Address, RateEntry>,
    emergency_stop: bool,
    events: VecDeque<LedgerEvent>,
    /// Cursor of `events[0]`
    first_event: u64,
    nonce: u64,
    submissions: VecDeque<TxOptions>,
}

impl LedgerState {
    fn record_submission(&mut self, options: TxOptions) {
        if self.submissions.len() >= SUBMISSION_HISTORY {
            self.submissions.pop_front();
        }
        self.submissions.push_back(options);
    }

    fn emit(&mut self, event: LedgerEvent) {
        if self.events.len() >= EVENT_HISTORY {
            self.events.pop_front();
            self.first_event += 1;
        }
        self.events.push_back(event);
    }

    fn next_tx(&mut self, chain_id: u64) -> TxRef {
        self.nonce += 1;
        let mut hasher = Keccak256::new();
        hasher.update(chain_id.to_be_bytes());
        hasher.update(self.nonce.to_be_bytes());
        TxRef(format!("0x{}", hex::encode(hasher.finalize())))
    }
}

/// HTLC ledger held in process memory
pub struct MemoryLedger {
    network: String,
    chain_id: u64,
    min_timelock_secs: u64,
    max_timelock_secs: u64,
    max_swaps: u64,
    window_secs: u64,
    owner: Option<Address>,
    commitments: Commitments,
    clock: Arc<dyn Clock>,
    /// Chain the simulated signer currently targets
    selected_chain: AtomicU64,
    /// Mutating calls left to fail with a transient error
    transient_failures: AtomicU32,
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    /// Build from a network section. A network without its own hash function
    /// uses the protocol-wide one.
    pub fn from_config(
        network: &str,
        config: &NetworkConfig,
        protocol_hash: HashFunction,
        clock: Arc<dyn Clock>,
    ) -> SwapResult<Self> {
        let commitments = Commitments::new(config.hash_function.unwrap_or(protocol_hash));
        let mut ledger = Self::new(network, config.chain_id, commitments, clock);
        ledger.min_timelock_secs = config.min_timelock_secs;
        ledger.max_timelock_secs = config.max_timelock_secs;
        ledger.max_swaps = config.max_swaps_per_window;
        ledger.window_secs = config.rate_limit_window_secs;
        ledger.owner = config.owner.as_deref().map(Address::new);
        Ok(ledger)
    }

    /// Ledger with default bounds: timelocks within (30m, 48h], 10 swaps per day
    pub fn new(network: &str, chain_id: u64, commitments: Commitments, clock: Arc<dyn Clock>) -> Self {
        Self {
            network: network.to_string(),
            chain_id,
            min_timelock_secs: 1800,
            max_timelock_secs: 48 * 3600,
            max_swaps: 10,
            window_secs: 24 * 3600,
            owner: None,
            commitments,
            clock,
            selected_chain: AtomicU64::new(chain_id),
            transient_failures: AtomicU32::new(0),
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn with_owner(mut self, owner: Address) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_rate_limit(mut self, max_swaps: u64, window_secs: u64) -> Self {
        self.max_swaps = max_swaps;
        self.window_secs = window_secs;
        self
    }

    pub fn hash_function(&self) -> HashFunction {
        self.commitments.hash_function()
    }

    /// Credit an account
    pub async fn fund(&self, account: &Address, amount: u128) {
        let mut state = self.state.lock().await;
        let balance = state.balances.entry(account.clone()).or_default();
        *balance = balance.saturating_add(amount);
    }

    /// Simulate the signer pointing at another chain
    pub fn select_chain(&self, chain_id: u64) {
        self.selected_chain.store(chain_id, Ordering::SeqCst);
    }

    /// Make the next `count` mutating calls fail before touching state
    pub fn inject_transient_failures(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Options passed to the most recent mutating calls, including failed ones
    pub async fn submissions(&self) -> Vec<TxOptions> {
        self.state.lock().await.submissions.iter().cloned().collect()
    }

    fn reject(&self, reason: RejectionReason, message: &str) -> SwapError {
        SwapError::rejected(&self.network, reason, message)
    }

    fn check_network(&self) -> SwapResult<()> {
        let selected = self.selected_chain.load(Ordering::SeqCst);
        if selected != self.chain_id {
            return Err(SwapError::NetworkMismatch {
                network: self.network.clone(),
                expected: self.chain_id,
                actual: selected,
            });
        }
        Ok(())
    }

    fn take_transient_failure(&self) -> SwapResult<()> {
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(SwapError::TransientRpc {
                network: self.network.clone(),
                message: "gas estimation failed: replacement transaction underpriced".to_string(),
            });
        }
        Ok(())
    }

    fn rate_status(&self, entry: RateEntry) -> RateLimitStatus {
        RateLimitStatus {
            swap_count: entry.count,
            last_swap_time: entry.last,
            max_swaps: self.max_swaps,
            window_secs: self.window_secs,
        }
    }

    fn contract_id(&self, caller: &Address, participant: &Address, lock: &HashLock, timelock: u64, nonce: u64) -> ContractId {
        let mut hasher = Keccak256::new();
        hasher.update(self.chain_id.to_be_bytes());
        hasher.update(caller.as_str().as_bytes());
        hasher.update(participant.as_str().as_bytes());
        hasher.update(lock.as_bytes());
        hasher.update(timelock.to_be_bytes());
        hasher.update(nonce.to_be_bytes());
        ContractId(hasher.finalize().into())
    }
}

#[async_trait]
impl LedgerContract for MemoryLedger {
    async fn chain_id(&self) -> SwapResult<u64> {
        Ok(self.selected_chain.load(Ordering::SeqCst))
    }

    async fn switch_network(&self, chain_id: u64) -> SwapResult<()> {
        debug!("Network {}: signer switched to chain {}", self.network, chain_id);
        self.selected_chain.store(chain_id, Ordering::SeqCst);
        Ok(())
    }

    async fn balance(&self, account: Address) -> SwapResult<u128> {
        Ok(self.state.lock().await.balances.get(&account).copied().unwrap_or(0))
    }

    async fn create(
        &self,
        caller: Address,
        participant: Address,
        hash_lock: HashLock,
        timelock: u64,
        amount: u128,
        options: TxOptions,
    ) -> SwapResult<CreateReceipt> {
        let mut state = self.state.lock().await;
        state.record_submission(options);
        self.check_network()?;
        self.take_transient_failure()?;

        let now = self.clock.now();

        if state.emergency_stop {
            return Err(self.reject(RejectionReason::EmergencyStop, "Contract is in emergency stop mode"));
        }
        if amount == 0 {
            return Err(self.reject(RejectionReason::InvalidAmount, "Amount must be greater than 0"));
        }
        if participant.is_empty() {
            return Err(self.reject(RejectionReason::SelfParticipant, "Invalid participant address"));
        }
        if participant == caller {
            return Err(self.reject(RejectionReason::SelfParticipant, "Cannot swap with yourself"));
        }
        if timelock <= now + self.min_timelock_secs || timelock > now + self.max_timelock_secs {
            return Err(self.reject(RejectionReason::TimelockOutOfBounds, "Invalid timelock"));
        }
        let duplicate = state.contracts.values().any(|c| {
            c.initiator == caller && c.hash_lock == hash_lock && c.state == ContractState::Initiated
        });
        if duplicate {
            return Err(self.reject(RejectionReason::DuplicateContract, "Contract already exists"));
        }
        let entry = state.rate.get(&caller).copied().unwrap_or_default();
        if self.rate_status(entry).exceeded(now) {
            return Err(self.reject(RejectionReason::RateLimited, "Rate limit exceeded"));
        }
        let balance = state.balances.get(&caller).copied().unwrap_or(0);
        if balance < amount {
            return Err(self.reject(RejectionReason::InsufficientFunds, "insufficient funds"));
        }

        // All checks passed; apply
        let tx = state.next_tx(self.chain_id);
        let contract_id = self.contract_id(&caller, &participant, &hash_lock, timelock, state.nonce);
        state.balances.insert(caller.clone(), balance - amount);

        let window_expired = self.rate_status(entry).window_expired(now);
        state.rate.insert(
            caller.clone(),
            RateEntry {
                count: if window_expired { 1 } else { entry.count + 1 },
                last: now,
            },
        );

        let contract = SwapContract {
            contract_id,
            initiator: caller.clone(),
            participant: participant.clone(),
            hash_lock,
            timelock,
            amount,
            state: ContractState::Initiated,
            created_at: now,
        };
        state.contracts.insert(contract_id, contract);
        state.emit(LedgerEvent::SwapInitiated {
            network: self.network.clone(),
            contract_id,
            initiator: caller,
            participant,
            hash_lock,
            timelock,
            amount,
            created_at: now,
            tx: tx.clone(),
        });

        debug!("Network {}: contract {} initiated", self.network, contract_id);
        Ok(CreateReceipt {
            contract_id,
            tx: Some(tx),
        })
    }

    async fn withdraw(
        &self,
        caller: Address,
        contract_id: ContractId,
        secret: Secret,
        options: TxOptions,
    ) -> SwapResult<TxRef> {
        let mut state = self.state.lock().await;
        state.record_submission(options);
        self.check_network()?;
        self.take_transient_failure()?;

        let contract = state
            .contracts
            .get(&contract_id)
            .cloned()
            .ok_or_else(|| SwapError::not_found("contract", contract_id.to_hex()))?;

        if !contract.state.can_transition(ContractState::Withdrawn) {
            return Err(self.reject(RejectionReason::InvalidState, "Contract not initiated"));
        }
        if !self.commitments.verify(&secret, &contract.hash_lock) {
            return Err(self.reject(RejectionReason::HashMismatch, "Invalid secret"));
        }
        if caller != contract.participant {
            return Err(self.reject(RejectionReason::NotParticipant, "Only participant can withdraw"));
        }

        let now = self.clock.now();
        let tx = state.next_tx(self.chain_id);
        if let Some(c) = state.contracts.get_mut(&contract_id) {
            c.state = ContractState::Withdrawn;
        }
        let balance = state.balances.entry(contract.participant.clone()).or_default();
        *balance = balance.saturating_add(contract.amount);
        state.secrets.insert(contract_id, secret.clone());
        state.emit(LedgerEvent::SwapWithdrawn {
            network: self.network.clone(),
            contract_id,
            secret,
            withdrawn_at: now,
            tx: tx.clone(),
        });

        debug!("Network {}: contract {} withdrawn", self.network, contract_id);
        Ok(tx)
    }

    async fn refund(
        &self,
        caller: Address,
        contract_id: ContractId,
        options: TxOptions,
    ) -> SwapResult<TxRef> {
        let mut state = self.state.lock().await;
        state.record_submission(options);
        self.check_network()?;
        self.take_transient_failure()?;

        let contract = state
            .contracts
            .get(&contract_id)
            .cloned()
            .ok_or_else(|| SwapError::not_found("contract", contract_id.to_hex()))?;

        let now = self.clock.now();
        if !contract.state.can_transition(ContractState::Refunded) {
            return Err(self.reject(RejectionReason::InvalidState, "Contract not initiated"));
        }
        if now < contract.timelock {
            return Err(self.reject(RejectionReason::TimelockNotExpired, "Timelock not expired"));
        }
        if caller != contract.initiator {
            return Err(self.reject(RejectionReason::NotInitiator, "Only initiator can refund"));
        }

        let tx = state.next_tx(self.chain_id);
        if let Some(c) = state.contracts.get_mut(&contract_id) {
            c.state = ContractState::Refunded;
        }
        let balance = state.balances.entry(contract.initiator.clone()).or_default();
        *balance = balance.saturating_add(contract.amount);
        state.emit(LedgerEvent::SwapRefunded {
            network: self.network.clone(),
            contract_id,
            refunded_at: now,
            tx: tx.clone(),
        });

        debug!("Network {}: contract {} refunded", self.network, contract_id);
        Ok(tx)
    }

    async fn get_contract(&self, contract_id: ContractId) -> SwapResult<Option<SwapContract>> {
        Ok(self.state.lock().await.contracts.get(&contract_id).cloned())
    }

    async fn find_active(
        &self,
        creator: Address,
        hash_lock: HashLock,
    ) -> SwapResult<Option<SwapContract>> {
        let state = self.state.lock().await;
        Ok(state
            .contracts
            .values()
            .find(|c| {
                c.initiator == creator
                    && c.hash_lock == hash_lock
                    && c.state == ContractState::Initiated
            })
            .cloned())
    }

    async fn emergency_stopped(&self) -> SwapResult<bool> {
        Ok(self.state.lock().await.emergency_stop)
    }

    async fn toggle_emergency_stop(&self, caller: Address, options: TxOptions) -> SwapResult<bool> {
        let mut state = self.state.lock().await;
        state.record_submission(options);
        self.check_network()?;

        if self.owner.as_ref() != Some(&caller) {
            return Err(self.reject(RejectionReason::Reverted, "Only owner can call this function"));
        }

        state.emergency_stop = !state.emergency_stop;
        let stopped = state.emergency_stop;
        let tx = state.next_tx(self.chain_id);
        state.emit(LedgerEvent::EmergencyStopToggled {
            network: self.network.clone(),
            stopped,
            tx,
        });
        Ok(stopped)
    }

    async fn rate_limit(&self, account: Address) -> SwapResult<RateLimitStatus> {
        let state = self.state.lock().await;
        let entry = state.rate.get(&account).copied().unwrap_or_default();
        Ok(self.rate_status(entry))
    }

    async fn revealed_secret(&self, contract_id: ContractId) -> SwapResult<Option<Secret>> {
        Ok(self.state.lock().await.secrets.get(&contract_id).cloned())
    }

    async fn poll_events(&self, cursor: u64) -> SwapResult<EventBatch> {
        let state = self.state.lock().await;
        let end = state.first_event + state.events.len() as u64;
        if cursor < state.first_event {
            warn!(
                "Network {}: cursor {} is behind retained history, resuming at {}",
                self.network, cursor, state.first_event
            );
        }
        let start = cursor.clamp(state.first_event, end) - state.first_event;
        Ok(EventBatch {
            events: state.events.iter().skip(start as usize).cloned().collect(),
            next_cursor: end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const NOW: u64 = 1_700_000_000;

    fn ledger() -> (MemoryLedger, Commitments) {
        let commitments = Commitments::new(HashFunction::Keccak256);
        let clock = Arc::new(ManualClock::new(NOW));
        (MemoryLedger::new("fuji", 43113, commitments, clock), commitments)
    }

    #[tokio::test]
    async fn test_rejected_create_leaves_balance() {
        let (ledger, commitments) = ledger();
        let alice = Address::new("0xa11ce");
        ledger.fund(&alice, 100).await;
        let (_, lock) = commitments.generate();

        let err = ledger
            .create(alice.clone(), alice.clone(), lock, NOW + 3600, 50, TxOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.rejection_reason(), Some(RejectionReason::SelfParticipant));
        assert_eq!(ledger.balance(alice).await.unwrap(), 100);
        assert!(ledger.poll_events(0).await.unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn test_network_mismatch_before_any_check() {
        let (ledger, commitments) = ledger();
        ledger.select_chain(11155111);
        let (_, lock) = commitments.generate();

        let err = ledger
            .create(Address::new("0xa"), Address::new("0xb"), lock, NOW + 3600, 1, TxOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::NetworkMismatch { expected: 43113, actual: 11155111, .. }));
    }

    #[tokio::test]
    async fn test_emergency_stop_owner_only() {
        let (ledger, _) = ledger();
        let owner = Address::new("0x0wner");
        let ledger = ledger.with_owner(owner.clone());

        assert!(ledger
            .toggle_emergency_stop(Address::new("0xbad"), TxOptions::default())
            .await
            .is_err());
        assert!(ledger.toggle_emergency_stop(owner, TxOptions::default()).await.unwrap());
        assert!(ledger.emergency_stopped().await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failure_does_not_mutate() {
        let (ledger, commitments) = ledger();
        let alice = Address::new("0xa");
        ledger.fund(&alice, 10).await;
        ledger.inject_transient_failures(1);
        let (_, lock) = commitments.generate();

        let first = ledger
            .create(alice.clone(), Address::new("0xb"), lock, NOW + 3600, 10, TxOptions::default())
            .await;
        assert!(first.unwrap_err().is_retryable());
        assert_eq!(ledger.balance(alice.clone()).await.unwrap(), 10);

        let second = ledger
            .create(alice.clone(), Address::new("0xb"), lock, NOW + 3600, 10, TxOptions::default())
            .await;
        assert!(second.is_ok());
        assert_eq!(ledger.balance(alice).await.unwrap(), 0);
    }

    fn network_section(hash_line: &str) -> NetworkConfig {
        let raw = format!(
            r#"
chain_id = 43113
name = "Avalanche Fuji Testnet"
currency = "AVAX"
kind = "memory"
confirmation_blocks = 1
block_time_secs = 2
initiator_window_secs = 10800
participant_window_secs = 3600
min_timelock_secs = 1800
max_timelock_secs = 172800
max_swaps_per_window = 10
rate_limit_window_secs = 86400
enabled = true
{}
"#,
            hash_line
        );
        toml::from_str(&raw).unwrap()
    }

    #[test]
    fn test_from_config_inherits_protocol_hash() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));

        let undeclared = network_section("");
        let ledger =
            MemoryLedger::from_config("fuji", &undeclared, HashFunction::Sha256, clock.clone()).unwrap();
        assert_eq!(ledger.hash_function(), HashFunction::Sha256);

        let declared = network_section(r#"hash_function = "keccak256""#);
        let ledger =
            MemoryLedger::from_config("fuji", &declared, HashFunction::Sha256, clock).unwrap();
        assert_eq!(ledger.hash_function(), HashFunction::Keccak256);
    }

    #[tokio::test]
    async fn test_sha256_ledger_accepts_sha256_secret() {
        let commitments = Commitments::new(HashFunction::Sha256);
        let clock = Arc::new(ManualClock::new(NOW));
        let ledger = MemoryLedger::new("fuji", 43113, commitments, clock);
        let (alice, bob) = (Address::new("0xa"), Address::new("0xb"));
        ledger.fund(&alice, 10).await;

        let (secret, lock) = commitments.generate();
        let receipt = ledger
            .create(alice, bob.clone(), lock, NOW + 3600, 10, TxOptions::default())
            .await
            .unwrap();
        ledger
            .withdraw(bob.clone(), receipt.contract_id, secret, TxOptions::default())
            .await
            .unwrap();
        assert_eq!(ledger.balance(bob).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_submission_history_is_bounded() {
        let (ledger, _) = ledger();
        let missing = ContractId([7u8; 32]);

        for _ in 0..SUBMISSION_HISTORY + 10 {
            let _ = ledger
                .refund(Address::new("0xa"), missing, TxOptions::default())
                .await;
        }
        assert_eq!(ledger.submissions().await.len(), SUBMISSION_HISTORY);
    }

    #[tokio::test]
    async fn test_event_history_keeps_cursors_monotonic() {
        let (ledger, _) = ledger();
        let owner = Address::new("0x0wner");
        let ledger = ledger.with_owner(owner.clone());

        for _ in 0..EVENT_HISTORY + 3 {
            ledger.toggle_emergency_stop(owner.clone(), TxOptions::default()).await.unwrap();
        }

        let all = ledger.poll_events(0).await.unwrap();
        assert_eq!(all.events.len(), EVENT_HISTORY);
        assert_eq!(all.next_cursor, (EVENT_HISTORY + 3) as u64);

        let tail = ledger.poll_events(all.next_cursor - 1).await.unwrap();
        assert_eq!(tail.events.len(), 1);
        assert_eq!(tail.next_cursor, all.next_cursor);
        assert!(ledger.poll_events(all.next_cursor + 5).await.unwrap().events.is_empty());
    }
}
