//! Ledger module - HTLC contracts on each configured network
//!
//! This module provides:
//! - The [`LedgerContract`] boundary every HTLC back-end implements
//! - An EVM adapter and an in-memory reference ledger
//! - Per-network lifecycle controllers with pre-flight checks and bounded retries
//! - Event listeners and cancellable secret watches

pub mod backoff;
pub mod controller;
pub mod evm;
pub mod fees;
pub mod listener;
pub mod memory;
pub mod watcher;

pub use backoff::ExponentialBackoff;
pub use controller::{BatchRefundOutcome, HtlcController};
pub use evm::EvmLedger;
pub use fees::GasPolicy;
pub use listener::LedgerListener;
pub use memory::MemoryLedger;
pub use watcher::{SecretWatcher, WatchHandle, WatchOutcome};

use crate::clock::Clock;
use crate::config::{LedgerKind, Settings};
use crate::error::{SwapError, SwapResult};
use crate::events::{EventBatch, LedgerEvent};
use crate::secret::{Commitments, HashLock, Secret};
use crate::store::MatchingStore;
use crate::types::{Address, ContractId, TxRef};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};

/// On-ledger lifecycle state of one HTLC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContractState {
    Empty,
    Initiated,
    Withdrawn,
    Refunded,
}

impl ContractState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContractState::Withdrawn | ContractState::Refunded)
    }

    /// Check whether the contract may move from `self` to `next`
    pub fn can_transition(&self, next: ContractState) -> bool {
        matches!(
            (self, next),
            (ContractState::Empty, ContractState::Initiated)
                | (ContractState::Initiated, ContractState::Withdrawn)
                | (ContractState::Initiated, ContractState::Refunded)
        )
    }

    /// Decode the contract's numeric state.
    ///
    /// The deployed enum is `EMPTY, INITIATED, PARTICIPATED, WITHDRAWN, REFUNDED`.
    /// The HTLC never writes `PARTICIPATED` (2), so seeing it means the address
    /// points at a different contract.
    pub fn from_code(code: u8) -> SwapResult<Self> {
        match code {
            0 => Ok(ContractState::Empty),
            1 => Ok(ContractState::Initiated),
            3 => Ok(ContractState::Withdrawn),
            4 => Ok(ContractState::Refunded),
            2 => Err(SwapError::Internal(
                "contract reports PARTICIPATED (2), which this HTLC never sets".to_string(),
            )),
            other => Err(SwapError::Internal(format!(
                "unknown contract state code {}",
                other
            ))),
        }
    }
}

/// Mirrored view of an HTLC on one ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapContract {
    pub contract_id: ContractId,
    pub initiator: Address,
    pub participant: Address,
    pub hash_lock: HashLock,
    pub timelock: u64,
    #[serde(with = "crate::types::u128_string")]
    pub amount: u128,
    pub state: ContractState,
    pub created_at: u64,
}

/// Contract state with time remaining until refund opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractStatus {
    pub state: ContractState,
    pub time_remaining: u64,
    pub is_expired: bool,
}

impl ContractStatus {
    pub fn of(contract: &SwapContract, now: u64) -> Self {
        Self {
            state: contract.state,
            time_remaining: contract.timelock.saturating_sub(now),
            is_expired: now >= contract.timelock,
        }
    }
}

/// Rolling-window creation counter for one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub swap_count: u64,
    pub last_swap_time: u64,
    pub max_swaps: u64,
    pub window_secs: u64,
}

impl RateLimitStatus {
    /// The counter resets once the window after the last swap has passed
    pub fn window_expired(&self, now: u64) -> bool {
        now > self.last_swap_time.saturating_add(self.window_secs)
    }

    pub fn effective_count(&self, now: u64) -> u64 {
        if self.window_expired(now) {
            0
        } else {
            self.swap_count
        }
    }

    pub fn exceeded(&self, now: u64) -> bool {
        self.effective_count(now) >= self.max_swaps
    }

    /// Seconds until another creation is accepted, if currently limited
    pub fn retry_after(&self, now: u64) -> Option<u64> {
        if !self.exceeded(now) {
            return None;
        }
        Some(
            self.last_swap_time
                .saturating_add(self.window_secs)
                .saturating_add(1)
                .saturating_sub(now),
        )
    }
}

/// Per-submission parameters chosen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    /// Percentage added on top of the fee estimate
    pub gas_margin_percent: u64,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            gas_margin_percent: 20,
        }
    }
}

/// Result of a successful `create`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReceipt {
    pub contract_id: ContractId,
    /// Absent when an earlier broadcast was resolved instead of re-sent
    pub tx: Option<TxRef>,
}

/// A deployed HTLC contract on one ledger
///
/// Implementations report failures as typed [`SwapError`]s and never leave a
/// contract partially mutated. `chain_id` is the chain the signer currently
/// targets, which may differ from the contract's chain until
/// `switch_network` is called.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerContract: Send + Sync {
    async fn chain_id(&self) -> SwapResult<u64>;

    async fn switch_network(&self, chain_id: u64) -> SwapResult<()>;

    async fn balance(&self, account: Address) -> SwapResult<u128>;

    async fn create(
        &self,
        caller: Address,
        participant: Address,
        hash_lock: HashLock,
        timelock: u64,
        amount: u128,
        options: TxOptions,
    ) -> SwapResult<CreateReceipt>;

    async fn withdraw(
        &self,
        caller: Address,
        contract_id: ContractId,
        secret: Secret,
        options: TxOptions,
    ) -> SwapResult<TxRef>;

    async fn refund(
        &self,
        caller: Address,
        contract_id: ContractId,
        options: TxOptions,
    ) -> SwapResult<TxRef>;

    async fn get_contract(&self, contract_id: ContractId) -> SwapResult<Option<SwapContract>>;

    /// Active (INITIATED) contract created by `creator` under `hash_lock`
    async fn find_active(
        &self,
        creator: Address,
        hash_lock: HashLock,
    ) -> SwapResult<Option<SwapContract>>;

    async fn emergency_stopped(&self) -> SwapResult<bool>;

    /// Flip the emergency stop; owner only. Returns the new flag.
    async fn toggle_emergency_stop(&self, caller: Address, options: TxOptions)
        -> SwapResult<bool>;

    async fn rate_limit(&self, account: Address) -> SwapResult<RateLimitStatus>;

    /// Secret published by a withdrawal of this contract, if any
    async fn revealed_secret(&self, contract_id: ContractId) -> SwapResult<Option<Secret>>;

    async fn poll_events(&self, cursor: u64) -> SwapResult<EventBatch>;
}

/// Manages the HTLC controllers and listeners of all configured networks
pub struct LedgerManager {
    /// Controllers indexed by network key
    controllers: DashMap<String, Arc<HtlcController>>,
    /// Listeners indexed by network key
    listeners: DashMap<String, Arc<LedgerListener>>,
    /// Event broadcast channel
    event_tx: broadcast::Sender<LedgerEvent>,
    /// Shutdown signal
    shutdown: Arc<RwLock<bool>>,
}

impl LedgerManager {
    /// Connect to every enabled network
    pub async fn new(
        settings: &Settings,
        store: Arc<dyn MatchingStore>,
        clock: Arc<dyn Clock>,
    ) -> SwapResult<Self> {
        let mut ledgers: Vec<(String, Arc<dyn LedgerContract>)> = Vec::new();

        for (name, network) in settings.enabled_networks() {
            info!(
                "Initializing network {} (chain ID: {}, {:?} ledger)",
                network.name, network.chain_id, network.kind
            );

            let ledger: Arc<dyn LedgerContract> = match network.kind {
                LedgerKind::Evm => {
                    let key_env = settings
                        .wallet
                        .as_ref()
                        .and_then(|w| w.private_key_env.clone())
                        .unwrap_or_else(|| "HTLC_SIGNER_KEY".to_string());
                    Arc::new(EvmLedger::connect(name, network, &key_env).await?)
                }
                LedgerKind::Memory => {
                    let ledger = MemoryLedger::from_config(
                        name,
                        network,
                        settings.protocol.hash_function,
                        clock.clone(),
                    )?;
                    for (account, amount) in &network.prefunded {
                        let units = crate::types::to_base_units(*amount, network.decimals)?;
                        ledger.fund(&Address::new(account), units).await;
                    }
                    Arc::new(ledger)
                }
            };

            ledgers.push((name.clone(), ledger));
        }

        Self::from_ledgers(settings, ledgers, store, clock).await
    }

    /// Build from already-constructed ledgers
    pub async fn from_ledgers(
        settings: &Settings,
        ledgers: Vec<(String, Arc<dyn LedgerContract>)>,
        store: Arc<dyn MatchingStore>,
        clock: Arc<dyn Clock>,
    ) -> SwapResult<Self> {
        let (event_tx, _) = broadcast::channel(10000);
        let controllers = DashMap::new();
        let listeners = DashMap::new();
        let commitments = Commitments::new(settings.protocol.hash_function);

        for (name, ledger) in ledgers {
            let network = settings
                .network(&name)
                .ok_or_else(|| SwapError::Config(format!("network {} is not enabled", name)))?;

            let controller = HtlcController::new(
                &name,
                network.clone(),
                &settings.coordinator,
                ledger.clone(),
                commitments,
                clock.clone(),
            );
            controllers.insert(name.clone(), Arc::new(controller));

            let listener = LedgerListener::new(
                &name,
                ledger,
                event_tx.clone(),
                store.clone(),
                settings.coordinator.poll_interval_ms,
            )
            .await?;
            listeners.insert(name.clone(), Arc::new(listener));

            info!("Network {} initialized successfully", name);
        }

        Ok(Self {
            controllers,
            listeners,
            event_tx,
            shutdown: Arc::new(RwLock::new(false)),
        })
    }

    /// Start all ledger listeners
    pub async fn start_listeners(&self) -> SwapResult<()> {
        let mut handles = Vec::new();

        for entry in self.listeners.iter() {
            let listener = entry.value().clone();
            let shutdown = self.shutdown.clone();

            let handle = tokio::spawn(async move {
                if let Err(e) = listener.listen(shutdown).await {
                    error!("Listener error for network {}: {}", listener.network(), e);
                }
            });

            handles.push(handle);
        }

        futures::future::join_all(handles).await;
        Ok(())
    }

    /// Subscribe to ledger events from all networks
    pub fn subscribe_events(&self) -> broadcast::Receiver<LedgerEvent> {
        self.event_tx.subscribe()
    }

    /// Watcher for secret reveals fed by this manager's event stream
    pub fn secret_watcher(&self, poll_interval_ms: u64) -> SecretWatcher {
        SecretWatcher::new(self.event_tx.clone(), poll_interval_ms)
    }

    /// Get the controller for a network
    pub fn controller(&self, network: &str) -> SwapResult<Arc<HtlcController>> {
        self.controllers
            .get(network)
            .map(|c| c.clone())
            .ok_or_else(|| SwapError::Validation(format!("unknown network: {}", network)))
    }

    /// Get the listener for a network
    pub fn listener(&self, network: &str) -> SwapResult<Arc<LedgerListener>> {
        self.listeners
            .get(network)
            .map(|l| l.clone())
            .ok_or_else(|| SwapError::Validation(format!("unknown network: {}", network)))
    }

    /// Health check for all networks
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let mut results = Vec::new();

        for entry in self.controllers.iter() {
            let network = entry.key().clone();
            let healthy = entry.value().health_check().await;
            crate::metrics::record_network_health(&network, healthy);
            results.push((network, healthy));
        }

        results
    }

    /// Get all connected network keys
    pub fn connected_networks(&self) -> Vec<String> {
        self.controllers.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop all ledger listeners
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Ledger manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(count: u64, last: u64) -> RateLimitStatus {
        RateLimitStatus {
            swap_count: count,
            last_swap_time: last,
            max_swaps: 3,
            window_secs: 100,
        }
    }

    #[test]
    fn test_rate_limit_window() {
        let limited = status(3, 1_000);
        assert!(limited.exceeded(1_050));
        assert_eq!(limited.retry_after(1_050), Some(51));

        // Exactly at the window edge the counter still applies
        assert!(limited.exceeded(1_100));
        assert!(!limited.exceeded(1_101));
        assert_eq!(limited.effective_count(1_101), 0);

        assert!(!status(2, 1_000).exceeded(1_050));
        assert_eq!(status(2, 1_000).retry_after(1_050), None);
    }

    #[test]
    fn test_state_transitions() {
        use ContractState::*;
        assert!(Empty.can_transition(Initiated));
        assert!(Initiated.can_transition(Withdrawn));
        assert!(Initiated.can_transition(Refunded));
        assert!(!Withdrawn.can_transition(Refunded));
        assert!(!Refunded.can_transition(Initiated));
        assert!(Withdrawn.is_terminal() && Refunded.is_terminal());
    }

    #[test]
    fn test_state_codes_match_deployed_enum() {
        assert_eq!(ContractState::from_code(0).unwrap(), ContractState::Empty);
        assert_eq!(ContractState::from_code(1).unwrap(), ContractState::Initiated);
        assert_eq!(ContractState::from_code(3).unwrap(), ContractState::Withdrawn);
        assert_eq!(ContractState::from_code(4).unwrap(), ContractState::Refunded);

        let err = ContractState::from_code(2).unwrap_err();
        assert!(err.to_string().contains("PARTICIPATED"));
        assert!(ContractState::from_code(5).is_err());
    }

    #[test]
    fn test_contract_status() {
        let contract = SwapContract {
            contract_id: ContractId([1u8; 32]),
            initiator: Address::new("0xa"),
            participant: Address::new("0xb"),
            hash_lock: HashLock([2u8; 32]),
            timelock: 5_000,
            amount: 10,
            state: ContractState::Initiated,
            created_at: 1_000,
        };
        let before = ContractStatus::of(&contract, 4_000);
        assert_eq!(before.time_remaining, 1_000);
        assert!(!before.is_expired);

        let after = ContractStatus::of(&contract, 5_000);
        assert_eq!(after.time_remaining, 0);
        assert!(after.is_expired);
    }
}
