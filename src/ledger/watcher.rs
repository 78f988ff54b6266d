//! Secret reveal observation
//!
//! A watch resolves when the watched contract is withdrawn (the secret is read
//! from the withdrawal record) or becomes moot when it is refunded. Watches
//! combine the event stream with polling under exponential backoff, can be
//! cancelled at any time, and re-watching an already extracted secret returns
//! the cached value without touching the ledger.

use super::backoff::ExponentialBackoff;
use super::{ContractState, HtlcController};
use crate::error::{SwapError, SwapResult};
use crate::events::LedgerEvent;
use crate::secret::{HashLock, Secret};
use crate::types::ContractId;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a watch ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Contract was withdrawn; its secret is now public
    Revealed(Secret),
    /// Contract left INITIATED without a reveal
    Moot(ContractState),
    Cancelled,
}

/// Handle to a running watch
pub struct WatchHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<SwapResult<WatchOutcome>>,
}

impl WatchHandle {
    /// Stop watching; the task resolves to `Cancelled`
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub async fn wait(self) -> SwapResult<WatchOutcome> {
        self.task
            .await
            .map_err(|e| SwapError::Internal(format!("secret watch task failed: {}", e)))?
    }
}

/// Watches HTLCs for secret reveals across networks
#[derive(Clone)]
pub struct SecretWatcher {
    events: broadcast::Sender<LedgerEvent>,
    /// Secrets already extracted, by network and contract
    revealed: Arc<DashMap<(String, ContractId), Secret>>,
    poll_interval_ms: u64,
    max_poll_interval_ms: u64,
}

impl SecretWatcher {
    pub fn new(events: broadcast::Sender<LedgerEvent>, poll_interval_ms: u64) -> Self {
        Self {
            events,
            revealed: Arc::new(DashMap::new()),
            poll_interval_ms,
            max_poll_interval_ms: poll_interval_ms.saturating_mul(16).max(1_000),
        }
    }

    /// Secret extracted earlier for this contract, if any
    pub fn cached(&self, network: &str, contract_id: ContractId) -> Option<Secret> {
        self.revealed
            .get(&(network.to_string(), contract_id))
            .map(|s| s.clone())
    }

    /// Drop a cached secret once nothing will ask for it again
    pub fn forget(&self, network: &str, contract_id: ContractId) {
        if self.revealed.remove(&(network.to_string(), contract_id)).is_some() {
            debug!("Dropped cached secret for {} on {}", contract_id, network);
        }
    }

    /// Single non-blocking check against the ledger
    pub async fn check(
        &self,
        controller: &HtlcController,
        contract_id: ContractId,
    ) -> SwapResult<Option<WatchOutcome>> {
        if let Some(secret) = self.cached(controller.network(), contract_id) {
            return Ok(Some(WatchOutcome::Revealed(secret)));
        }

        let contract = controller.require_contract(contract_id).await?;
        match contract.state {
            ContractState::Withdrawn => match controller.revealed_secret(contract_id).await? {
                Some(secret) => {
                    self.record(controller, contract_id, &contract.hash_lock, secret)
                        .map(|s| Some(WatchOutcome::Revealed(s)))
                }
                None => Ok(None),
            },
            ContractState::Refunded => Ok(Some(WatchOutcome::Moot(ContractState::Refunded))),
            _ => Ok(None),
        }
    }

    /// Start watching a contract until reveal, refund or cancellation
    pub fn watch(&self, controller: Arc<HtlcController>, contract_id: ContractId) -> WatchHandle {
        let (cancel, mut cancel_rx) = watch::channel(false);
        let mut events = self.events.subscribe();
        let watcher = self.clone();

        let task = tokio::spawn(async move {
            let network = controller.network().to_string();
            let mut backoff = ExponentialBackoff::new(watcher.poll_interval_ms, watcher.max_poll_interval_ms);
            let mut events_open = true;
            let mut hash_lock: Option<HashLock> = None;

            debug!("Watching {} on {} for secret reveal", contract_id, network);

            loop {
                if *cancel_rx.borrow() {
                    return Ok(WatchOutcome::Cancelled);
                }

                let wait = match watcher.check(&controller, contract_id).await {
                    Ok(Some(outcome)) => return Ok(outcome),
                    Ok(None) => {
                        if hash_lock.is_none() {
                            hash_lock = controller
                                .get_contract(contract_id)
                                .await
                                .ok()
                                .flatten()
                                .map(|c| c.hash_lock);
                        }
                        backoff.on_success();
                        backoff.interval()
                    }
                    Err(e) if e.is_retryable() => backoff.on_failure(&e.to_string()),
                    Err(e) => return Err(e),
                };

                tokio::select! {
                    changed = cancel_rx.changed() => {
                        // Sender dropped counts as cancellation too
                        if changed.is_err() || *cancel_rx.borrow() {
                            return Ok(WatchOutcome::Cancelled);
                        }
                    }
                    received = events.recv(), if events_open => match received {
                        Ok(LedgerEvent::SwapWithdrawn { network: n, contract_id: id, secret, .. })
                            if n == network && id == contract_id =>
                        {
                            if let Some(lock) = hash_lock {
                                if let Ok(secret) = watcher.record(&controller, contract_id, &lock, secret) {
                                    return Ok(WatchOutcome::Revealed(secret));
                                }
                            }
                        }
                        Ok(LedgerEvent::SwapRefunded { network: n, contract_id: id, .. })
                            if n == network && id == contract_id =>
                        {
                            return Ok(WatchOutcome::Moot(ContractState::Refunded));
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Secret watch lagged by {} events, polling instead", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            events_open = false;
                        }
                    },
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        });

        WatchHandle { cancel, task }
    }

    /// Verify and cache a revealed secret; the first extraction is logged once
    fn record(
        &self,
        controller: &HtlcController,
        contract_id: ContractId,
        hash_lock: &HashLock,
        secret: Secret,
    ) -> SwapResult<Secret> {
        if !controller.commitments().verify(&secret, hash_lock) {
            return Err(SwapError::Internal(format!(
                "revealed secret for {} does not match its hash lock",
                contract_id
            )));
        }

        let key = (controller.network().to_string(), contract_id);
        if self.revealed.insert(key, secret.clone()).is_none() {
            info!("Secret revealed on {} by contract {}", controller.network(), contract_id);
            crate::metrics::record_secret_revealed(controller.network());
        }
        Ok(secret)
    }
}
