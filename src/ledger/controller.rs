//! HTLC lifecycle controller with pre-flight checks, timeouts and bounded retries

use super::backoff::ExponentialBackoff;
use super::fees::{GasPolicy, HtlcOp};
use super::{ContractState, ContractStatus, CreateReceipt, LedgerContract, RateLimitStatus, SwapContract, TxOptions};
use crate::clock::Clock;
use crate::config::{CoordinatorConfig, NetworkConfig};
use crate::error::{RejectionReason, SwapError, SwapResult};
use crate::secret::{Commitments, HashLock, Secret};
use crate::types::{Address, ContractId, TxRef};

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Per-id result of a batch refund
#[derive(Debug)]
pub struct BatchRefundOutcome {
    pub contract_id: ContractId,
    pub result: SwapResult<TxRef>,
}

/// Drives create/withdraw/refund against one network's HTLC contract
///
/// Common rejections are detected from read-only views before anything is
/// submitted. Submissions run under a per-call timeout; transient failures are
/// retried with exponential backoff and a higher gas margin, everything else
/// is surfaced unchanged.
pub struct HtlcController {
    network: String,
    config: NetworkConfig,
    ledger: Arc<dyn LedgerContract>,
    commitments: Commitments,
    clock: Arc<dyn Clock>,
    gas: GasPolicy,
    call_timeout: Duration,
    max_attempts: u32,
    retry_delay_ms: u64,
    max_retry_delay_ms: u64,
}

impl HtlcController {
    pub fn new(
        network: &str,
        config: NetworkConfig,
        coordinator: &CoordinatorConfig,
        ledger: Arc<dyn LedgerContract>,
        commitments: Commitments,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let gas = GasPolicy::from_network(&config);
        Self {
            network: network.to_string(),
            config,
            ledger,
            commitments,
            clock,
            gas,
            call_timeout: Duration::from_secs(coordinator.call_timeout_secs),
            max_attempts: coordinator.max_retries.max(1),
            retry_delay_ms: coordinator.retry_delay_ms,
            max_retry_delay_ms: coordinator.max_retry_delay_ms,
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn commitments(&self) -> Commitments {
        self.commitments
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Run one ledger call under the call timeout
    async fn call<T, Fut>(&self, operation: &str, fut: Fut) -> SwapResult<T>
    where
        Fut: Future<Output = SwapResult<T>>,
    {
        let started = Instant::now();
        let result = timeout(self.call_timeout, fut).await.map_err(|_| {
            warn!("Network {}: {} timed out after {:?}", self.network, operation, self.call_timeout);
            SwapError::Timeout {
                operation: format!("{} on {}", operation, self.network),
            }
        })?;
        crate::metrics::observe_ledger_latency(&self.network, operation, started.elapsed());
        result
    }

    /// Submit a mutating call, retrying transient failures with a larger margin
    async fn submit<T, F, Fut>(&self, op: HtlcOp, mut call: F) -> SwapResult<T>
    where
        F: FnMut(u32, TxOptions) -> Fut,
        Fut: Future<Output = SwapResult<T>>,
    {
        let mut backoff = ExponentialBackoff::new(self.retry_delay_ms, self.max_retry_delay_ms);

        loop {
            let attempt = backoff.attempts() + 1;
            let options = self.gas.options(attempt);
            debug!(
                "Network {}: submitting {} (attempt {}/{}, gas margin {}%)",
                self.network,
                op.as_str(),
                attempt,
                self.max_attempts,
                options.gas_margin_percent
            );

            match self.call(op.as_str(), call(attempt, options)).await {
                Ok(value) => {
                    backoff.on_success();
                    crate::metrics::record_htlc_op(&self.network, op.as_str(), "success");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && !backoff.should_give_up(self.max_attempts - 1) => {
                    crate::metrics::record_htlc_op(&self.network, op.as_str(), "retry");
                    let wait = backoff.on_failure(&e.to_string());
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    crate::metrics::record_htlc_op(&self.network, op.as_str(), e.category());
                    if let Some(reason) = e.rejection_reason() {
                        crate::metrics::record_rejection(&self.network, reason.as_str());
                    }
                    return Err(e);
                }
            }
        }
    }

    fn reject(&self, reason: RejectionReason, message: impl Into<String>) -> SwapError {
        let err = SwapError::rejected(&self.network, reason, message);
        crate::metrics::record_rejection(&self.network, reason.as_str());
        err
    }

    /// Fail with NetworkMismatch unless the signer targets this network
    pub async fn ensure_network(&self) -> SwapResult<()> {
        let selected = self.call("chain_id", self.ledger.chain_id()).await?;
        if selected != self.config.chain_id {
            warn!(
                "Network {}: signer targets chain {}, expected {}",
                self.network, selected, self.config.chain_id
            );
            return Err(SwapError::NetworkMismatch {
                network: self.network.clone(),
                expected: self.config.chain_id,
                actual: selected,
            });
        }
        Ok(())
    }

    /// Point the signer at this network
    pub async fn switch_network(&self) -> SwapResult<()> {
        self.call("switch_network", self.ledger.switch_network(self.config.chain_id))
            .await?;
        info!("Switched signer to {} (chain {})", self.network, self.config.chain_id);
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        self.call("chain_id", self.ledger.chain_id()).await.is_ok()
    }

    /// Lock `amount` for `participant` under `hash_lock` until `timelock`
    pub async fn create(
        &self,
        caller: &Address,
        participant: &Address,
        hash_lock: HashLock,
        timelock: u64,
        amount: u128,
    ) -> SwapResult<CreateReceipt> {
        self.preflight_create(caller, participant, &hash_lock, timelock, amount)
            .await?;

        let ledger = self.ledger.clone();
        let receipt = self
            .submit(HtlcOp::Create, |attempt, options| {
                let ledger = ledger.clone();
                let caller = caller.clone();
                let participant = participant.clone();
                async move {
                    match ledger
                        .create(caller.clone(), participant, hash_lock, timelock, amount, options)
                        .await
                    {
                        // An earlier attempt landed even though it reported failure
                        Err(e)
                            if attempt > 1
                                && e.rejection_reason() == Some(RejectionReason::DuplicateContract) =>
                        {
                            match ledger.find_active(caller, hash_lock).await? {
                                Some(existing) => Ok(CreateReceipt {
                                    contract_id: existing.contract_id,
                                    tx: None,
                                }),
                                None => Err(e),
                            }
                        }
                        other => other,
                    }
                }
            })
            .await?;

        info!(
            "Network {}: contract {} created by {} for {} (timelock {})",
            self.network, receipt.contract_id, caller, participant, timelock
        );
        Ok(receipt)
    }

    async fn preflight_create(
        &self,
        caller: &Address,
        participant: &Address,
        hash_lock: &HashLock,
        timelock: u64,
        amount: u128,
    ) -> SwapResult<()> {
        self.ensure_network().await?;

        if self.call("emergency_stop", self.ledger.emergency_stopped()).await? {
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

        let now = self.now();
        let earliest = now + self.config.min_timelock_secs;
        let latest = now + self.config.max_timelock_secs;
        if timelock <= earliest || timelock > latest {
            return Err(self.reject(
                RejectionReason::TimelockOutOfBounds,
                format!("Invalid timelock {}: must be in ({}, {}]", timelock, earliest, latest),
            ));
        }

        let limit = self.rate_limit(caller).await?;
        if let Some(wait) = limit.retry_after(now) {
            return Err(self.reject(
                RejectionReason::RateLimited,
                format!("Rate limit exceeded, retry in {}s", wait),
            ));
        }

        if let Some(existing) = self.find_active(caller, hash_lock).await? {
            return Err(self.reject(
                RejectionReason::DuplicateContract,
                format!("Contract already exists: {}", existing.contract_id),
            ));
        }

        let balance = self.balance(caller).await?;
        if balance < amount {
            return Err(self.reject(RejectionReason::InsufficientFunds, "insufficient funds"));
        }

        Ok(())
    }

    /// Claim a contract with its secret; publishes the secret on-ledger
    pub async fn withdraw(
        &self,
        caller: &Address,
        contract_id: ContractId,
        secret: &Secret,
    ) -> SwapResult<TxRef> {
        self.ensure_network().await?;

        let contract = self.require_contract(contract_id).await?;
        if contract.state != ContractState::Initiated {
            return Err(self.reject(RejectionReason::InvalidState, "Contract not initiated"));
        }
        if !self.commitments.verify(secret, &contract.hash_lock) {
            return Err(self.reject(RejectionReason::HashMismatch, "Invalid secret"));
        }
        if *caller != contract.participant {
            return Err(self.reject(RejectionReason::NotParticipant, "Only participant can withdraw"));
        }

        let tx = self
            .submit(HtlcOp::Withdraw, |_, options| {
                self.ledger
                    .withdraw(caller.clone(), contract_id, secret.clone(), options)
            })
            .await?;

        info!("Network {}: contract {} withdrawn by {}", self.network, contract_id, caller);
        Ok(tx)
    }

    /// Return an expired contract's funds to its creator
    pub async fn refund(&self, caller: &Address, contract_id: ContractId) -> SwapResult<TxRef> {
        self.ensure_network().await?;

        let contract = self.require_contract(contract_id).await?;
        if contract.state != ContractState::Initiated {
            return Err(self.reject(RejectionReason::InvalidState, "Contract not initiated"));
        }
        if self.now() < contract.timelock {
            return Err(self.reject(
                RejectionReason::TimelockNotExpired,
                format!("Timelock not expired: {}s remaining", contract.timelock - self.now()),
            ));
        }
        if *caller != contract.initiator {
            return Err(self.reject(RejectionReason::NotInitiator, "Only initiator can refund"));
        }

        let tx = self
            .submit(HtlcOp::Refund, |_, options| {
                self.ledger.refund(caller.clone(), contract_id, options)
            })
            .await?;

        info!("Network {}: contract {} refunded to {}", self.network, contract_id, caller);
        Ok(tx)
    }

    /// Refund each contract independently; one failure does not stop the rest
    pub async fn batch_refund(
        &self,
        caller: &Address,
        contract_ids: &[ContractId],
    ) -> Vec<BatchRefundOutcome> {
        let mut outcomes = Vec::with_capacity(contract_ids.len());
        for &contract_id in contract_ids {
            let result = self.refund(caller, contract_id).await;
            if let Err(e) = &result {
                debug!("Batch refund of {} skipped: {}", contract_id, e);
            }
            outcomes.push(BatchRefundOutcome {
                contract_id,
                result,
            });
        }
        outcomes
    }

    pub async fn toggle_emergency_stop(&self, caller: &Address) -> SwapResult<bool> {
        self.ensure_network().await?;
        let stopped = self
            .submit(HtlcOp::Admin, |_, options| {
                self.ledger.toggle_emergency_stop(caller.clone(), options)
            })
            .await?;
        warn!("Network {}: emergency stop is now {}", self.network, if stopped { "ON" } else { "OFF" });
        Ok(stopped)
    }

    pub async fn get_contract(&self, contract_id: ContractId) -> SwapResult<Option<SwapContract>> {
        self.call("get_contract", self.ledger.get_contract(contract_id)).await
    }

    pub async fn require_contract(&self, contract_id: ContractId) -> SwapResult<SwapContract> {
        self.get_contract(contract_id)
            .await?
            .filter(|c| c.state != ContractState::Empty)
            .ok_or_else(|| SwapError::not_found("contract", contract_id.to_hex()))
    }

    pub async fn contract_status(&self, contract_id: ContractId) -> SwapResult<ContractStatus> {
        let contract = self.require_contract(contract_id).await?;
        Ok(ContractStatus::of(&contract, self.now()))
    }

    pub async fn find_active(
        &self,
        creator: &Address,
        hash_lock: &HashLock,
    ) -> SwapResult<Option<SwapContract>> {
        self.call("find_active", self.ledger.find_active(creator.clone(), *hash_lock))
            .await
    }

    pub async fn emergency_stopped(&self) -> SwapResult<bool> {
        self.call("emergency_stop", self.ledger.emergency_stopped()).await
    }

    pub async fn rate_limit(&self, account: &Address) -> SwapResult<RateLimitStatus> {
        self.call("rate_limit", self.ledger.rate_limit(account.clone())).await
    }

    pub async fn balance(&self, account: &Address) -> SwapResult<u128> {
        self.call("balance", self.ledger.balance(account.clone())).await
    }

    pub async fn revealed_secret(&self, contract_id: ContractId) -> SwapResult<Option<Secret>> {
        self.call("revealed_secret", self.ledger.revealed_secret(contract_id))
            .await
    }
}
