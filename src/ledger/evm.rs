//! EVM adapter for the deployed HTLC contract
//!
//! Holds one signing client per configured RPC URL; the active client is the
//! one `switch_network` selected. Raw RPC and revert text is classified into
//! [`SwapError`] here and nowhere else.

use super::fees::HtlcOp;
use super::{ContractState, CreateReceipt, LedgerContract, RateLimitStatus, SwapContract, TxOptions};
use crate::config::NetworkConfig;
use crate::error::{RejectionReason, SwapError, SwapResult};
use crate::events::{EventBatch, LedgerEvent};
use crate::secret::{HashLock, Secret};
use crate::types::{Address, ContractId, TxRef};

use async_trait::async_trait;
use ethers::contract::{abigen, ContractError, EthLogDecode, LogMeta};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::abi::RawLog;
use ethers::types::{TransactionReceipt, H160, H256, U256, U64};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

abigen!(
    HtlcContract,
    r#"[
        function newContract(address _participant, bytes32 _hashLock, uint256 _timelock) external payable returns (bytes32)
        function withdraw(bytes32 _contractId, bytes32 _preimage) external returns (bool)
        function refund(bytes32 _contractId) external returns (bool)
        function getContract(bytes32 _contractId) external view returns (address, address, bytes32, uint256, uint256, uint8, uint256)
        function emergencyStop() external view returns (bool)
        function toggleEmergencyStop() external
        function userSwapCount(address user) external view returns (uint256)
        function lastSwapTime(address user) external view returns (uint256)
        function MAX_SWAPS_PER_USER() external view returns (uint256)
        function RATE_LIMIT_WINDOW() external view returns (uint256)
        event SwapInitiated(bytes32 indexed contractId, address indexed initiator, address indexed participant, bytes32 hashLock, uint256 timelock, uint256 amount, uint256 createdAt)
        event SwapWithdrawn(bytes32 indexed contractId, bytes32 secret, uint256 withdrawnAt)
        event SwapRefunded(bytes32 indexed contractId, uint256 refundedAt)
        event SwapStateChanged(bytes32 indexed contractId, uint8 oldState, uint8 newState, uint256 timestamp)
        event EmergencyStopToggled(bool stopped, uint256 timestamp)
    ]"#
);

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Maximum block span of one log query
const MAX_BLOCK_RANGE: u64 = 1000;

/// HTLC contract reached over JSON-RPC
pub struct EvmLedger {
    network: String,
    config: NetworkConfig,
    clients: Vec<Arc<Client>>,
    contracts: Vec<HtlcContract<Client>>,
    /// Index of the active client
    current: AtomicUsize,
    signer: H160,
    /// Active contracts cannot be older than the longest timelock
    lookback_blocks: u64,
}

impl EvmLedger {
    /// Connect to every configured RPC URL with the signer key from `key_env`
    pub async fn connect(network: &str, config: &NetworkConfig, key_env: &str) -> SwapResult<Self> {
        let key = std::env::var(key_env)
            .map_err(|_| SwapError::Config(format!("signer key variable {} is not set", key_env)))?;
        let wallet: LocalWallet = key
            .parse()
            .map_err(|e| SwapError::Config(format!("Invalid private key: {}", e)))?;
        let wallet = wallet.with_chain_id(config.chain_id);
        let signer = wallet.address();

        let contract_address: H160 = config
            .contract_address
            .parse()
            .map_err(|e| SwapError::Config(format!("Invalid contract address: {}", e)))?;

        let mut clients = Vec::new();
        let mut contracts = Vec::new();
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    let client = Arc::new(SignerMiddleware::new(provider, wallet.clone()));
                    contracts.push(HtlcContract::new(contract_address, client.clone()));
                    clients.push(client);
                    debug!("Added RPC provider for {}: {}", network, url);
                }
                Err(e) => warn!("Failed to create provider for {}: {}", url, e),
            }
        }

        if clients.is_empty() {
            return Err(SwapError::Config(format!("No valid RPC providers for {}", network)));
        }

        info!("Network {}: signer {:?}, HTLC {:?}", network, signer, contract_address);

        Ok(Self {
            network: network.to_string(),
            config: config.clone(),
            clients,
            contracts,
            current: AtomicUsize::new(0),
            signer,
            lookback_blocks: config.max_timelock_secs / config.block_time_secs.max(1) + 1,
        })
    }

    fn index(&self) -> usize {
        self.current.load(Ordering::Relaxed) % self.clients.len()
    }

    fn client(&self) -> &Arc<Client> {
        &self.clients[self.index()]
    }

    fn contract(&self) -> &HtlcContract<Client> {
        &self.contracts[self.index()]
    }

    /// Switch to the next RPC provider
    fn failover(&self) {
        let next = (self.index() + 1) % self.clients.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("Network {} failover to provider {}", self.network, next);
    }

    fn ensure_signer(&self, caller: &Address) -> SwapResult<()> {
        if to_h160(caller)? != self.signer {
            return Err(SwapError::Validation(format!(
                "no signer for {} on {}",
                caller, self.network
            )));
        }
        Ok(())
    }

    /// Map RPC or revert text to a typed error
    fn classify(&self, text: &str) -> SwapError {
        let lower = text.to_lowercase();
        let reason = if lower.contains("emergency stop") {
            Some(RejectionReason::EmergencyStop)
        } else if lower.contains("rate limit") {
            Some(RejectionReason::RateLimited)
        } else if lower.contains("yourself") || lower.contains("invalid participant") {
            Some(RejectionReason::SelfParticipant)
        } else if lower.contains("already exists") {
            Some(RejectionReason::DuplicateContract)
        } else if lower.contains("not expired") || lower.contains("not yet refundable") {
            Some(RejectionReason::TimelockNotExpired)
        } else if lower.contains("timelock") {
            Some(RejectionReason::TimelockOutOfBounds)
        } else if lower.contains("invalid secret") || lower.contains("preimage") || lower.contains("hashlock") {
            Some(RejectionReason::HashMismatch)
        } else if lower.contains("only participant") || lower.contains("not participant") {
            Some(RejectionReason::NotParticipant)
        } else if lower.contains("only initiator") || lower.contains("not the owner") {
            Some(RejectionReason::NotInitiator)
        } else if lower.contains("insufficient funds") {
            Some(RejectionReason::InsufficientFunds)
        } else if lower.contains("amount") {
            Some(RejectionReason::InvalidAmount)
        } else if lower.contains("not initiated") || lower.contains("invalid state") {
            Some(RejectionReason::InvalidState)
        } else if lower.contains("revert") {
            Some(RejectionReason::Reverted)
        } else {
            None
        };

        match reason {
            Some(reason) => SwapError::rejected(&self.network, reason, text),
            None if lower.contains("timeout") || lower.contains("timed out") => SwapError::Timeout {
                operation: format!("rpc call on {}", self.network),
            },
            None => SwapError::TransientRpc {
                network: self.network.clone(),
                message: text.to_string(),
            },
        }
    }

    fn contract_error(&self, err: ContractError<Client>) -> SwapError {
        let text = err
            .decode_revert::<String>()
            .unwrap_or_else(|| err.to_string());
        let classified = self.classify(&text);
        if matches!(classified, SwapError::TransientRpc { .. }) {
            self.failover();
        }
        classified
    }

    /// Estimate with margin, falling back to a fixed limit when estimation fails
    async fn gas_limit(&self, op: HtlcOp, estimate: Result<U256, ContractError<Client>>, options: TxOptions) -> SwapResult<U256> {
        match estimate {
            Ok(gas) => Ok(options.buffered_gas(gas)),
            Err(e) => match self.contract_error(e) {
                SwapError::TransientRpc { message, .. } => {
                    warn!(
                        "Network {}: gas estimation for {} failed ({}), using fallback limit",
                        self.network,
                        op.as_str(),
                        message
                    );
                    Ok(options.buffered_gas(op.fallback_gas_limit()))
                }
                other => Err(other),
            },
        }
    }

    fn check_receipt(&self, receipt: Option<TransactionReceipt>) -> SwapResult<TransactionReceipt> {
        let receipt = receipt.ok_or_else(|| SwapError::TransientRpc {
            network: self.network.clone(),
            message: "transaction dropped from mempool".to_string(),
        })?;
        if receipt.status == Some(U64::from(0)) {
            return Err(SwapError::rejected(
                &self.network,
                RejectionReason::Reverted,
                format!("transaction {:?} reverted", receipt.transaction_hash),
            ));
        }
        Ok(receipt)
    }

    fn to_event(&self, event: HtlcContractEvents, meta: &LogMeta) -> Option<LedgerEvent> {
        let network = self.network.clone();
        let tx = TxRef(format!("{:?}", meta.transaction_hash));
        match event {
            HtlcContractEvents::SwapInitiatedFilter(e) => Some(LedgerEvent::SwapInitiated {
                network,
                contract_id: ContractId(e.contract_id),
                initiator: from_h160(e.initiator),
                participant: from_h160(e.participant),
                hash_lock: HashLock(e.hash_lock),
                timelock: e.timelock.low_u64(),
                amount: to_u128(e.amount),
                created_at: e.created_at.low_u64(),
                tx,
            }),
            HtlcContractEvents::SwapWithdrawnFilter(e) => Some(LedgerEvent::SwapWithdrawn {
                network,
                contract_id: ContractId(e.contract_id),
                secret: Secret::from_bytes(e.secret),
                withdrawn_at: e.withdrawn_at.low_u64(),
                tx,
            }),
            HtlcContractEvents::SwapRefundedFilter(e) => Some(LedgerEvent::SwapRefunded {
                network,
                contract_id: ContractId(e.contract_id),
                refunded_at: e.refunded_at.low_u64(),
                tx,
            }),
            HtlcContractEvents::EmergencyStopToggledFilter(e) => Some(LedgerEvent::EmergencyStopToggled {
                network,
                stopped: e.stopped,
                tx,
            }),
            HtlcContractEvents::SwapStateChangedFilter(_) => None,
        }
    }

    async fn block_number(&self) -> SwapResult<u64> {
        self.client()
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .map_err(|e| {
                self.failover();
                SwapError::TransientRpc {
                    network: self.network.clone(),
                    message: e.to_string(),
                }
            })
    }

    async fn lookback_start(&self) -> SwapResult<u64> {
        Ok(self.block_number().await?.saturating_sub(self.lookback_blocks))
    }
}

fn to_h160(address: &Address) -> SwapResult<H160> {
    address
        .as_str()
        .parse()
        .map_err(|e| SwapError::Validation(format!("invalid address {}: {}", address, e)))
}

fn from_h160(address: H160) -> Address {
    Address::new(format!("{:?}", address))
}

fn to_u128(value: U256) -> u128 {
    if value > U256::from(u128::MAX) {
        u128::MAX
    } else {
        value.as_u128()
    }
}

fn topic(bytes: [u8; 32]) -> H256 {
    H256(bytes)
}

fn address_topic(address: H160) -> H256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(address.as_bytes());
    H256(bytes)
}

#[async_trait]
impl LedgerContract for EvmLedger {
    async fn chain_id(&self) -> SwapResult<u64> {
        self.client()
            .get_chainid()
            .await
            .map(|id| id.low_u64())
            .map_err(|e| self.classify(&e.to_string()))
    }

    async fn switch_network(&self, chain_id: u64) -> SwapResult<()> {
        for (idx, client) in self.clients.iter().enumerate() {
            match client.get_chainid().await {
                Ok(id) if id.low_u64() == chain_id => {
                    self.current.store(idx, Ordering::Relaxed);
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => warn!("Provider {} on {} unreachable: {}", idx, self.network, e),
            }
        }
        Err(SwapError::Config(format!(
            "no RPC provider for {} serves chain {}",
            self.network, chain_id
        )))
    }

    async fn balance(&self, account: Address) -> SwapResult<u128> {
        let address = to_h160(&account)?;
        self.client()
            .get_balance(address, None)
            .await
            .map(to_u128)
            .map_err(|e| self.classify(&e.to_string()))
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
        self.ensure_signer(&caller)?;

        let call = self
            .contract()
            .new_contract(to_h160(&participant)?, hash_lock.0, U256::from(timelock))
            .value(U256::from(amount));
        let gas = self.gas_limit(HtlcOp::Create, call.estimate_gas().await, options).await?;
        let call = call.gas(gas);

        let pending = call.send().await.map_err(|e| self.contract_error(e))?;
        debug!("Network {}: create broadcast as {:?}", self.network, pending.tx_hash());
        let receipt = pending.await.map_err(|e| self.classify(&e.to_string()))?;
        let receipt = self.check_receipt(receipt)?;

        let tx = TxRef(format!("{:?}", receipt.transaction_hash));
        for log in receipt.logs {
            if let Ok(event) = SwapInitiatedFilter::decode_log(&RawLog::from(log)) {
                return Ok(CreateReceipt {
                    contract_id: ContractId(event.contract_id),
                    tx: Some(tx),
                });
            }
        }

        Err(SwapError::Internal(format!(
            "create transaction {} emitted no SwapInitiated event",
            tx
        )))
    }

    async fn withdraw(
        &self,
        caller: Address,
        contract_id: ContractId,
        secret: Secret,
        options: TxOptions,
    ) -> SwapResult<TxRef> {
        self.ensure_signer(&caller)?;

        let call = self.contract().withdraw(contract_id.0, *secret.as_bytes());
        let gas = self.gas_limit(HtlcOp::Withdraw, call.estimate_gas().await, options).await?;
        let call = call.gas(gas);

        let pending = call.send().await.map_err(|e| self.contract_error(e))?;
        let receipt = pending.await.map_err(|e| self.classify(&e.to_string()))?;
        let receipt = self.check_receipt(receipt)?;
        Ok(TxRef(format!("{:?}", receipt.transaction_hash)))
    }

    async fn refund(
        &self,
        caller: Address,
        contract_id: ContractId,
        options: TxOptions,
    ) -> SwapResult<TxRef> {
        self.ensure_signer(&caller)?;

        let call = self.contract().refund(contract_id.0);
        let gas = self.gas_limit(HtlcOp::Refund, call.estimate_gas().await, options).await?;
        let call = call.gas(gas);

        let pending = call.send().await.map_err(|e| self.contract_error(e))?;
        let receipt = pending.await.map_err(|e| self.classify(&e.to_string()))?;
        let receipt = self.check_receipt(receipt)?;
        Ok(TxRef(format!("{:?}", receipt.transaction_hash)))
    }

    async fn get_contract(&self, contract_id: ContractId) -> SwapResult<Option<SwapContract>> {
        let (initiator, participant, hash_lock, timelock, amount, state, created_at) = self
            .contract()
            .get_contract(contract_id.0)
            .call()
            .await
            .map_err(|e| self.contract_error(e))?;

        let state = ContractState::from_code(state)?;
        if state == ContractState::Empty {
            return Ok(None);
        }

        Ok(Some(SwapContract {
            contract_id,
            initiator: from_h160(initiator),
            participant: from_h160(participant),
            hash_lock: HashLock(hash_lock),
            timelock: timelock.low_u64(),
            amount: to_u128(amount),
            state,
            created_at: created_at.low_u64(),
        }))
    }

    async fn find_active(
        &self,
        creator: Address,
        hash_lock: HashLock,
    ) -> SwapResult<Option<SwapContract>> {
        let from = self.lookback_start().await?;
        let created = self
            .contract()
            .swap_initiated_filter()
            .from_block(from)
            .topic2(address_topic(to_h160(&creator)?))
            .query()
            .await
            .map_err(|e| self.contract_error(e))?;

        for event in created.into_iter().filter(|e| e.hash_lock == hash_lock.0) {
            if let Some(contract) = self.get_contract(ContractId(event.contract_id)).await? {
                if contract.state == ContractState::Initiated {
                    return Ok(Some(contract));
                }
            }
        }
        Ok(None)
    }

    async fn emergency_stopped(&self) -> SwapResult<bool> {
        self.contract()
            .emergency_stop()
            .call()
            .await
            .map_err(|e| self.contract_error(e))
    }

    async fn toggle_emergency_stop(&self, caller: Address, options: TxOptions) -> SwapResult<bool> {
        self.ensure_signer(&caller)?;

        let call = self.contract().toggle_emergency_stop();
        let gas = self.gas_limit(HtlcOp::Admin, call.estimate_gas().await, options).await?;
        let call = call.gas(gas);

        let pending = call.send().await.map_err(|e| self.contract_error(e))?;
        let receipt = pending.await.map_err(|e| self.classify(&e.to_string()))?;
        self.check_receipt(receipt)?;
        self.emergency_stopped().await
    }

    async fn rate_limit(&self, account: Address) -> SwapResult<RateLimitStatus> {
        let address = to_h160(&account)?;
        let contract = self.contract();
        let swap_count = contract.user_swap_count(address).call().await;
        let last_swap_time = contract.last_swap_time(address).call().await;
        let max_swaps = contract.max_swaps_per_user().call().await;
        let window = contract.rate_limit_window().call().await;

        Ok(RateLimitStatus {
            swap_count: swap_count.map_err(|e| self.contract_error(e))?.low_u64(),
            last_swap_time: last_swap_time.map_err(|e| self.contract_error(e))?.low_u64(),
            max_swaps: max_swaps.map_err(|e| self.contract_error(e))?.low_u64(),
            window_secs: window.map_err(|e| self.contract_error(e))?.low_u64(),
        })
    }

    async fn revealed_secret(&self, contract_id: ContractId) -> SwapResult<Option<Secret>> {
        let from = self.lookback_start().await?;
        let withdrawn = self
            .contract()
            .swap_withdrawn_filter()
            .from_block(from)
            .topic1(topic(contract_id.0))
            .query()
            .await
            .map_err(|e| self.contract_error(e))?;

        Ok(withdrawn
            .into_iter()
            .next()
            .map(|e| Secret::from_bytes(e.secret)))
    }

    async fn poll_events(&self, cursor: u64) -> SwapResult<EventBatch> {
        let current = self.block_number().await?;
        let from = if cursor == 0 {
            current.saturating_sub(self.config.confirmation_blocks)
        } else {
            cursor
        };

        if from > current {
            return Ok(EventBatch {
                events: Vec::new(),
                next_cursor: cursor,
            });
        }

        let to = std::cmp::min(current, from + MAX_BLOCK_RANGE);
        debug!("Network {}: reading blocks {} to {}", self.network, from, to);

        let logs = self
            .contract()
            .events()
            .from_block(from)
            .to_block(to)
            .query_with_meta()
            .await
            .map_err(|e| self.contract_error(e))?;

        let events = logs
            .into_iter()
            .filter_map(|(event, meta)| self.to_event(event, &meta))
            .collect();

        Ok(EventBatch {
            events,
            next_cursor: to + 1,
        })
    }
}
