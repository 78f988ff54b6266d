//! Role-parameterised driver of one match through the HTLC protocol
//!
//! Initiator A locks X on L1 (HTLC1, timelock T1), participant B locks Y on
//! L2 (HTLC2, timelock T2 < T1 - margin), A claims HTLC2 revealing the
//! secret, B extracts the secret and claims HTLC1. Either side refunds its own
//! contract once its timelock has passed if the counterparty stalls.
//!
//! Every step re-reads the match and the ledgers, so a failed or interrupted
//! step can be retried as is. Steps run under a per-match lease.

use super::timelock::TimelockPolicy;
use crate::config::Settings;
use crate::error::{SwapError, SwapResult};
use crate::intents::{ContractRef, IntentRegistry, IntentStatus, Match, MatchStatus};
use crate::ledger::{
    ContractState, HtlcController, LedgerManager, SecretWatcher, SwapContract, WatchHandle,
    WatchOutcome,
};
use crate::secret::HashLock;
use crate::types::{to_base_units, Address, TxRef};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Which party a caller acts for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Intent creator; funds HTLC1 and holds the secret
    Initiator,
    /// Matcher; funds HTLC2
    Participant,
}

/// Protocol step performed by one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    LockInitiator,
    LockParticipant,
    ClaimInitiator,
    ClaimParticipant,
    Refund,
    /// Nothing to do until the counterparty or the clock moves
    Wait,
    /// Nothing left for this role
    Done,
}

/// Outcome of a coordinator call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub match_id: String,
    pub step: Step,
    pub status: MatchStatus,
    pub contract: Option<ContractRef>,
    pub tx: Option<TxRef>,
    pub waiting_on: Option<String>,
}

impl StepReport {
    fn new(record: &Match, step: Step) -> Self {
        Self {
            match_id: record.id.clone(),
            step,
            status: record.status,
            contract: None,
            tx: None,
            waiting_on: None,
        }
    }

    fn waiting(record: &Match, on: impl Into<String>) -> Self {
        Self {
            waiting_on: Some(on.into()),
            ..Self::new(record, Step::Wait)
        }
    }
}

/// Drives matches across both ledgers
pub struct SwapCoordinator {
    registry: Arc<IntentRegistry>,
    ledgers: Arc<LedgerManager>,
    watcher: SecretWatcher,
    policy: TimelockPolicy,
    instance_id: String,
    lease_ttl_secs: u64,
    /// In-process guard per match; the store lease covers other processes
    local: DashMap<String, Arc<Mutex<()>>>,
}

impl SwapCoordinator {
    pub fn new(
        settings: &Settings,
        registry: Arc<IntentRegistry>,
        ledgers: Arc<LedgerManager>,
        watcher: SecretWatcher,
    ) -> Self {
        Self {
            registry,
            ledgers,
            watcher,
            policy: TimelockPolicy::from_settings(settings),
            instance_id: settings.coordinator.instance_id.clone(),
            lease_ttl_secs: settings.coordinator.lease_ttl_secs,
            local: DashMap::new(),
        }
    }

    pub fn watcher(&self) -> &SecretWatcher {
        &self.watcher
    }

    /// Perform the next step `role` is responsible for
    pub async fn advance(&self, match_id: &str, role: Role, actor: &Address) -> SwapResult<StepReport> {
        self.leased(match_id, move || async move {
            let record = self.registry.require_match(match_id).await?;
            check_actor(&record, role, actor)?;
            match role {
                Role::Initiator => self.next_initiator_step(&record, actor).await,
                Role::Participant => self.next_participant_step(&record, actor).await,
            }
        })
        .await
    }

    pub async fn lock_initiator(&self, match_id: &str, actor: &Address) -> SwapResult<StepReport> {
        self.leased(match_id, move || self.do_lock_initiator(match_id, actor))
            .await
    }

    pub async fn lock_participant(&self, match_id: &str, actor: &Address) -> SwapResult<StepReport> {
        self.leased(match_id, move || self.do_lock_participant(match_id, actor))
            .await
    }

    pub async fn claim_initiator(&self, match_id: &str, actor: &Address) -> SwapResult<StepReport> {
        self.leased(match_id, move || self.do_claim_initiator(match_id, actor))
            .await
    }

    pub async fn claim_participant(&self, match_id: &str, actor: &Address) -> SwapResult<StepReport> {
        self.leased(match_id, move || self.do_claim_participant(match_id, actor))
            .await
    }

    /// Refund the contract `role` funded; the ledger enforces its timelock
    pub async fn refund(&self, match_id: &str, role: Role, actor: &Address) -> SwapResult<StepReport> {
        self.leased(match_id, move || self.do_refund(match_id, role, actor))
            .await
    }

    /// Correct a network mismatch before retrying a step
    pub async fn switch_network(&self, network: &str) -> SwapResult<()> {
        self.ledgers.controller(network)?.switch_network().await
    }

    /// Watch HTLC2 until the initiator's claim reveals the secret
    pub async fn watch_secret(&self, match_id: &str) -> SwapResult<WatchHandle> {
        let record = self.registry.require_match(match_id).await?;
        let htlc2 = record
            .participant_contract
            .as_ref()
            .ok_or_else(|| waiting_conflict(&record, "the participant's contract"))?;
        let controller = self.ledgers.controller(&htlc2.network)?;
        Ok(self.watcher.watch(controller, htlc2.contract_id))
    }

    async fn leased<T, F, Fut>(&self, match_id: &str, step: F) -> SwapResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SwapResult<T>>,
    {
        let guard = self
            .local
            .entry(match_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _local = guard.lock().await;
            self.run_leased(match_id, step).await
        };
        drop(guard);
        // Drop the guard unless another caller is queued on it
        self.local
            .remove_if(match_id, |_, guard| Arc::strong_count(guard) == 1);

        if let Err(e) = &result {
            debug!("Match {}: step failed: {}", match_id, e);
        }
        result
    }

    async fn run_leased<T, F, Fut>(&self, match_id: &str, step: F) -> SwapResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SwapResult<T>>,
    {
        self.registry
            .acquire_lease(match_id, &self.instance_id, self.lease_ttl_secs)
            .await?;
        let result = step().await;
        if let Err(e) = self.registry.release_lease(match_id, &self.instance_id).await {
            warn!("Match {}: failed to release lease: {}", match_id, e);
        }
        result
    }

    /// Matches with an in-process guard currently allocated
    pub fn guarded_matches(&self) -> usize {
        self.local.len()
    }

    fn forget_secret(&self, record: &Match) {
        if let Some(htlc2) = &record.participant_contract {
            self.watcher.forget(&htlc2.network, htlc2.contract_id);
        }
    }

    fn controllers(&self, record: &Match) -> SwapResult<(Arc<HtlcController>, Arc<HtlcController>)> {
        Ok((
            self.ledgers.controller(&record.from_network)?,
            self.ledgers.controller(&record.to_network)?,
        ))
    }

    async fn next_initiator_step(&self, record: &Match, actor: &Address) -> SwapResult<StepReport> {
        let Some(htlc1_ref) = &record.initiator_contract else {
            if record.status.is_terminal() {
                return Ok(StepReport::new(record, Step::Done));
            }
            return self.do_lock_initiator(&record.id, actor).await;
        };

        let (l1, l2) = self.controllers(record)?;
        let htlc1 = l1.require_contract(htlc1_ref.contract_id).await?;
        if htlc1.state != ContractState::Initiated {
            return Ok(StepReport::new(record, Step::Done));
        }

        let htlc2_state = match &record.participant_contract {
            Some(htlc2) => Some(l2.require_contract(htlc2.contract_id).await?.state),
            None => None,
        };

        match htlc2_state {
            Some(ContractState::Initiated) => self.do_claim_initiator(&record.id, actor).await,
            // Already claimed; HTLC1 now belongs to the participant
            Some(ContractState::Withdrawn) => Ok(StepReport::waiting(record, "participant claim")),
            other => {
                if l1.now() >= htlc1.timelock {
                    self.do_refund(&record.id, Role::Initiator, actor).await
                } else if other.is_none() {
                    Ok(StepReport::waiting(record, "participant lock"))
                } else {
                    Ok(StepReport::waiting(record, "initiator timelock"))
                }
            }
        }
    }

    async fn next_participant_step(&self, record: &Match, actor: &Address) -> SwapResult<StepReport> {
        let Some(htlc1_ref) = &record.initiator_contract else {
            if record.status.is_terminal() {
                return Ok(StepReport::new(record, Step::Done));
            }
            return Ok(StepReport::waiting(record, "initiator lock"));
        };

        let (l1, l2) = self.controllers(record)?;
        let htlc1 = l1.require_contract(htlc1_ref.contract_id).await?;

        let Some(htlc2_ref) = &record.participant_contract else {
            if record.status.is_terminal() || htlc1.state != ContractState::Initiated {
                return Ok(StepReport::new(record, Step::Done));
            }
            return self.do_lock_participant(&record.id, actor).await;
        };

        let htlc2 = l2.require_contract(htlc2_ref.contract_id).await?;
        match htlc2.state {
            ContractState::Withdrawn if htlc1.state == ContractState::Initiated => {
                self.do_claim_participant(&record.id, actor).await
            }
            ContractState::Initiated if l2.now() >= htlc2.timelock => {
                self.do_refund(&record.id, Role::Participant, actor).await
            }
            ContractState::Initiated => Ok(StepReport::waiting(record, "secret reveal")),
            _ => Ok(StepReport::new(record, Step::Done)),
        }
    }

    async fn do_lock_initiator(&self, match_id: &str, actor: &Address) -> SwapResult<StepReport> {
        let record = self.registry.require_match(match_id).await?;
        check_actor(&record, Role::Initiator, actor)?;

        if let Some(existing) = &record.initiator_contract {
            return Ok(StepReport {
                contract: Some(existing.clone()),
                ..StepReport::new(&record, Step::LockInitiator)
            });
        }
        if record.status.is_terminal() {
            return Err(terminal_conflict(&record));
        }

        let l1 = self.ledgers.controller(&record.from_network)?;
        let amount = to_base_units(record.from_amount, l1.config().decimals)?;

        // A create that landed before a crash is picked up, not repeated
        let (contract_id, timelock, tx) = match l1.find_active(actor, &record.hash_lock).await? {
            Some(existing) => {
                if existing.participant != record.matcher {
                    return Err(SwapError::StateConflict(format!(
                        "active contract {} for this hash lock names {} as participant",
                        existing.contract_id, existing.participant
                    )));
                }
                info!("Match {}: resuming with existing contract {}", record.id, existing.contract_id);
                (existing.contract_id, existing.timelock, None)
            }
            None => {
                let timelock = self.policy.initiator_timelock(l1.now(), l1.config());
                let receipt = l1
                    .create(actor, &record.matcher, record.hash_lock, timelock, amount)
                    .await?;
                (receipt.contract_id, timelock, receipt.tx)
            }
        };

        let contract = ContractRef {
            network: record.from_network.clone(),
            contract_id,
            tx: tx.clone(),
        };
        let updated = self
            .registry
            .modify_match(match_id, |m| {
                m.initiator_contract = Some(contract.clone());
                m.initiator_timelock = Some(timelock);
                m.contract_id = Some(contract_id.to_hex());
                if let Some(tx) = &tx {
                    m.tx_hash = Some(tx.0.clone());
                }
                m.advance(MatchStatus::InitiatorLocked);
                Ok(true)
            })
            .await?;

        self.registry
            .modify_intent(&record.intent_id, |i| {
                i.contract_id = Some(contract_id.to_hex());
                if let Some(tx) = &tx {
                    i.tx_hash = Some(tx.0.clone());
                }
                Ok(true)
            })
            .await?;

        info!(
            "Match {}: initiator locked {} on {} in {} until {}",
            record.id, record.from_amount, record.from_network, contract_id, timelock
        );
        Ok(StepReport {
            contract: Some(contract),
            tx,
            ..StepReport::new(&updated, Step::LockInitiator)
        })
    }

    async fn do_lock_participant(&self, match_id: &str, actor: &Address) -> SwapResult<StepReport> {
        let record = self.registry.require_match(match_id).await?;
        check_actor(&record, Role::Participant, actor)?;

        if let Some(existing) = &record.participant_contract {
            return Ok(StepReport {
                contract: Some(existing.clone()),
                ..StepReport::new(&record, Step::LockParticipant)
            });
        }
        if record.status.is_terminal() {
            return Err(terminal_conflict(&record));
        }

        let htlc1_ref = record
            .initiator_contract
            .clone()
            .ok_or_else(|| waiting_conflict(&record, "the initiator's contract"))?;
        let (l1, l2) = self.controllers(&record)?;

        let htlc1 = l1.require_contract(htlc1_ref.contract_id).await?;
        verify_counterparty(
            &htlc1,
            &record.hash_lock,
            &record.initiator,
            actor,
            to_base_units(record.from_amount, l1.config().decimals)?,
        )?;
        if htlc1.state != ContractState::Initiated {
            return Err(SwapError::StateConflict(format!(
                "initiator contract {} is {:?}",
                htlc1.contract_id, htlc1.state
            )));
        }

        let amount = to_base_units(record.to_amount, l2.config().decimals)?;
        let (contract_id, timelock, tx) = match l2.find_active(actor, &record.hash_lock).await? {
            Some(existing) => {
                self.policy.check(htlc1.timelock, existing.timelock)?;
                info!("Match {}: resuming with existing contract {}", record.id, existing.contract_id);
                (existing.contract_id, existing.timelock, None)
            }
            None => {
                let timelock = self
                    .policy
                    .participant_timelock(l2.now(), l2.config(), htlc1.timelock)?;
                let receipt = l2
                    .create(actor, &record.initiator, record.hash_lock, timelock, amount)
                    .await?;
                (receipt.contract_id, timelock, receipt.tx)
            }
        };

        let contract = ContractRef {
            network: record.to_network.clone(),
            contract_id,
            tx: tx.clone(),
        };
        let updated = self
            .registry
            .modify_match(match_id, |m| {
                m.participant_contract = Some(contract.clone());
                m.participant_timelock = Some(timelock);
                m.initiator_timelock = Some(htlc1.timelock);
                m.counterparty_contract_id = Some(contract_id.to_hex());
                if let Some(tx) = &tx {
                    m.tx_hash = Some(tx.0.clone());
                }
                m.advance(MatchStatus::ParticipantLocked);
                Ok(true)
            })
            .await?;

        info!(
            "Match {}: participant locked {} on {} in {} until {}",
            record.id, record.to_amount, record.to_network, contract_id, timelock
        );
        Ok(StepReport {
            contract: Some(contract),
            tx,
            ..StepReport::new(&updated, Step::LockParticipant)
        })
    }

    async fn do_claim_initiator(&self, match_id: &str, actor: &Address) -> SwapResult<StepReport> {
        let record = self.registry.require_match(match_id).await?;
        check_actor(&record, Role::Initiator, actor)?;

        let htlc1_ref = record
            .initiator_contract
            .clone()
            .ok_or_else(|| waiting_conflict(&record, "the initiator's contract"))?;
        let htlc2_ref = record
            .participant_contract
            .clone()
            .ok_or_else(|| waiting_conflict(&record, "the participant's contract"))?;
        let (l1, l2) = self.controllers(&record)?;

        let htlc2 = l2.require_contract(htlc2_ref.contract_id).await?;
        match htlc2.state {
            ContractState::Withdrawn => {
                return Ok(StepReport {
                    contract: Some(htlc2_ref),
                    ..StepReport::new(&record, Step::ClaimInitiator)
                })
            }
            ContractState::Initiated => {}
            state => {
                return Err(SwapError::StateConflict(format!(
                    "participant contract {} is {:?}",
                    htlc2.contract_id, state
                )))
            }
        }

        verify_counterparty(
            &htlc2,
            &record.hash_lock,
            &record.matcher,
            actor,
            to_base_units(record.to_amount, l2.config().decimals)?,
        )?;
        let htlc1 = l1.require_contract(htlc1_ref.contract_id).await?;
        self.policy.check(htlc1.timelock, htlc2.timelock)?;

        let secret = self.registry.secret_for(&record.intent_id, actor).await?;
        let tx = l2.withdraw(actor, htlc2.contract_id, &secret).await?;

        let revealed = secret.expose_hex();
        let updated = self
            .registry
            .modify_match(match_id, |m| {
                m.revealed_secret = Some(revealed.clone());
                m.tx_hash = Some(tx.0.clone());
                m.advance(MatchStatus::SecretRevealed);
                Ok(true)
            })
            .await?;

        info!("Match {}: initiator claimed {} on {}", record.id, htlc2.contract_id, record.to_network);
        Ok(StepReport {
            contract: Some(htlc2_ref),
            tx: Some(tx),
            ..StepReport::new(&updated, Step::ClaimInitiator)
        })
    }

    async fn do_claim_participant(&self, match_id: &str, actor: &Address) -> SwapResult<StepReport> {
        let record = self.registry.require_match(match_id).await?;
        check_actor(&record, Role::Participant, actor)?;

        let htlc1_ref = record
            .initiator_contract
            .clone()
            .ok_or_else(|| waiting_conflict(&record, "the initiator's contract"))?;
        let htlc2_ref = record
            .participant_contract
            .clone()
            .ok_or_else(|| waiting_conflict(&record, "the participant's contract"))?;
        let (l1, l2) = self.controllers(&record)?;

        let htlc1 = l1.require_contract(htlc1_ref.contract_id).await?;
        match htlc1.state {
            ContractState::Initiated => {}
            ContractState::Withdrawn => {
                let updated = self.complete(&record, None).await?;
                return Ok(StepReport {
                    contract: Some(htlc1_ref),
                    ..StepReport::new(&updated, Step::ClaimParticipant)
                });
            }
            state => {
                return Err(SwapError::StateConflict(format!(
                    "initiator contract {} is {:?}",
                    htlc1.contract_id, state
                )))
            }
        }

        let secret = match self.watcher.check(&l2, htlc2_ref.contract_id).await? {
            Some(WatchOutcome::Revealed(secret)) => secret,
            Some(WatchOutcome::Moot(state)) => {
                return Err(SwapError::StateConflict(format!(
                    "participant contract {} is {:?}; no secret will be revealed",
                    htlc2_ref.contract_id, state
                )))
            }
            Some(WatchOutcome::Cancelled) | None => {
                return Ok(StepReport::waiting(&record, "secret reveal"));
            }
        };

        let tx = l1.withdraw(actor, htlc1.contract_id, &secret).await?;
        let updated = self.complete(&record, Some(&tx)).await?;

        info!("Match {}: participant claimed {} on {}", record.id, htlc1.contract_id, record.from_network);
        Ok(StepReport {
            contract: Some(htlc1_ref),
            tx: Some(tx),
            ..StepReport::new(&updated, Step::ClaimParticipant)
        })
    }

    async fn do_refund(&self, match_id: &str, role: Role, actor: &Address) -> SwapResult<StepReport> {
        let record = self.registry.require_match(match_id).await?;
        check_actor(&record, role, actor)?;

        let contract = match role {
            Role::Initiator => record.initiator_contract.clone(),
            Role::Participant => record.participant_contract.clone(),
        }
        .ok_or_else(|| {
            SwapError::StateConflict(format!("match {} has no contract funded by {}", record.id, actor))
        })?;

        let controller = self.ledgers.controller(&contract.network)?;
        let tx = controller.refund(actor, contract.contract_id).await?;

        let updated = self
            .registry
            .modify_match(match_id, |m| {
                m.tx_hash = Some(tx.0.clone());
                m.advance(MatchStatus::Refunded);
                Ok(true)
            })
            .await?;
        self.registry
            .modify_intent(&record.intent_id, |i| {
                if i.status.is_terminal() {
                    return Ok(false);
                }
                i.status = IntentStatus::Expired;
                Ok(true)
            })
            .await?;

        if updated.status.is_terminal() {
            self.forget_secret(&updated);
        }

        info!("Match {}: {:?} refunded {} on {}", record.id, role, contract.contract_id, contract.network);
        Ok(StepReport {
            contract: Some(contract),
            tx: Some(tx),
            ..StepReport::new(&updated, Step::Refund)
        })
    }

    async fn complete(&self, record: &Match, tx: Option<&TxRef>) -> SwapResult<Match> {
        let updated = self
            .registry
            .modify_match(&record.id, |m| {
                if let Some(tx) = tx {
                    m.tx_hash = Some(tx.0.clone());
                }
                Ok(m.advance(MatchStatus::Completed) || tx.is_some())
            })
            .await?;
        self.registry
            .modify_intent(&record.intent_id, |i| {
                if i.status.is_terminal() {
                    return Ok(false);
                }
                i.status = IntentStatus::Completed;
                Ok(true)
            })
            .await?;
        self.forget_secret(&updated);
        Ok(updated)
    }
}

fn check_actor(record: &Match, role: Role, actor: &Address) -> SwapResult<()> {
    let expected = match role {
        Role::Initiator => &record.initiator,
        Role::Participant => &record.matcher,
    };
    if actor != expected {
        return Err(SwapError::Validation(format!(
            "{} is not the {:?} of match {}",
            actor, role, record.id
        )));
    }
    Ok(())
}

/// Confirm a counterparty contract locks what the match promised
fn verify_counterparty(
    contract: &SwapContract,
    hash_lock: &HashLock,
    creator: &Address,
    beneficiary: &Address,
    amount: u128,
) -> SwapResult<()> {
    let mismatch = |what: &str| {
        Err(SwapError::Validation(format!(
            "contract {} has the wrong {}",
            contract.contract_id, what
        )))
    };

    if contract.hash_lock != *hash_lock {
        return mismatch("hash lock");
    }
    if contract.initiator != *creator {
        return mismatch("initiator");
    }
    if contract.participant != *beneficiary {
        return mismatch("participant");
    }
    if contract.amount != amount {
        return mismatch("amount");
    }
    Ok(())
}

fn terminal_conflict(record: &Match) -> SwapError {
    SwapError::StateConflict(format!(
        "match {} is already {}",
        record.id,
        record.status.as_str()
    ))
}

fn waiting_conflict(record: &Match, what: &str) -> SwapError {
    SwapError::StateConflict(format!("match {} is still waiting for {}", record.id, what))
}
