//! Background engine reconciling matches with ledger activity

use crate::error::SwapResult;
use crate::events::LedgerEvent;
use crate::intents::{IntentRegistry, IntentStatus, MatchStatus, Side};
use crate::ledger::{LedgerManager, SecretWatcher};
use crate::secret::Commitments;
use crate::types::ContractId;

use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Observes ledger events and moves matches forward
pub struct CoordinationEngine {
    registry: Arc<IntentRegistry>,
    ledgers: Arc<LedgerManager>,
    watcher: SecretWatcher,
    commitments: Commitments,
    sweep_interval: Duration,
    health_interval: Duration,
    shutdown: Arc<RwLock<bool>>,
}

impl CoordinationEngine {
    pub fn new(
        registry: Arc<IntentRegistry>,
        ledgers: Arc<LedgerManager>,
        watcher: SecretWatcher,
        commitments: Commitments,
        sweep_interval_secs: u64,
        health_interval_secs: u64,
    ) -> Self {
        Self {
            registry,
            ledgers,
            watcher,
            commitments,
            sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
            health_interval: Duration::from_secs(health_interval_secs.max(1)),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main loop
    pub async fn run(&self) -> SwapResult<()> {
        let mut event_rx = self.ledgers.subscribe_events();
        let mut sweep_interval = interval(self.sweep_interval);
        let mut health_interval = interval(self.health_interval);

        info!("Coordination engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                received = event_rx.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            error!("Error handling ledger event: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Engine lagged behind by {} ledger events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                _ = sweep_interval.tick() => {
                    if let Err(e) = self.registry.sweep_expired().await {
                        error!("Sweep failed: {}", e);
                    }
                }

                _ = health_interval.tick() => {
                    for (network, healthy) in self.ledgers.health_check().await {
                        if !healthy {
                            warn!("Network {} is unhealthy", network);
                        }
                    }
                    if let Err(e) = self.registry.stats().await {
                        debug!("Failed to refresh registry stats: {}", e);
                    }
                }
            }
        }

        info!("Coordination engine stopped");
        Ok(())
    }

    /// Apply one ledger event to the matches it concerns
    pub async fn handle_event(&self, event: LedgerEvent) -> SwapResult<()> {
        debug!("Handling {} on {}", event.name(), event.network());

        match event {
            LedgerEvent::SwapInitiated {
                network,
                contract_id,
                ..
            } => {
                self.observe(&network, contract_id, |side| match side {
                    Side::Initiator => MatchStatus::InitiatorLocked,
                    Side::Participant => MatchStatus::ParticipantLocked,
                })
                .await?;
            }

            LedgerEvent::SwapWithdrawn {
                network,
                contract_id,
                secret,
                ..
            } => {
                let matched = self
                    .observe(&network, contract_id, |side| match side {
                        Side::Participant => MatchStatus::SecretRevealed,
                        Side::Initiator => MatchStatus::Completed,
                    })
                    .await?;

                for (match_id, side) in matched {
                    if side == Side::Participant {
                        self.record_secret(&match_id, &network, contract_id, &secret).await?;
                    }
                }
            }

            LedgerEvent::SwapRefunded {
                network,
                contract_id,
                ..
            } => {
                self.observe(&network, contract_id, |_| MatchStatus::Refunded)
                    .await?;
            }

            LedgerEvent::EmergencyStopToggled {
                network, stopped, ..
            } => {
                if stopped {
                    warn!("Emergency stop engaged on {}", network);
                } else {
                    info!("Emergency stop released on {}", network);
                }
            }
        }

        Ok(())
    }

    /// Advance every match holding `contract_id`; returns the matches touched
    async fn observe<F>(
        &self,
        network: &str,
        contract_id: ContractId,
        status_for: F,
    ) -> SwapResult<Vec<(String, Side)>>
    where
        F: Fn(Side) -> MatchStatus,
    {
        let mut touched = Vec::new();
        let matches = self.registry.store().list_matches().await?;

        for record in matches {
            let Some(side) = record.side_of(network, &contract_id) else {
                continue;
            };
            let next = status_for(side);

            let updated = self
                .registry
                .modify_match(&record.id, |m| Ok(m.advance(next)))
                .await?;
            if updated.status == next {
                debug!("Match {} observed as {}", updated.id, next.as_str());
            }

            let intent_status = match updated.status {
                MatchStatus::Completed => Some(IntentStatus::Completed),
                MatchStatus::Refunded | MatchStatus::Expired => Some(IntentStatus::Expired),
                _ => None,
            };
            if updated.status.is_terminal() {
                if let Some(htlc2) = &updated.participant_contract {
                    self.watcher.forget(&htlc2.network, htlc2.contract_id);
                }
            }
            if let Some(status) = intent_status {
                self.registry
                    .modify_intent(&updated.intent_id, |i| {
                        if i.status.is_terminal() {
                            return Ok(false);
                        }
                        i.status = status;
                        Ok(true)
                    })
                    .await?;
            }

            touched.push((record.id, side));
        }

        Ok(touched)
    }

    async fn record_secret(
        &self,
        match_id: &str,
        network: &str,
        contract_id: ContractId,
        secret: &crate::secret::Secret,
    ) -> SwapResult<()> {
        let record = self.registry.require_match(match_id).await?;
        if !self.commitments.verify(secret, &record.hash_lock) {
            warn!("Match {}: withdrawal of {} carried a secret that does not open its hash lock", match_id, contract_id);
            return Ok(());
        }

        // Warm the watcher so the participant's claim needs no extra ledger read
        if let Ok(controller) = self.ledgers.controller(network) {
            if let Err(e) = self.watcher.check(&controller, contract_id).await {
                debug!("Match {}: secret check on {} failed: {}", match_id, network, e);
            }
        }

        let revealed = secret.expose_hex();
        self.registry
            .modify_match(match_id, |m| {
                if m.revealed_secret.is_some() {
                    return Ok(false);
                }
                m.revealed_secret = Some(revealed.clone());
                Ok(true)
            })
            .await?;
        Ok(())
    }

    /// Stop the engine
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Coordination engine shutdown initiated");
    }
}
