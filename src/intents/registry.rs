//! Intent registry and match resolver

use super::rates::{quote, RateSource};
use super::types::{
    Intent, IntentStatus, IntentUpdate, Lease, Match, MatchStatus, MatchUpdate, NewIntent,
};
use crate::clock::Clock;
use crate::config::{NetworkConfig, Settings};
use crate::error::{SwapError, SwapResult};
use crate::secret::{Commitments, Secret};
use crate::store::MatchingStore;
use crate::types::Address;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts at a contended compare-and-swap before reporting a conflict
const MAX_CAS_ATTEMPTS: usize = 16;

/// Counts reported by `/health`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_intents: usize,
    pub total_matches: usize,
}

/// Records expired by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_intents: usize,
    pub expired_matches: usize,
    /// Records left for the next sweep after a store error
    pub failed: usize,
}

/// Shared registry of intents and matches
///
/// Every mutation goes through a per-key compare-and-swap on the store, so
/// concurrent callers racing for one intent or match see exactly one winner.
pub struct IntentRegistry {
    store: Arc<dyn MatchingStore>,
    rates: Arc<dyn RateSource>,
    commitments: Commitments,
    clock: Arc<dyn Clock>,
    networks: HashMap<String, NetworkConfig>,
    expiry_secs: u64,
    tolerance: f64,
}

impl IntentRegistry {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn MatchingStore>,
        rates: Arc<dyn RateSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let networks = settings
            .enabled_networks()
            .into_iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();

        Self {
            store,
            rates,
            commitments: Commitments::new(settings.protocol.hash_function),
            clock,
            networks,
            expiry_secs: settings.protocol.intent_expiry_secs,
            tolerance: settings.protocol.amount_tolerance,
        }
    }

    pub fn store(&self) -> Arc<dyn MatchingStore> {
        self.store.clone()
    }

    fn is_fresh(&self, created_at: u64, now: u64) -> bool {
        now < created_at.saturating_add(self.expiry_secs)
    }

    /// Create a pending intent with a fresh secret and hash lock
    pub async fn create_intent(&self, request: NewIntent) -> SwapResult<Intent> {
        let initiator = Address::new(&request.initiator);
        if initiator.is_empty() {
            return Err(SwapError::Validation("initiator is required".into()));
        }
        if request.from_token.trim().is_empty() || request.to_token.trim().is_empty() {
            return Err(SwapError::Validation("fromToken and toToken are required".into()));
        }
        if !request.from_amount.is_finite() || request.from_amount <= 0.0 {
            return Err(SwapError::Validation(format!(
                "fromAmount must be positive, got {}",
                request.from_amount
            )));
        }
        let from_network = self.networks.get(&request.from_network).ok_or_else(|| {
            SwapError::Validation(format!("unknown network: {}", request.from_network))
        })?;
        if !self.networks.contains_key(&request.to_network) {
            return Err(SwapError::Validation(format!(
                "unknown network: {}",
                request.to_network
            )));
        }
        if request.from_network == request.to_network {
            return Err(SwapError::Validation(
                "fromNetwork and toNetwork must differ".into(),
            ));
        }

        let from_token = request.from_token.trim().to_uppercase();
        let to_token = request.to_token.trim().to_uppercase();
        let to_amount = quote(self.rates.as_ref(), request.from_amount, &from_token, &to_token);
        let now = self.clock.now();
        let (secret, hash_lock) = self.commitments.generate();

        let intent = Intent {
            id: Uuid::new_v4().to_string(),
            initiator,
            from_token,
            to_token,
            from_amount: request.from_amount,
            to_amount,
            from_network: request.from_network,
            to_network: request.to_network,
            status: IntentStatus::Pending,
            hash_lock,
            secret: Some(secret),
            timelock: now + from_network.initiator_window_secs,
            user_input: request.user_input,
            contract_id: None,
            tx_hash: None,
            matched_by: None,
            match_id: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        self.store.insert_intent(&intent).await?;
        crate::metrics::record_intent_created(&intent.from_network, &intent.to_network);
        info!(
            "Intent {} created: {} {} on {} -> {} {} on {}",
            intent.id,
            intent.from_amount,
            intent.from_token,
            intent.from_network,
            intent.to_amount,
            intent.to_token,
            intent.to_network
        );

        Ok(intent)
    }

    /// Pending intents that take the other side of `intent`
    pub async fn find_complementary(&self, intent: &Intent) -> SwapResult<Vec<Intent>> {
        let now = self.clock.now();
        let candidates = self.store.list_intents().await?;

        Ok(candidates
            .into_iter()
            .filter(|other| {
                other.id != intent.id
                    && other.status == IntentStatus::Pending
                    && self.is_fresh(other.created_at, now)
                    && other.from_token == intent.to_token
                    && other.to_token == intent.from_token
                    && other.from_network == intent.to_network
                    && other.to_network == intent.from_network
                    && (other.from_amount - intent.to_amount).abs() < self.tolerance
            })
            .collect())
    }

    /// Bind `matcher` to a pending intent
    ///
    /// Exactly one of any number of concurrent callers succeeds; the others
    /// observe a state conflict.
    pub async fn match_intent(&self, intent_id: &str, matcher: &str) -> SwapResult<(Match, Intent)> {
        let matcher = Address::new(matcher);
        if matcher.is_empty() {
            return Err(SwapError::Validation("matcherAddress is required".into()));
        }

        let intent = self.require_intent(intent_id).await?;
        if matcher == intent.initiator {
            return Err(SwapError::Validation("You cannot match your own intent".into()));
        }
        if intent.status != IntentStatus::Pending {
            return Err(SwapError::StateConflict(format!(
                "intent {} is {}, not pending",
                intent.id,
                intent.status.as_str()
            )));
        }

        let now = self.clock.now();
        if !self.is_fresh(intent.created_at, now) {
            return Err(SwapError::StateConflict(format!("intent {} has expired", intent.id)));
        }

        let record = Match {
            id: Uuid::new_v4().to_string(),
            intent_id: intent.id.clone(),
            initiator: intent.initiator.clone(),
            matcher: matcher.clone(),
            status: MatchStatus::Matched,
            from_token: intent.from_token.clone(),
            to_token: intent.to_token.clone(),
            from_amount: intent.from_amount,
            to_amount: intent.to_amount,
            from_network: intent.from_network.clone(),
            to_network: intent.to_network.clone(),
            hash_lock: intent.hash_lock,
            initiator_timelock: None,
            participant_timelock: None,
            initiator_contract: None,
            participant_contract: None,
            revealed_secret: None,
            contract_id: None,
            counterparty_contract_id: None,
            tx_hash: None,
            lease: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        let mut updated = intent.clone();
        updated.status = IntentStatus::Matched;
        updated.matched_by = Some(matcher.clone());
        updated.match_id = Some(record.id.clone());
        updated.updated_at = now;
        updated.version = intent.version + 1;

        if !self.store.commit_match(intent.version, &updated, &record).await? {
            debug!("Lost match race for intent {}", intent.id);
            return Err(SwapError::StateConflict(format!(
                "intent {} was matched concurrently",
                intent.id
            )));
        }

        crate::metrics::record_match_created();
        info!("Intent {} matched by {} as match {}", intent.id, matcher, record.id);
        Ok((record, updated))
    }

    pub async fn get_intent(&self, id: &str) -> SwapResult<Option<Intent>> {
        self.store.get_intent(id).await
    }

    pub async fn require_intent(&self, id: &str) -> SwapResult<Intent> {
        self.store
            .get_intent(id)
            .await?
            .ok_or_else(|| SwapError::not_found("intent", id))
    }

    pub async fn require_match(&self, id: &str) -> SwapResult<Match> {
        self.store
            .get_match(id)
            .await?
            .ok_or_else(|| SwapError::not_found("match", id))
    }

    /// Pending intents younger than the expiry horizon, oldest first
    pub async fn list_active(&self) -> SwapResult<Vec<Intent>> {
        let now = self.clock.now();
        let mut active: Vec<Intent> = self
            .store
            .list_intents()
            .await?
            .into_iter()
            .filter(|i| i.status == IntentStatus::Pending && self.is_fresh(i.created_at, now))
            .collect();
        active.sort_by_key(|i| i.created_at);
        Ok(active)
    }

    pub async fn intents_for(&self, address: &str) -> SwapResult<Vec<Intent>> {
        let address = Address::new(address);
        let mut intents: Vec<Intent> = self
            .store
            .list_intents()
            .await?
            .into_iter()
            .filter(|i| i.initiator == address)
            .collect();
        intents.sort_by_key(|i| i.created_at);
        Ok(intents)
    }

    pub async fn matches_for(&self, address: &str) -> SwapResult<Vec<Match>> {
        let address = Address::new(address);
        let mut matches: Vec<Match> = self
            .store
            .list_matches()
            .await?
            .into_iter()
            .filter(|m| m.initiator == address || m.matcher == address)
            .collect();
        matches.sort_by_key(|m| m.created_at);
        Ok(matches)
    }

    /// Apply `change` to an intent under compare-and-swap
    ///
    /// `change` returns whether it modified the record; unchanged records are
    /// not written. It may run more than once under contention.
    pub async fn modify_intent<F>(&self, id: &str, mut change: F) -> SwapResult<Intent>
    where
        F: FnMut(&mut Intent) -> SwapResult<bool> + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.require_intent(id).await?;
            let mut next = current.clone();
            if !change(&mut next)? {
                return Ok(current);
            }
            next.version = current.version + 1;
            next.updated_at = self.clock.now();

            if self.store.compare_and_swap_intent(current.version, &next).await? {
                return Ok(next);
            }
            debug!("Intent {} changed concurrently, retrying", id);
        }

        Err(SwapError::StateConflict(format!("intent {} is under contention", id)))
    }

    /// Apply `change` to a match under compare-and-swap
    pub async fn modify_match<F>(&self, id: &str, mut change: F) -> SwapResult<Match>
    where
        F: FnMut(&mut Match) -> SwapResult<bool> + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.require_match(id).await?;
            let mut next = current.clone();
            if !change(&mut next)? {
                return Ok(current);
            }
            next.version = current.version + 1;
            next.updated_at = self.clock.now();

            if self.store.compare_and_swap_match(current.version, &next).await? {
                return Ok(next);
            }
            debug!("Match {} changed concurrently, retrying", id);
        }

        Err(SwapError::StateConflict(format!("match {} is under contention", id)))
    }

    pub async fn update_intent(&self, id: &str, update: IntentUpdate) -> SwapResult<Intent> {
        self.modify_intent(id, |intent| {
            if let Some(status) = update.status {
                intent.transition(status)?;
            }
            if let Some(contract_id) = &update.contract_id {
                intent.contract_id = Some(contract_id.clone());
            }
            if let Some(tx_hash) = &update.tx_hash {
                intent.tx_hash = Some(tx_hash.clone());
            }
            Ok(true)
        })
        .await
    }

    pub async fn update_match(&self, id: &str, update: MatchUpdate) -> SwapResult<Match> {
        self.modify_match(id, |record| {
            if let Some(status) = update.status {
                record.transition(status)?;
            }
            if let Some(contract_id) = &update.contract_id {
                record.contract_id = Some(contract_id.clone());
            }
            if let Some(counterparty) = &update.counterparty_contract_id {
                record.counterparty_contract_id = Some(counterparty.clone());
            }
            if let Some(tx_hash) = &update.tx_hash {
                record.tx_hash = Some(tx_hash.clone());
            }
            Ok(true)
        })
        .await
    }

    /// Administrative bulk reset
    pub async fn clear(&self) -> SwapResult<(usize, usize)> {
        let (intents, matches) = self.store.clear().await?;
        info!("Cleared {} intents and {} matches", intents, matches);
        Ok((intents, matches))
    }

    pub async fn stats(&self) -> SwapResult<RegistryStats> {
        let stats = RegistryStats {
            active_intents: self.list_active().await?.len(),
            total_matches: self.store.list_matches().await?.len(),
        };
        crate::metrics::set_active_intents(stats.active_intents);
        Ok(stats)
    }

    /// Expire pending intents and never-funded matches past the horizon
    ///
    /// Matches with funds on-ledger are left to ledger observation and their
    /// timelocks.
    pub async fn sweep_expired(&self) -> SwapResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for intent in self.store.list_intents().await? {
            if intent.status == IntentStatus::Pending && !self.is_fresh(intent.created_at, now) {
                let expired = self
                    .modify_intent(&intent.id, |i| {
                        if i.status != IntentStatus::Pending {
                            return Ok(false);
                        }
                        i.status = IntentStatus::Expired;
                        Ok(true)
                    })
                    .await;
                match expired {
                    Ok(expired) if expired.status == IntentStatus::Expired => {
                        report.expired_intents += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Sweep skipped intent {}: {}", intent.id, e);
                        report.failed += 1;
                    }
                }
            }
        }

        for record in self.store.list_matches().await? {
            if record.status == MatchStatus::Matched && !self.is_fresh(record.created_at, now) {
                let expired = match self
                    .modify_match(&record.id, |m| {
                        if m.status != MatchStatus::Matched {
                            return Ok(false);
                        }
                        m.status = MatchStatus::Expired;
                        m.lease = None;
                        Ok(true)
                    })
                    .await
                {
                    Ok(expired) => expired,
                    Err(e) => {
                        warn!("Sweep skipped match {}: {}", record.id, e);
                        report.failed += 1;
                        continue;
                    }
                };
                if expired.status == MatchStatus::Expired {
                    report.expired_matches += 1;
                    let closed = self
                        .modify_intent(&record.intent_id, |i| {
                            if i.status.is_terminal() {
                                return Ok(false);
                            }
                            i.status = IntentStatus::Expired;
                            Ok(true)
                        })
                        .await;
                    if let Err(e) = closed {
                        warn!("Sweep could not expire intent {} of match {}: {}", record.intent_id, record.id, e);
                        report.failed += 1;
                    }
                }
            }
        }

        if report.expired_intents + report.expired_matches > 0 {
            info!(
                "Sweep expired {} intents and {} matches",
                report.expired_intents, report.expired_matches
            );
        }
        crate::metrics::record_sweep_expired("intent", report.expired_intents);
        crate::metrics::record_sweep_expired("match", report.expired_matches);
        Ok(report)
    }

    /// The intent's secret, released only to its initiator
    pub async fn secret_for(&self, intent_id: &str, requester: &Address) -> SwapResult<Secret> {
        let intent = self.require_intent(intent_id).await?;
        if *requester != intent.initiator {
            return Err(SwapError::Validation(format!(
                "only the initiator of intent {} holds its secret",
                intent_id
            )));
        }
        intent
            .secret
            .ok_or_else(|| SwapError::not_found("secret for intent", intent_id))
    }

    /// Claim single-writer rights on a match until `ttl_secs` from now
    pub async fn acquire_lease(&self, match_id: &str, holder: &str, ttl_secs: u64) -> SwapResult<Match> {
        let now = self.clock.now();
        self.modify_match(match_id, |record| {
            if let Some(lease) = &record.lease {
                if lease.is_held_by_other(holder, now) {
                    return Err(SwapError::StateConflict(format!(
                        "match {} is being driven by {}",
                        record.id, lease.holder
                    )));
                }
            }
            record.lease = Some(Lease {
                holder: holder.to_string(),
                expires_at: now + ttl_secs,
            });
            Ok(true)
        })
        .await
    }

    pub async fn release_lease(&self, match_id: &str, holder: &str) -> SwapResult<Match> {
        self.modify_match(match_id, |record| match &record.lease {
            Some(lease) if lease.holder == holder => {
                record.lease = None;
                Ok(true)
            }
            _ => Ok(false),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::intents::rates::StaticRates;
    use crate::store::MemoryStore;

    const NOW: u64 = 1_700_000_000;

    fn registry() -> (IntentRegistry, Arc<ManualClock>) {
        let settings = Settings::from_toml_str(crate::config::tests::SAMPLE).unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let registry = IntentRegistry::new(
            &settings,
            Arc::new(MemoryStore::new()),
            Arc::new(StaticRates::new(settings.rates.clone())),
            clock.clone(),
        );
        (registry, clock)
    }

    fn request(initiator: &str, from: &str, to: &str, amount: f64, from_net: &str, to_net: &str) -> NewIntent {
        NewIntent {
            initiator: initiator.into(),
            from_token: from.into(),
            to_token: to.into(),
            from_amount: amount,
            from_network: from_net.into(),
            to_network: to_net.into(),
            user_input: None,
        }
    }

    #[tokio::test]
    async fn test_create_intent_prices_and_locks() {
        let (registry, _) = registry();
        let intent = registry
            .create_intent(request("0xAAA", "avax", "eth", 1.0, "fuji", "sepolia"))
            .await
            .unwrap();

        assert_eq!(intent.status, IntentStatus::Pending);
        assert_eq!(intent.to_amount, 0.0135);
        assert_eq!(intent.initiator.as_str(), "0xaaa");
        assert_eq!(intent.timelock, NOW + 10800);
        let secret = intent.secret.as_ref().unwrap();
        assert!(Commitments::new(Default::default()).verify(secret, &intent.hash_lock));
    }

    #[tokio::test]
    async fn test_create_intent_validation() {
        let (registry, _) = registry();
        for bad in [
            request("", "AVAX", "ETH", 1.0, "fuji", "sepolia"),
            request("0xa", "AVAX", "ETH", 0.0, "fuji", "sepolia"),
            request("0xa", "AVAX", "ETH", -2.0, "fuji", "sepolia"),
            request("0xa", "", "ETH", 1.0, "fuji", "sepolia"),
            request("0xa", "AVAX", "ETH", 1.0, "fuji", "fuji"),
            request("0xa", "AVAX", "ETH", 1.0, "fuji", "mainnet"),
        ] {
            let err = registry.create_intent(bad).await.unwrap_err();
            assert!(matches!(err, SwapError::Validation(_)), "{:?}", err);
        }
    }

    #[tokio::test]
    async fn test_find_complementary_within_tolerance() {
        let (registry, _) = registry();
        let a = registry
            .create_intent(request("0xa", "AVAX", "ETH", 1.0, "fuji", "sepolia"))
            .await
            .unwrap();
        // 0.0135 ETH back; within 0.001 of A's toAmount
        let b = registry
            .create_intent(request("0xb", "ETH", "AVAX", 0.0139, "sepolia", "fuji"))
            .await
            .unwrap();
        // Outside the tolerance
        registry
            .create_intent(request("0xc", "ETH", "AVAX", 0.02, "sepolia", "fuji"))
            .await
            .unwrap();
        // Right amount, same direction
        registry
            .create_intent(request("0xd", "AVAX", "ETH", 0.0135, "fuji", "sepolia"))
            .await
            .unwrap();

        let found = registry.find_complementary(&a).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b.id);
    }

    #[tokio::test]
    async fn test_match_rules() {
        let (registry, _) = registry();
        let intent = registry
            .create_intent(request("0xa", "AVAX", "ETH", 1.0, "fuji", "sepolia"))
            .await
            .unwrap();

        let err = registry.match_intent(&intent.id, "0xA").await.unwrap_err();
        assert!(matches!(err, SwapError::Validation(_)));

        let err = registry.match_intent("missing", "0xb").await.unwrap_err();
        assert!(matches!(err, SwapError::NotFound { .. }));

        let (record, updated) = registry.match_intent(&intent.id, "0xb").await.unwrap();
        assert_eq!(record.status, MatchStatus::Matched);
        assert_eq!(record.hash_lock, intent.hash_lock);
        assert_eq!(updated.status, IntentStatus::Matched);
        assert_eq!(updated.match_id.as_deref(), Some(record.id.as_str()));

        let err = registry.match_intent(&intent.id, "0xc").await.unwrap_err();
        assert!(matches!(err, SwapError::StateConflict(_)));
        // Self-match stays a validation error even after matching
        let err = registry.match_intent(&intent.id, "0xa").await.unwrap_err();
        assert!(matches!(err, SwapError::Validation(_)));
    }

    #[tokio::test]
    async fn test_sweep_expires_stale_records() {
        let (registry, clock) = registry();
        let stale = registry
            .create_intent(request("0xa", "AVAX", "ETH", 1.0, "fuji", "sepolia"))
            .await
            .unwrap();
        let matched = registry
            .create_intent(request("0xb", "AVAX", "ETH", 2.0, "fuji", "sepolia"))
            .await
            .unwrap();
        let (record, _) = registry.match_intent(&matched.id, "0xc").await.unwrap();

        clock.advance(24 * 3600 - 1);
        assert_eq!(registry.sweep_expired().await.unwrap(), SweepReport::default());

        clock.advance(1);
        let fresh = registry
            .create_intent(request("0xd", "AVAX", "ETH", 3.0, "fuji", "sepolia"))
            .await
            .unwrap();
        let report = registry.sweep_expired().await.unwrap();
        assert_eq!(report.expired_intents, 1);
        assert_eq!(report.expired_matches, 1);

        let stale = registry.require_intent(&stale.id).await.unwrap();
        assert_eq!(stale.status, IntentStatus::Expired);
        assert_eq!(registry.require_match(&record.id).await.unwrap().status, MatchStatus::Expired);
        assert_eq!(registry.require_intent(&matched.id).await.unwrap().status, IntentStatus::Expired);
        assert_eq!(registry.require_intent(&fresh.id).await.unwrap().status, IntentStatus::Pending);
    }

    /// Memory store that refuses writes to one intent
    struct StuckIntentStore {
        inner: MemoryStore,
        stuck: std::sync::Mutex<Option<String>>,
    }

    #[async_trait::async_trait]
    impl MatchingStore for StuckIntentStore {
        async fn insert_intent(&self, intent: &Intent) -> SwapResult<()> {
            self.inner.insert_intent(intent).await
        }
        async fn get_intent(&self, id: &str) -> SwapResult<Option<Intent>> {
            self.inner.get_intent(id).await
        }
        async fn list_intents(&self) -> SwapResult<Vec<Intent>> {
            self.inner.list_intents().await
        }
        async fn compare_and_swap_intent(&self, expected_version: u64, intent: &Intent) -> SwapResult<bool> {
            if self.stuck.lock().unwrap().as_deref() == Some(intent.id.as_str()) {
                return Err(SwapError::Storage("row locked".into()));
            }
            self.inner.compare_and_swap_intent(expected_version, intent).await
        }
        async fn commit_match(&self, expected_intent_version: u64, intent: &Intent, record: &Match) -> SwapResult<bool> {
            self.inner.commit_match(expected_intent_version, intent, record).await
        }
        async fn get_match(&self, id: &str) -> SwapResult<Option<Match>> {
            self.inner.get_match(id).await
        }
        async fn list_matches(&self) -> SwapResult<Vec<Match>> {
            self.inner.list_matches().await
        }
        async fn compare_and_swap_match(&self, expected_version: u64, record: &Match) -> SwapResult<bool> {
            self.inner.compare_and_swap_match(expected_version, record).await
        }
        async fn clear(&self) -> SwapResult<(usize, usize)> {
            self.inner.clear().await
        }
        async fn get_checkpoint(&self, network: &str) -> SwapResult<Option<u64>> {
            self.inner.get_checkpoint(network).await
        }
        async fn save_checkpoint(&self, network: &str, cursor: u64) -> SwapResult<()> {
            self.inner.save_checkpoint(network, cursor).await
        }
        async fn health_check(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_sweep_continues_past_store_errors() {
        let settings = Settings::from_toml_str(crate::config::tests::SAMPLE).unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(StuckIntentStore {
            inner: MemoryStore::new(),
            stuck: std::sync::Mutex::new(None),
        });
        let registry = IntentRegistry::new(
            &settings,
            store.clone(),
            Arc::new(StaticRates::new(settings.rates.clone())),
            clock.clone(),
        );

        let stuck = registry
            .create_intent(request("0xa", "AVAX", "ETH", 1.0, "fuji", "sepolia"))
            .await
            .unwrap();
        let other = registry
            .create_intent(request("0xb", "AVAX", "ETH", 2.0, "fuji", "sepolia"))
            .await
            .unwrap();
        let funded = registry
            .create_intent(request("0xc", "AVAX", "ETH", 3.0, "fuji", "sepolia"))
            .await
            .unwrap();
        let (record, _) = registry.match_intent(&funded.id, "0xd").await.unwrap();
        *store.stuck.lock().unwrap() = Some(stuck.id.clone());

        clock.advance(86400);
        let report = registry.sweep_expired().await.unwrap();
        assert_eq!(report.expired_intents, 1);
        assert_eq!(report.expired_matches, 1);
        assert_eq!(report.failed, 1);

        assert_eq!(registry.require_intent(&stuck.id).await.unwrap().status, IntentStatus::Pending);
        assert_eq!(registry.require_intent(&other.id).await.unwrap().status, IntentStatus::Expired);
        assert_eq!(registry.require_match(&record.id).await.unwrap().status, MatchStatus::Expired);

        // Picked up once the store recovers
        *store.stuck.lock().unwrap() = None;
        let report = registry.sweep_expired().await.unwrap();
        assert_eq!(report.expired_intents, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_update_out_of_terminal_is_conflict() {
        let (registry, _) = registry();
        let intent = registry
            .create_intent(request("0xa", "AVAX", "ETH", 1.0, "fuji", "sepolia"))
            .await
            .unwrap();

        let cancelled = registry
            .update_intent(
                &intent.id,
                IntentUpdate {
                    status: Some(IntentStatus::Cancelled),
                    tx_hash: Some("0xfeed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cancelled.version, intent.version + 1);
        assert_eq!(cancelled.tx_hash.as_deref(), Some("0xfeed"));

        let err = registry
            .update_intent(
                &intent.id,
                IntentUpdate {
                    status: Some(IntentStatus::Pending),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::StateConflict(_)));
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let (registry, clock) = registry();
        let intent = registry
            .create_intent(request("0xa", "AVAX", "ETH", 1.0, "fuji", "sepolia"))
            .await
            .unwrap();
        let (record, _) = registry.match_intent(&intent.id, "0xb").await.unwrap();

        registry.acquire_lease(&record.id, "one", 60).await.unwrap();
        assert!(registry.acquire_lease(&record.id, "two", 60).await.is_err());
        // Re-entrant for the holder
        registry.acquire_lease(&record.id, "one", 60).await.unwrap();

        clock.advance(61);
        registry.acquire_lease(&record.id, "two", 60).await.unwrap();
        registry.release_lease(&record.id, "two").await.unwrap();
        assert!(registry.require_match(&record.id).await.unwrap().lease.is_none());
    }

    #[tokio::test]
    async fn test_secret_only_for_initiator() {
        let (registry, _) = registry();
        let intent = registry
            .create_intent(request("0xa", "AVAX", "ETH", 1.0, "fuji", "sepolia"))
            .await
            .unwrap();

        assert!(registry.secret_for(&intent.id, &Address::new("0xA")).await.is_ok());
        assert!(registry.secret_for(&intent.id, &Address::new("0xb")).await.is_err());
    }
}
