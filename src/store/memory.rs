//! In-process matching store

use super::MatchingStore;
use crate::error::{SwapError, SwapResult};
use crate::intents::{Intent, Match};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Matching store backed by concurrent maps; per-key locking gives the CAS
#[derive(Default)]
pub struct MemoryStore {
    intents: DashMap<String, Intent>,
    matches: DashMap<String, Match>,
    checkpoints: DashMap<String, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MatchingStore for MemoryStore {
    async fn insert_intent(&self, intent: &Intent) -> SwapResult<()> {
        match self.intents.entry(intent.id.clone()) {
            Entry::Occupied(_) => Err(SwapError::StateConflict(format!(
                "intent {} already exists",
                intent.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(intent.clone());
                Ok(())
            }
        }
    }

    async fn get_intent(&self, id: &str) -> SwapResult<Option<Intent>> {
        Ok(self.intents.get(id).map(|i| i.clone()))
    }

    async fn list_intents(&self) -> SwapResult<Vec<Intent>> {
        Ok(self.intents.iter().map(|e| e.value().clone()).collect())
    }

    async fn compare_and_swap_intent(&self, expected_version: u64, intent: &Intent) -> SwapResult<bool> {
        match self.intents.get_mut(&intent.id) {
            Some(mut current) if current.version == expected_version => {
                *current = intent.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(SwapError::not_found("intent", intent.id.clone())),
        }
    }

    async fn commit_match(
        &self,
        expected_intent_version: u64,
        intent: &Intent,
        record: &Match,
    ) -> SwapResult<bool> {
        // The intent's shard lock is held until both writes are done
        let mut current = self
            .intents
            .get_mut(&intent.id)
            .ok_or_else(|| SwapError::not_found("intent", intent.id.clone()))?;
        if current.version != expected_intent_version {
            return Ok(false);
        }
        self.matches.insert(record.id.clone(), record.clone());
        *current = intent.clone();
        Ok(true)
    }

    async fn get_match(&self, id: &str) -> SwapResult<Option<Match>> {
        Ok(self.matches.get(id).map(|m| m.clone()))
    }

    async fn list_matches(&self) -> SwapResult<Vec<Match>> {
        Ok(self.matches.iter().map(|e| e.value().clone()).collect())
    }

    async fn compare_and_swap_match(&self, expected_version: u64, record: &Match) -> SwapResult<bool> {
        match self.matches.get_mut(&record.id) {
            Some(mut current) if current.version == expected_version => {
                *current = record.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(SwapError::not_found("match", record.id.clone())),
        }
    }

    async fn clear(&self) -> SwapResult<(usize, usize)> {
        let counts = (self.intents.len(), self.matches.len());
        self.intents.clear();
        self.matches.clear();
        Ok(counts)
    }

    async fn get_checkpoint(&self, network: &str) -> SwapResult<Option<u64>> {
        Ok(self.checkpoints.get(network).map(|c| *c))
    }

    async fn save_checkpoint(&self, network: &str, cursor: u64) -> SwapResult<()> {
        self.checkpoints.insert(network.to_string(), cursor);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intents::IntentStatus;
    use crate::secret::HashLock;
    use crate::types::Address;

    fn intent(id: &str) -> Intent {
        Intent {
            id: id.to_string(),
            initiator: Address::new("0xa1"),
            from_token: "AVAX".into(),
            to_token: "ETH".into(),
            from_amount: 1.0,
            to_amount: 0.0135,
            from_network: "fuji".into(),
            to_network: "sepolia".into(),
            status: IntentStatus::Pending,
            hash_lock: HashLock([1u8; 32]),
            secret: None,
            timelock: 10_800,
            user_input: None,
            contract_id: None,
            tx_hash: None,
            matched_by: None,
            match_id: None,
            created_at: 0,
            updated_at: 0,
            version: 0,
        }
    }

    #[test]
    fn test_stale_version_loses() {
        let store = MemoryStore::new();
        tokio_test::block_on(async {
            store.insert_intent(&intent("i-1")).await.unwrap();
            assert!(store.insert_intent(&intent("i-1")).await.is_err());

            let mut next = intent("i-1");
            next.version = 1;
            next.status = IntentStatus::Cancelled;
            assert!(store.compare_and_swap_intent(0, &next).await.unwrap());
            assert!(!store.compare_and_swap_intent(0, &next).await.unwrap());

            let stored = store.get_intent("i-1").await.unwrap().unwrap();
            assert_eq!(stored.status, IntentStatus::Cancelled);
            assert_eq!(stored.version, 1);
        });
    }

    #[test]
    fn test_missing_record_is_not_found() {
        let store = MemoryStore::new();
        let err = tokio_test::block_on(store.compare_and_swap_intent(0, &intent("nope"))).unwrap_err();
        assert!(matches!(err, SwapError::NotFound { kind: "intent", .. }));
    }

    #[test]
    fn test_checkpoints_per_network() {
        let store = MemoryStore::new();
        tokio_test::block_on(async {
            assert_eq!(store.get_checkpoint("fuji").await.unwrap(), None);
            store.save_checkpoint("fuji", 42).await.unwrap();
            assert_eq!(store.get_checkpoint("fuji").await.unwrap(), Some(42));
            assert_eq!(store.get_checkpoint("sepolia").await.unwrap(), None);
        });
    }
}
