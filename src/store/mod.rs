//! Matching store - durable keyed storage for intents, matches and cursors
//!
//! Every mutation of an existing record is a compare-and-swap on the record's
//! `version`, so concurrent writers racing on one key see exactly one winner.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::error::SwapResult;
use crate::intents::{Intent, Match};

use async_trait::async_trait;

#[async_trait]
pub trait MatchingStore: Send + Sync {
    /// Insert a new intent; fails if the id exists
    async fn insert_intent(&self, intent: &Intent) -> SwapResult<()>;

    async fn get_intent(&self, id: &str) -> SwapResult<Option<Intent>>;

    async fn list_intents(&self) -> SwapResult<Vec<Intent>>;

    /// Replace the intent if its stored version is still `expected_version`
    async fn compare_and_swap_intent(&self, expected_version: u64, intent: &Intent)
        -> SwapResult<bool>;

    /// Swap the intent and insert the match as one atomic step
    async fn commit_match(
        &self,
        expected_intent_version: u64,
        intent: &Intent,
        record: &Match,
    ) -> SwapResult<bool>;

    async fn get_match(&self, id: &str) -> SwapResult<Option<Match>>;

    async fn list_matches(&self) -> SwapResult<Vec<Match>>;

    /// Replace the match if its stored version is still `expected_version`
    async fn compare_and_swap_match(&self, expected_version: u64, record: &Match)
        -> SwapResult<bool>;

    /// Remove every intent and match; returns the removed counts
    async fn clear(&self) -> SwapResult<(usize, usize)>;

    async fn get_checkpoint(&self, network: &str) -> SwapResult<Option<u64>>;

    async fn save_checkpoint(&self, network: &str, cursor: u64) -> SwapResult<()>;

    async fn health_check(&self) -> bool;
}
