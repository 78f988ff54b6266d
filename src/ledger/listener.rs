//! Ledger event listener with persisted cursor

use super::backoff::ExponentialBackoff;
use super::LedgerContract;
use crate::error::SwapResult;
use crate::events::LedgerEvent;
use crate::store::MatchingStore;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Polls one ledger for HTLC events and fans them out
pub struct LedgerListener {
    /// Network key
    network: String,
    /// Ledger being watched
    ledger: Arc<dyn LedgerContract>,
    /// Event broadcast channel
    event_tx: broadcast::Sender<LedgerEvent>,
    /// Store for cursor persistence
    store: Arc<dyn MatchingStore>,
    /// Next cursor to read from
    cursor: RwLock<u64>,
    poll_interval: Duration,
}

impl LedgerListener {
    /// Create a new listener, resuming from the stored cursor
    pub async fn new(
        network: &str,
        ledger: Arc<dyn LedgerContract>,
        event_tx: broadcast::Sender<LedgerEvent>,
        store: Arc<dyn MatchingStore>,
        poll_interval_ms: u64,
    ) -> SwapResult<Self> {
        let cursor = store.get_checkpoint(network).await?.unwrap_or(0);
        debug!("Network {}: listener resuming from cursor {}", network, cursor);

        Ok(Self {
            network: network.to_string(),
            ledger,
            event_tx,
            store,
            cursor: RwLock::new(cursor),
            poll_interval: Duration::from_millis(poll_interval_ms),
        })
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Main polling loop; returns once `shutdown` is set
    pub async fn listen(&self, shutdown: Arc<RwLock<bool>>) -> SwapResult<()> {
        info!("Listening for HTLC events on {}", self.network);
        let mut backoff = ExponentialBackoff::new(self.poll_interval.as_millis() as u64, 30_000);

        loop {
            if *shutdown.read().await {
                return Ok(());
            }

            let wait = match self.poll_once().await {
                Ok(_) => {
                    backoff.on_success();
                    backoff.interval()
                }
                Err(e) => {
                    // Cursor not advanced; the same range is read again
                    warn!("Network {}: failed to poll events: {}", self.network, e);
                    backoff.on_failure(&e.to_string())
                }
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Read and broadcast everything after the cursor
    pub async fn poll_once(&self) -> SwapResult<usize> {
        let from = *self.cursor.read().await;
        let batch = self.ledger.poll_events(from).await?;
        let count = batch.events.len();

        for event in batch.events {
            debug!("Network {} event: {}", self.network, event.name());
            crate::metrics::record_event(&self.network, event.name());

            // No receivers is fine
            let _ = self.event_tx.send(event);
        }

        if batch.next_cursor != from {
            *self.cursor.write().await = batch.next_cursor;
            if let Err(e) = self.store.save_checkpoint(&self.network, batch.next_cursor).await {
                warn!("Network {}: failed to save checkpoint: {}", self.network, e);
            }
        }

        Ok(count)
    }
}
