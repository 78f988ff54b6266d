//! Ledger event types
//!
//! Defines the events emitted by deployed HTLC contracts, normalised across
//! ledger back-ends.

use crate::secret::{HashLock, Secret};
use crate::types::{Address, ContractId, TxRef};

/// Events emitted by an HTLC contract
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    /// Contract funded and INITIATED
    SwapInitiated {
        network: String,
        contract_id: ContractId,
        initiator: Address,
        participant: Address,
        hash_lock: HashLock,
        timelock: u64,
        amount: u128,
        created_at: u64,
        tx: TxRef,
    },

    /// Contract WITHDRAWN; carries the now-public secret
    SwapWithdrawn {
        network: String,
        contract_id: ContractId,
        secret: Secret,
        withdrawn_at: u64,
        tx: TxRef,
    },

    /// Contract REFUNDED to its creator
    SwapRefunded {
        network: String,
        contract_id: ContractId,
        refunded_at: u64,
        tx: TxRef,
    },

    /// Owner toggled the emergency stop
    EmergencyStopToggled {
        network: String,
        stopped: bool,
        tx: TxRef,
    },
}

impl LedgerEvent {
    /// Get the network this event was observed on
    pub fn network(&self) -> &str {
        match self {
            LedgerEvent::SwapInitiated { network, .. } => network,
            LedgerEvent::SwapWithdrawn { network, .. } => network,
            LedgerEvent::SwapRefunded { network, .. } => network,
            LedgerEvent::EmergencyStopToggled { network, .. } => network,
        }
    }

    /// Get the contract this event concerns, if any
    pub fn contract_id(&self) -> Option<ContractId> {
        match self {
            LedgerEvent::SwapInitiated { contract_id, .. }
            | LedgerEvent::SwapWithdrawn { contract_id, .. }
            | LedgerEvent::SwapRefunded { contract_id, .. } => Some(*contract_id),
            LedgerEvent::EmergencyStopToggled { .. } => None,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::SwapInitiated { .. } => "swap_initiated",
            LedgerEvent::SwapWithdrawn { .. } => "swap_withdrawn",
            LedgerEvent::SwapRefunded { .. } => "swap_refunded",
            LedgerEvent::EmergencyStopToggled { .. } => "emergency_stop_toggled",
        }
    }

    /// Check if this event ends the contract's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LedgerEvent::SwapWithdrawn { .. } | LedgerEvent::SwapRefunded { .. }
        )
    }
}

/// Events read from one ledger since a cursor
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub events: Vec<LedgerEvent>,
    /// Cursor to resume from; block number on EVM ledgers
    pub next_cursor: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let withdrawn = LedgerEvent::SwapWithdrawn {
            network: "sepolia".into(),
            contract_id: ContractId([1u8; 32]),
            secret: Secret::from_bytes([2u8; 32]),
            withdrawn_at: 100,
            tx: TxRef("0xabc".into()),
        };
        assert_eq!(withdrawn.network(), "sepolia");
        assert_eq!(withdrawn.contract_id(), Some(ContractId([1u8; 32])));
        assert_eq!(withdrawn.name(), "swap_withdrawn");
        assert!(withdrawn.is_terminal());

        let stop = LedgerEvent::EmergencyStopToggled {
            network: "fuji".into(),
            stopped: true,
            tx: TxRef("0xdef".into()),
        };
        assert_eq!(stop.contract_id(), None);
        assert!(!stop.is_terminal());
    }
}
