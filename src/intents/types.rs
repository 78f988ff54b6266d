//! Intent and match records

use crate::error::{SwapError, SwapResult};
use crate::secret::{HashLock, Secret};
use crate::types::{Address, ContractId, TxRef};

use serde::{Deserialize, Serialize};

/// Lifecycle of an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Matched,
    Completed,
    Cancelled,
    Expired,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Completed | IntentStatus::Cancelled | IntentStatus::Expired
        )
    }

    /// Status changes an update may request. Entering `Matched` is reserved
    /// to matching, which also binds the match record.
    pub fn can_transition(&self, next: IntentStatus) -> bool {
        use IntentStatus::*;
        matches!(
            (self, next),
            (Pending, Completed | Cancelled | Expired) | (Matched, Completed | Cancelled | Expired)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Matched => "matched",
            IntentStatus::Completed => "completed",
            IntentStatus::Cancelled => "cancelled",
            IntentStatus::Expired => "expired",
        }
    }
}

/// Lifecycle of a match, ordered by protocol progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    InitiatorLocked,
    ParticipantLocked,
    SecretRevealed,
    Completed,
    Refunded,
    Expired,
}

impl MatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MatchStatus::Completed | MatchStatus::Refunded | MatchStatus::Expired
        )
    }

    /// Progress rank; observed statuses only ever move forward
    pub fn rank(&self) -> u8 {
        match self {
            MatchStatus::Matched => 0,
            MatchStatus::InitiatorLocked => 1,
            MatchStatus::ParticipantLocked => 2,
            MatchStatus::SecretRevealed => 3,
            MatchStatus::Completed | MatchStatus::Refunded | MatchStatus::Expired => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Matched => "matched",
            MatchStatus::InitiatorLocked => "initiator_locked",
            MatchStatus::ParticipantLocked => "participant_locked",
            MatchStatus::SecretRevealed => "secret_revealed",
            MatchStatus::Completed => "completed",
            MatchStatus::Refunded => "refunded",
            MatchStatus::Expired => "expired",
        }
    }
}

/// A declared desire to exchange one asset for another across ledgers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub id: String,
    pub initiator: Address,
    pub from_token: String,
    pub to_token: String,
    pub from_amount: f64,
    pub to_amount: f64,
    pub from_network: String,
    pub to_network: String,
    pub status: IntentStatus,
    pub hash_lock: HashLock,
    /// Held for the initiator only; never serialised
    #[serde(skip)]
    pub secret: Option<Secret>,
    pub timelock: u64,
    pub user_input: Option<String>,
    pub contract_id: Option<String>,
    pub tx_hash: Option<String>,
    pub matched_by: Option<Address>,
    pub match_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub version: u64,
}

impl Intent {
    /// Apply a requested status change; anything but a forward move is a conflict
    pub fn transition(&mut self, next: IntentStatus) -> SwapResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition(next) {
            return Err(SwapError::StateConflict(format!(
                "intent {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }
}

/// Where one side of a match is locked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRef {
    pub network: String,
    pub contract_id: ContractId,
    pub tx: Option<TxRef>,
}

/// Time-bounded single-writer claim on a match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub holder: String,
    pub expires_at: u64,
}

impl Lease {
    pub fn is_held_by_other(&self, holder: &str, now: u64) -> bool {
        self.holder != holder && now < self.expires_at
    }
}

/// A bound pair of complementary positions proceeding through the protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub id: String,
    pub intent_id: String,
    pub initiator: Address,
    pub matcher: Address,
    pub status: MatchStatus,
    pub from_token: String,
    pub to_token: String,
    pub from_amount: f64,
    pub to_amount: f64,
    pub from_network: String,
    pub to_network: String,
    pub hash_lock: HashLock,
    /// T1, on the initiator's contract
    pub initiator_timelock: Option<u64>,
    /// T2, on the participant's contract
    pub participant_timelock: Option<u64>,
    pub initiator_contract: Option<ContractRef>,
    pub participant_contract: Option<ContractRef>,
    /// Hex secret, only once it is public on-ledger
    pub revealed_secret: Option<String>,
    pub contract_id: Option<String>,
    pub counterparty_contract_id: Option<String>,
    pub tx_hash: Option<String>,
    pub lease: Option<Lease>,
    pub created_at: u64,
    pub updated_at: u64,
    pub version: u64,
}

impl Match {
    /// Move the status forward; stale or backward observations are ignored
    pub fn advance(&mut self, next: MatchStatus) -> bool {
        if self.status.is_terminal() || next.rank() <= self.status.rank() {
            return false;
        }
        self.status = next;
        true
    }

    /// Explicit status change from an operator; only forward moves out of a
    /// non-terminal status are accepted
    pub fn transition(&mut self, next: MatchStatus) -> SwapResult<()> {
        if self.status == next {
            return Ok(());
        }
        if self.status.is_terminal() || next.rank() <= self.status.rank() {
            return Err(SwapError::StateConflict(format!(
                "match {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Whether `contract_id` on `network` is one of this match's contracts
    pub fn side_of(&self, network: &str, contract_id: &ContractId) -> Option<Side> {
        let is = |c: &Option<ContractRef>| {
            c.as_ref()
                .map(|c| c.network == network && c.contract_id == *contract_id)
                .unwrap_or(false)
        };
        if is(&self.initiator_contract) {
            Some(Side::Initiator)
        } else if is(&self.participant_contract) {
            Some(Side::Participant)
        } else {
            None
        }
    }
}

/// Which contract of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// HTLC1, funded by the initiator on the source network
    Initiator,
    /// HTLC2, funded by the matcher on the destination network
    Participant,
}

/// Request to create an intent
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIntent {
    pub initiator: String,
    pub from_token: String,
    pub to_token: String,
    pub from_amount: f64,
    pub from_network: String,
    pub to_network: String,
    pub user_input: Option<String>,
}

/// Partial intent update
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentUpdate {
    pub status: Option<IntentStatus>,
    pub contract_id: Option<String>,
    pub tx_hash: Option<String>,
}

/// Partial match update
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchUpdate {
    pub status: Option<MatchStatus>,
    pub contract_id: Option<String>,
    pub counterparty_contract_id: Option<String>,
    pub tx_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_status_only_moves_forward() {
        let mut record = sample_match();
        assert!(record.advance(MatchStatus::ParticipantLocked));
        assert!(!record.advance(MatchStatus::InitiatorLocked));
        assert!(record.advance(MatchStatus::Completed));
        assert!(!record.advance(MatchStatus::Refunded));
        assert_eq!(record.status, MatchStatus::Completed);
        assert!(record.transition(MatchStatus::Matched).is_err());
    }

    #[test]
    fn test_operator_transitions_are_forward_only() {
        let mut record = sample_match();
        record.status = MatchStatus::ParticipantLocked;
        assert!(record.transition(MatchStatus::InitiatorLocked).is_err());
        assert!(record.transition(MatchStatus::Matched).is_err());
        assert!(record.transition(MatchStatus::ParticipantLocked).is_ok());
        assert!(record.transition(MatchStatus::Refunded).is_ok());
        assert!(record.transition(MatchStatus::Completed).is_err());

        use IntentStatus::*;
        assert!(!Matched.can_transition(Pending));
        assert!(!Pending.can_transition(Matched));
        assert!(!Expired.can_transition(Pending));
        assert!(Pending.can_transition(Cancelled));
        assert!(Matched.can_transition(Completed));
    }

    #[test]
    fn test_lease_expiry() {
        let lease = Lease {
            holder: "a".into(),
            expires_at: 100,
        };
        assert!(lease.is_held_by_other("b", 99));
        assert!(!lease.is_held_by_other("b", 100));
        assert!(!lease.is_held_by_other("a", 50));
    }

    #[test]
    fn test_status_serialisation() {
        assert_eq!(
            serde_json::to_string(&MatchStatus::InitiatorLocked).unwrap(),
            "\"initiator_locked\""
        );
        let status: IntentStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(status, IntentStatus::Cancelled);
    }

    pub(crate) fn sample_match() -> Match {
        Match {
            id: "m1".into(),
            intent_id: "i1".into(),
            initiator: Address::new("0xa"),
            matcher: Address::new("0xb"),
            status: MatchStatus::Matched,
            from_token: "AVAX".into(),
            to_token: "ETH".into(),
            from_amount: 1.0,
            to_amount: 0.0135,
            from_network: "fuji".into(),
            to_network: "sepolia".into(),
            hash_lock: HashLock([1u8; 32]),
            initiator_timelock: None,
            participant_timelock: None,
            initiator_contract: None,
            participant_contract: None,
            revealed_secret: None,
            contract_id: None,
            counterparty_contract_id: None,
            tx_hash: None,
            lease: None,
            created_at: 0,
            updated_at: 0,
            version: 0,
        }
    }
}
