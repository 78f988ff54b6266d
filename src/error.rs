//! Error types for the swap coordinator

use thiserror::Error;

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Network mismatch for {network}: expected chain {expected}, selected chain is {actual}")]
    NetworkMismatch {
        network: String,
        expected: u64,
        actual: u64,
    },

    #[error("Contract rejected call on {network}: {message}")]
    ContractRejection {
        network: String,
        reason: RejectionReason,
        message: String,
    },

    #[error("Transient RPC error on {network}: {message}")]
    TransientRpc { network: String, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a ledger contract refused a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    InvalidAmount,
    SelfParticipant,
    TimelockOutOfBounds,
    DuplicateContract,
    EmergencyStop,
    RateLimited,
    InvalidState,
    HashMismatch,
    NotParticipant,
    NotInitiator,
    TimelockNotExpired,
    InsufficientFunds,
    Reverted,
}

impl RejectionReason {
    /// Stable label used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::InvalidAmount => "invalid_amount",
            RejectionReason::SelfParticipant => "self_participant",
            RejectionReason::TimelockOutOfBounds => "timelock_out_of_bounds",
            RejectionReason::DuplicateContract => "duplicate_contract",
            RejectionReason::EmergencyStop => "emergency_stop",
            RejectionReason::RateLimited => "rate_limited",
            RejectionReason::InvalidState => "invalid_state",
            RejectionReason::HashMismatch => "hash_mismatch",
            RejectionReason::NotParticipant => "not_participant",
            RejectionReason::NotInitiator => "not_initiator",
            RejectionReason::TimelockNotExpired => "timelock_not_expired",
            RejectionReason::InsufficientFunds => "insufficient_funds",
            RejectionReason::Reverted => "reverted",
        }
    }

    /// Human-readable category shown next to the verbatim contract message
    pub fn category(&self) -> &'static str {
        match self {
            RejectionReason::InvalidAmount => "Amount must be greater than zero",
            RejectionReason::SelfParticipant => "Cannot create a swap with yourself",
            RejectionReason::TimelockOutOfBounds => "Timelock outside the allowed window",
            RejectionReason::DuplicateContract => "A swap with this hash lock is already active",
            RejectionReason::EmergencyStop => "Swaps are temporarily disabled (emergency stop)",
            RejectionReason::RateLimited => "Rate limit exceeded, wait before creating another swap",
            RejectionReason::InvalidState => "Swap is not in a state that allows this action",
            RejectionReason::HashMismatch => "Secret does not match the hash lock",
            RejectionReason::NotParticipant => "Only the named participant can withdraw",
            RejectionReason::NotInitiator => "Only the swap creator can refund",
            RejectionReason::TimelockNotExpired => "Refund is not possible before the timelock",
            RejectionReason::InsufficientFunds => "Insufficient balance for this swap",
            RejectionReason::Reverted => "Transaction reverted",
        }
    }
}

impl SwapError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        SwapError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn rejected(
        network: impl Into<String>,
        reason: RejectionReason,
        message: impl Into<String>,
    ) -> Self {
        SwapError::ContractRejection {
            network: network.into(),
            reason,
            message: message.into(),
        }
    }

    /// Check if error is retryable without any caller intervention
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapError::TransientRpc { .. } | SwapError::Timeout { .. }
        )
    }

    /// Check if the caller can recover by correcting a precondition first
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SwapError::NetworkMismatch { .. })
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            SwapError::ContractRejection {
                reason: RejectionReason::EmergencyStop,
                ..
            } | SwapError::Database(_)
                | SwapError::Storage(_)
        )
    }

    /// Rejection reason, if this is a contract rejection
    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            SwapError::ContractRejection { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Stable category label for API responses and metrics
    pub fn category(&self) -> &'static str {
        match self {
            SwapError::Validation(_) => "validation",
            SwapError::NotFound { .. } => "not_found",
            SwapError::StateConflict(_) => "state_conflict",
            SwapError::NetworkMismatch { .. } => "network_mismatch",
            SwapError::ContractRejection { .. } => "contract_rejection",
            SwapError::TransientRpc { .. } => "transient_rpc",
            SwapError::Timeout { .. } => "timeout",
            SwapError::Config(_) => "config",
            SwapError::Database(_) | SwapError::Storage(_) => "storage",
            SwapError::Internal(_) => "internal",
        }
    }

    /// Text shown to the end user
    pub fn user_message(&self) -> String {
        match self {
            SwapError::ContractRejection {
                reason, message, ..
            } => format!("{}: {}", reason.category(), message),
            SwapError::NetworkMismatch { network, .. } => {
                format!("Please switch to {} before retrying", network)
            }
            SwapError::TransientRpc { .. } | SwapError::Timeout { .. } => {
                "The network is not responding, please try again".to_string()
            }
            SwapError::Database(_) | SwapError::Storage(_) | SwapError::Internal(_) => {
                "Internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Result type for coordinator operations
pub type SwapResult<T> = Result<T, SwapError>;
