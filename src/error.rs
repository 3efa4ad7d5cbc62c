//! Error types for the escrow relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chain connection error: {message}")]
    ChainConnection { message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Broadcast rejected: {0}")]
    Broadcast(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Nonce error: {0}")]
    Nonce(String),

    #[error("Transaction {id} not found")]
    NotFound { id: String },

    #[error("Access denied")]
    Forbidden,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid address for {field}: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("Invalid transaction hash: {0}")]
    InvalidTxHash(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Transaction {id} already exists")]
    AlreadyExists { id: String },

    #[error("Transaction {id} already has forward tx {forward_tx_hash}")]
    AlreadyForwarded { id: String, forward_tx_hash: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Check if error is retryable on the next poll cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EscrowError::ChainConnection { .. }
                | EscrowError::Timeout { .. }
                | EscrowError::Storage(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            EscrowError::Wallet(_)
                | EscrowError::Broadcast(_)
                | EscrowError::AlreadyForwarded { .. }
        )
    }

    /// User-visible error category. Anything not listed collapses to
    /// `internal-error` so RPC and storage details stay server-side.
    pub fn kind(&self) -> &'static str {
        match self {
            EscrowError::MissingField(_) => "missing-field",
            EscrowError::InvalidAddress { .. } => "invalid-address",
            EscrowError::InvalidTxHash(_) => "invalid-tx-hash",
            EscrowError::InvalidAmount(_) => "invalid-amount",
            EscrowError::AlreadyExists { .. } => "already-exists",
            EscrowError::NotFound { .. } => "not-found",
            EscrowError::Forbidden => "forbidden",
            _ => "internal-error",
        }
    }
}

/// Result type for relayer operations
pub type EscrowResult<T> = Result<T, EscrowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_errors_are_retryable_validation_errors_are_not() {
        let rpc = EscrowError::ChainConnection {
            message: "connection refused".to_string(),
        };
        assert!(rpc.is_retryable());
        assert!(!EscrowError::Broadcast("nonce too low".to_string()).is_retryable());
        assert!(!EscrowError::Forbidden.is_retryable());
    }

    #[test]
    fn internal_details_collapse_to_internal_error() {
        let rpc = EscrowError::ChainConnection {
            message: "http://node:8545 returned 502".to_string(),
        };
        assert_eq!(rpc.kind(), "internal-error");
        assert_eq!(EscrowError::Forbidden.kind(), "forbidden");
        assert_eq!(EscrowError::MissingField("sender").kind(), "missing-field");
    }
}
