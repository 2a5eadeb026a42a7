//! Error types for the transaction submitter

use ethers::types::H256;
use thiserror::Error;

/// Main error type for nonce allocation, submission and confirmation
#[derive(Error, Debug)]
pub enum SubmitterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction {tx_hash:?} not found on chain {chain_id}")]
    TransactionNotFound { chain_id: u64, tx_hash: H256 },

    /// Enqueue after shutdown, or an item drained during shutdown.
    #[error("Queue was closed")]
    QueueClosed,

    /// The queue finished with an item without delivering either a transaction or an error.
    #[error("Transaction missing with no previous error, state unknown")]
    MissingResult,

    /// Sent to the chain but never observed as no longer pending.
    #[error("Transaction {tx_hash:?} failed in queue: transaction missing, state unknown")]
    TransactionMissing { tx_hash: H256 },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Insufficient funds on chain {chain_id}")]
    InsufficientFunds { chain_id: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SubmitterError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubmitterError::ChainConnection { .. }
                | SubmitterError::Timeout { .. }
                | SubmitterError::TransactionNotFound { .. }
        )
    }

    /// The transaction may or may not land; callers must re-check before acting.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, SubmitterError::TransactionMissing { .. })
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            SubmitterError::MissingResult | SubmitterError::InsufficientFunds { .. }
        )
    }
}

/// Result type for submitter operations
pub type SubmitterResult<T> = Result<T, SubmitterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfirmed_is_unknown_outcome_not_retryable() {
        let err = SubmitterError::TransactionMissing {
            tx_hash: H256::repeat_byte(0xaa),
        };
        assert!(err.is_unknown_outcome());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("state unknown"));
    }

    #[test]
    fn test_missing_result_alerts() {
        assert!(SubmitterError::MissingResult.should_alert());
        assert!(!SubmitterError::QueueClosed.should_alert());
        assert!(!SubmitterError::QueueClosed.is_unknown_outcome());
    }
}
