//! Broadcast of pre-signed transactions with retry logic
//!
//! Produces the send operations the queue executes. Retries happen inside the
//! operation; the queue itself never retries.

use super::queue::TransactionSendFn;
use super::SubmittedTransaction;
use crate::chain::TransactionBroadcaster;
use crate::config::SenderConfig;
use crate::error::{SubmitterError, SubmitterResult};

use ethers::types::{Bytes, H256};
use ethers::utils::keccak256;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// How a node reply to a broadcast is handled
#[derive(Debug, PartialEq, Eq)]
enum BroadcastRejection {
    /// The node already has this exact transaction
    AlreadyKnown,
    NonceTooLow,
    InsufficientFunds,
    Retry,
}

fn classify_rejection(message: &str) -> BroadcastRejection {
    let message = message.to_ascii_lowercase();
    if message.contains("already known") || message.contains("known transaction") {
        BroadcastRejection::AlreadyKnown
    } else if message.contains("nonce too low") {
        BroadcastRejection::NonceTooLow
    } else if message.contains("insufficient funds") {
        BroadcastRejection::InsufficientFunds
    } else {
        BroadcastRejection::Retry
    }
}

/// Raw transaction sender with retry and error classification
pub struct RawTransactionSender {
    broadcaster: Arc<dyn TransactionBroadcaster>,
    config: SenderConfig,
}

impl RawTransactionSender {
    /// Create a new raw transaction sender
    pub fn new(broadcaster: Arc<dyn TransactionBroadcaster>, config: SenderConfig) -> Self {
        Self {
            broadcaster,
            config,
        }
    }

    /// Build a queue send operation for a signed transaction
    pub fn send_fn(self: &Arc<Self>, chain_id: u64, raw: Bytes) -> TransactionSendFn {
        let sender = self.clone();
        Box::new(move || async move { sender.broadcast(chain_id, raw).await }.boxed())
    }

    /// Broadcast with timeout and retries
    pub async fn broadcast(
        &self,
        chain_id: u64,
        raw: Bytes,
    ) -> SubmitterResult<SubmittedTransaction> {
        let max_attempts = self.config.max_retries.max(1);
        let send_timeout = Duration::from_secs(self.config.send_timeout_secs);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let result = timeout(
                send_timeout,
                self.broadcaster.send_raw_transaction(chain_id, raw.clone()),
            )
            .await;

            match result {
                Ok(Ok(tx_hash)) => {
                    info!(chain_id, tx_hash = ?tx_hash, attempt, max_attempts, "Transaction sent");
                    return Ok(SubmittedTransaction::new(chain_id, tx_hash));
                }
                Ok(Err(SubmitterError::Transaction(message))) => {
                    match classify_rejection(&message) {
                        BroadcastRejection::AlreadyKnown => {
                            let tx_hash = H256::from(keccak256(raw.as_ref()));
                            info!(chain_id, tx_hash = ?tx_hash, "Transaction already known to node");
                            return Ok(SubmittedTransaction::new(chain_id, tx_hash));
                        }
                        BroadcastRejection::NonceTooLow => {
                            warn!(chain_id, error = %message, "Nonce too low");
                            return Err(SubmitterError::Nonce { chain_id, message });
                        }
                        BroadcastRejection::InsufficientFunds => {
                            return Err(SubmitterError::InsufficientFunds { chain_id });
                        }
                        BroadcastRejection::Retry => {
                            warn!(
                                chain_id,
                                attempt,
                                max_attempts,
                                error = %message,
                                "Broadcast rejected"
                            );
                            last_error = Some(SubmitterError::Transaction(message));
                        }
                    }
                }
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(chain_id, attempt, max_attempts, error = %e, "Broadcast failed");
                    last_error = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(chain_id, attempt, max_attempts, "Transaction send timeout");
                    last_error = Some(SubmitterError::Timeout {
                        operation: "send transaction".to_string(),
                    });
                }
            }

            // Wait before retry
            if attempt < max_attempts {
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| SubmitterError::Transaction("Unknown error".to_string())))
    }
}
