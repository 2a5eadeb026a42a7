//! Chain provider with multi-RPC support and automatic failover

use super::PendingNonceSource;
use crate::config::ChainConfig;
use crate::error::{SubmitterError, SubmitterResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig) -> SubmitterResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!(chain_id = config.chain_id, url = %url, "Added HTTP provider");
                }
                Err(e) => {
                    warn!(chain_id = config.chain_id, url = %url, error = %e, "Failed to create provider");
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SubmitterError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!(chain_id = self.config.chain_id, provider = next, "Failing over RPC provider");
    }

    /// Run a call against the active provider, moving to the next one on transport failures
    ///
    /// A JSON-RPC error reply came from a reachable node, so it is handed to
    /// `on_rejection` and returned without failing over.
    async fn with_failover<T, F, Fut>(
        &self,
        operation: &str,
        mut call: F,
        on_rejection: impl FnOnce(ProviderError) -> SubmitterError,
    ) -> SubmitterResult<T>
    where
        F: FnMut(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.http_providers.len();

        for attempt in 1..=attempts {
            match call(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if RpcError::as_error_response(&e).is_some() => return Err(on_rejection(e)),
                Err(e) => {
                    warn!(
                        chain_id = self.config.chain_id,
                        operation,
                        error = %e,
                        "RPC call failed"
                    );
                    if attempt < attempts {
                        self.failover();
                    }
                }
            }
        }

        Err(self.all_failed(operation))
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> SubmitterResult<u64> {
        self.with_failover(
            "get block number",
            |provider| async move { provider.get_block_number().await },
            |e| self.connection_error(e),
        )
        .await
        .map(|block| block.as_u64())
    }

    /// Get the pending-block transaction count for an account with failover
    pub async fn pending_transaction_count(&self, account: Address) -> SubmitterResult<u64> {
        self.with_failover(
            "get pending nonce",
            |provider| async move {
                provider
                    .get_transaction_count(account, Some(BlockNumber::Pending.into()))
                    .await
            },
            |e| self.connection_error(e),
        )
        .await
        .map(|count| count.as_u64())
    }

    /// Look up a transaction and report whether it is still pending
    pub async fn transaction_by_hash(&self, tx_hash: H256) -> SubmitterResult<(Transaction, bool)> {
        let tx = self
            .with_failover(
                "get transaction",
                |provider| async move { provider.get_transaction(tx_hash).await },
                |e| self.connection_error(e),
            )
            .await?
            .ok_or(SubmitterError::TransactionNotFound {
                chain_id: self.config.chain_id,
                tx_hash,
            })?;

        // Included transactions carry the block they were mined in
        let pending = tx.block_number.is_none();
        Ok((tx, pending))
    }

    /// Broadcast a signed transaction, failing over on unreachable endpoints
    ///
    /// Node rejections keep their original message so callers can classify them.
    pub async fn send_raw_transaction(&self, raw: Bytes) -> SubmitterResult<H256> {
        self.with_failover(
            "send raw transaction",
            |provider| {
                let raw = raw.clone();
                async move {
                    provider
                        .send_raw_transaction(raw)
                        .await
                        .map(|pending| pending.tx_hash())
                }
            },
            |e| SubmitterError::Transaction(e.to_string()),
        )
        .await
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!(chain_id = self.config.chain_id, error = %e, "Health check failed");
                false
            }
        }
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn connection_error(&self, e: ProviderError) -> SubmitterError {
        SubmitterError::ChainConnection {
            chain_id: self.config.chain_id,
            message: e.to_string(),
        }
    }

    fn all_failed(&self, operation: &str) -> SubmitterError {
        SubmitterError::ChainConnection {
            chain_id: self.config.chain_id,
            message: format!("All providers failed to {}", operation),
        }
    }
}

#[async_trait]
impl PendingNonceSource for ChainProvider {
    async fn pending_nonce_at(&self, account: Address) -> SubmitterResult<u64> {
        self.pending_transaction_count(account).await
    }
}
