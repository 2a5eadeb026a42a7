//! Chain module - connections to the chains transactions are submitted to
//!
//! This module provides:
//! - The narrow collaborator traits the nonce tracker, the confirmation poller
//!   and the raw sender depend on
//! - Multi-RPC provider management with automatic failover
//! - Routing of chain queries by chain ID

pub mod provider;

pub use provider::ChainProvider;

use crate::config::Settings;
use crate::error::{SubmitterError, SubmitterResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, Bytes, Transaction, H256};
use std::sync::Arc;
use tracing::{info, warn};

/// Source of the chain's view of an account's next nonce
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PendingNonceSource: Send + Sync {
    /// Nonce the next transaction from `account` must carry, counting pending transactions
    async fn pending_nonce_at(&self, account: Address) -> SubmitterResult<u64>;
}

/// Lookup of a submitted transaction on any connected chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionLookup: Send + Sync {
    /// Returns the transaction and whether it is still pending
    async fn transaction_by_hash(
        &self,
        chain_id: u64,
        tx_hash: H256,
    ) -> SubmitterResult<(Transaction, bool)>;
}

/// Broadcast of an already-signed transaction
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionBroadcaster: Send + Sync {
    async fn send_raw_transaction(&self, chain_id: u64, raw: Bytes) -> SubmitterResult<H256>;
}

/// Manages connections to all configured chains
pub struct ChainManager {
    /// Chain providers indexed by chain ID
    providers: DashMap<u64, Arc<ChainProvider>>,
}

impl ChainManager {
    /// Create a new chain manager with all configured chains
    pub fn new(settings: &Settings) -> SubmitterResult<Self> {
        let providers = DashMap::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(chain_id = chain_config.chain_id, chain = %name, "Initializing chain");

            let provider = ChainProvider::new(chain_config.clone())?;
            providers.insert(chain_config.chain_id, Arc::new(provider));
        }

        if providers.is_empty() {
            return Err(SubmitterError::Config(
                "No chains could be initialized".to_string(),
            ));
        }

        Ok(Self { providers })
    }

    /// Get provider for a specific chain
    pub fn get_provider(&self, chain_id: u64) -> SubmitterResult<Arc<ChainProvider>> {
        self.providers
            .get(&chain_id)
            .map(|p| p.clone())
            .ok_or(SubmitterError::ChainNotFound { chain_id })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        // Collect first so no map guard is held across the RPC calls
        let providers: Vec<_> = self
            .providers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut results = Vec::with_capacity(providers.len());
        for (chain_id, provider) in providers {
            let healthy = provider.health_check().await;
            if !healthy {
                warn!(chain_id, chain = provider.name(), "Chain health check failed");
            }
            crate::metrics::record_chain_health(chain_id, healthy);
            results.push((chain_id, healthy));
        }

        results
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.providers.iter().map(|e| *e.key()).collect();
        chains.sort_unstable();
        chains
    }
}

#[async_trait]
impl TransactionLookup for ChainManager {
    async fn transaction_by_hash(
        &self,
        chain_id: u64,
        tx_hash: H256,
    ) -> SubmitterResult<(Transaction, bool)> {
        self.get_provider(chain_id)?
            .transaction_by_hash(tx_hash)
            .await
    }
}

#[async_trait]
impl TransactionBroadcaster for ChainManager {
    async fn send_raw_transaction(&self, chain_id: u64, raw: Bytes) -> SubmitterResult<H256> {
        self.get_provider(chain_id)?.send_raw_transaction(raw).await
    }
}
