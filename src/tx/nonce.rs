//! Nonce tracking for reliable transaction submission
//!
//! Handles:
//! - Lazy seeding of each account from the chain's pending nonce
//! - Gap-free, duplicate-free allocation under concurrent callers
//! - Forgetting an account so it is re-seeded after a rejection
//!
//! One lock covers the whole table, including the chain query made while seeding
//! an account. Concurrent first calls for an account therefore query the chain
//! once, at the cost of unrelated accounts waiting on each other.

use crate::chain::PendingNonceSource;
use crate::error::SubmitterResult;

use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Hands out strictly increasing nonces per account
pub struct NonceTracker {
    /// Chain the accounts live on
    source: Arc<dyn PendingNonceSource>,
    /// Account -> last issued nonce
    nonces: Mutex<HashMap<Address, u64>>,
}

impl NonceTracker {
    /// Create a new nonce tracker
    pub fn new(source: Arc<dyn PendingNonceSource>) -> Self {
        Self {
            source,
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Get the next nonce for an account
    ///
    /// The first call for an account returns the chain's pending nonce; later calls
    /// return one more than the previous value without touching the chain. A failed
    /// chain query caches nothing, so the next call queries again.
    pub async fn get_nonce(&self, account: Address) -> SubmitterResult<u64> {
        let mut nonces = self.nonces.lock().await;

        if let Some(last) = nonces.get_mut(&account) {
            *last += 1;
            crate::metrics::record_nonce_allocated("cache");
            debug!(account = ?account, nonce = *last, "Allocated nonce");
            return Ok(*last);
        }

        let nonce = match self.source.pending_nonce_at(account).await {
            Ok(nonce) => nonce,
            Err(e) => {
                crate::metrics::record_nonce_query_failed();
                warn!(account = ?account, error = %e, "Failed to seed nonce from chain");
                return Err(e);
            }
        };

        nonces.insert(account, nonce);
        crate::metrics::record_nonce_allocated("chain");
        debug!(account = ?account, nonce, "Seeded nonce from chain");
        Ok(nonce)
    }

    /// Forget the cached nonce so the next allocation re-reads the chain
    ///
    /// Returns whether the account was tracked.
    pub async fn reset(&self, account: Address) -> bool {
        let removed = self.nonces.lock().await.remove(&account).is_some();
        if removed {
            debug!(account = ?account, "Nonce cache reset");
        }
        removed
    }

    /// Number of accounts with a cached nonce
    pub async fn tracked_accounts(&self) -> usize {
        self.nonces.lock().await.len()
    }
}
