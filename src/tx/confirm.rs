//! Confirmation polling for submitted transactions
//!
//! A transaction counts as confirmed as soon as the chain stops reporting it as
//! pending. Lookup failures are logged and retried on the next tick; only the
//! per-submission timeout turns into a failure. A queue shutdown ends the wait
//! without an error because the broadcast already happened.

use crate::chain::TransactionLookup;
use crate::error::{SubmitterError, SubmitterResult};

use ethers::types::H256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default cadence between pending checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polls a chain until a transaction leaves the pending pool
pub struct ConfirmationPoller {
    lookup: Arc<dyn TransactionLookup>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl ConfirmationPoller {
    pub fn new(
        lookup: Arc<dyn TransactionLookup>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            lookup,
            poll_interval,
            shutdown,
        }
    }

    /// Wait until the transaction is no longer pending, at most `limit`
    ///
    /// The first check runs immediately, then once per poll interval.
    pub async fn wait_for_confirmation(
        &self,
        chain_id: u64,
        tx_hash: H256,
        limit: Duration,
    ) -> SubmitterResult<()> {
        tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => {
                info!(
                    chain_id,
                    tx_hash = ?tx_hash,
                    "Queue stopping, abandoning confirmation wait"
                );
                Ok(())
            }

            waited = timeout(limit, self.poll_until_included(chain_id, tx_hash)) => {
                waited.unwrap_or(Err(SubmitterError::TransactionMissing { tx_hash }))
            }
        }
    }

    async fn poll_until_included(&self, chain_id: u64, tx_hash: H256) -> SubmitterResult<()> {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.lookup.transaction_by_hash(chain_id, tx_hash).await {
                Ok((_, false)) => {
                    debug!(chain_id, tx_hash = ?tx_hash, "Transaction no longer pending");
                    return Ok(());
                }
                Ok((_, true)) => {
                    debug!(chain_id, tx_hash = ?tx_hash, "Transaction still pending");
                }
                Err(e) => {
                    crate::metrics::record_poll_error(chain_id);
                    warn!(
                        chain_id,
                        tx_hash = ?tx_hash,
                        error = %e,
                        "Failed to get transaction by hash in queue"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockTransactionLookup;
    use ethers::types::Transaction;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "elapsed {:?}, expected {:?}",
            elapsed,
            expected
        );
    }

    fn poller(lookup: MockTransactionLookup, shutdown: CancellationToken) -> ConfirmationPoller {
        ConfirmationPoller::new(Arc::new(lookup), DEFAULT_POLL_INTERVAL, shutdown)
    }

    /// Lookup answering "pending" for the first `pending_polls` calls
    fn pending_for(pending_polls: usize, calls: Arc<AtomicUsize>) -> MockTransactionLookup {
        let mut lookup = MockTransactionLookup::new();
        lookup.expect_transaction_by_hash().returning(move |_, _| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok((Transaction::default(), n < pending_polls))
        });
        lookup
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirms_after_pending_polls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let poller = poller(pending_for(3, calls.clone()), CancellationToken::new());

        let start = Instant::now();
        poller
            .wait_for_confirmation(1, H256::repeat_byte(0xaa), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_elapsed(start, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_while_pending() {
        let calls = Arc::new(AtomicUsize::new(0));
        let poller = poller(pending_for(usize::MAX, calls), CancellationToken::new());
        let tx_hash = H256::repeat_byte(0xaa);

        let start = Instant::now();
        let result = poller
            .wait_for_confirmation(1, tx_hash, Duration::from_secs(2))
            .await;

        assert!(matches!(
            result,
            Err(SubmitterError::TransactionMissing { tx_hash: h }) if h == tx_hash
        ));
        assert_elapsed(start, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut lookup = MockTransactionLookup::new();
        lookup.expect_transaction_by_hash().returning(move |chain_id, tx_hash| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SubmitterError::TransactionNotFound { chain_id, tx_hash })
            } else {
                Ok((Transaction::default(), false))
            }
        });

        let poller = poller(lookup, CancellationToken::new());
        let result = poller
            .wait_for_confirmation(1, H256::zero(), Duration::from_secs(10))
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_wait_without_error() {
        let shutdown = CancellationToken::new();
        let poller = poller(
            pending_for(usize::MAX, Arc::new(AtomicUsize::new(0))),
            shutdown.clone(),
        );

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = poller
            .wait_for_confirmation(1, H256::zero(), Duration::from_secs(60))
            .await;

        assert!(result.is_ok());
        assert_elapsed(start, Duration::from_millis(1500));
    }
}
