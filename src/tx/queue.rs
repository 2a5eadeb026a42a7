//! Single-consumer transaction submission queue
//!
//! Callers hand the queue a send operation; one worker runs the operations
//! strictly one at a time in acceptance order, waits for each broadcast
//! transaction to leave the pending pool, and answers every accepted submission
//! exactly once.
//!
//! Lifecycle: `Running` until [`TransactionQueue::stop`], then `Stopping` while
//! the worker answers everything still buffered with
//! [`SubmitterError::QueueClosed`], then `Stopped`.
//!
//! Acceptance is a single step: an enqueue either reserves buffer space before
//! the shutdown signal wins, in which case the item is accepted and will be
//! answered (processed or drained), or it returns `QueueClosed`. A caller blocked
//! on a full buffer is released by shutdown instead of waiting forever.

use super::confirm::{ConfirmationPoller, DEFAULT_POLL_INTERVAL};
use super::response::{response_channel, PendingSubmission, QueueResponse, Responder};
use super::SubmittedTransaction;
use crate::chain::TransactionLookup;
use crate::config::QueueConfig;
use crate::error::{SubmitterError, SubmitterResult};

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Future produced by a send operation
pub type SendFuture = BoxFuture<'static, SubmitterResult<SubmittedTransaction>>;

/// Zero-argument operation that signs and broadcasts one transaction
pub type TransactionSendFn = Box<dyn FnOnce() -> SendFuture + Send>;

/// Queue lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueState {
    Running = 0,
    Stopping = 1,
    Stopped = 2,
}

impl QueueState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => QueueState::Running,
            1 => QueueState::Stopping,
            _ => QueueState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Running => "running",
            QueueState::Stopping => "stopping",
            QueueState::Stopped => "stopped",
        }
    }
}

struct QueueEntry {
    send: TransactionSendFn,
    responder: Responder,
    enqueued_at: Instant,
}

/// State shared by the handles and the worker
struct QueueShared {
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl QueueShared {
    fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Cloneable handle for enqueuing submissions and stopping the queue
#[derive(Clone)]
pub struct TransactionQueue {
    sender: mpsc::Sender<QueueEntry>,
    shared: Arc<QueueShared>,
    capacity: usize,
}

impl TransactionQueue {
    /// Create a queue buffering up to `capacity` submissions
    ///
    /// Nothing is processed until the returned worker runs. A capacity of zero is
    /// treated as one.
    pub fn new(
        capacity: usize,
        lookup: Arc<dyn TransactionLookup>,
        confirmation_timeout: Duration,
    ) -> (Self, QueueWorker) {
        Self::with_poll_interval(capacity, lookup, confirmation_timeout, DEFAULT_POLL_INTERVAL)
    }

    /// Create a queue from configuration
    pub fn from_config(
        config: &QueueConfig,
        lookup: Arc<dyn TransactionLookup>,
    ) -> (Self, QueueWorker) {
        Self::with_poll_interval(
            config.capacity,
            lookup,
            config.confirmation_timeout(),
            config.poll_interval(),
        )
    }

    pub fn with_poll_interval(
        capacity: usize,
        lookup: Arc<dyn TransactionLookup>,
        confirmation_timeout: Duration,
        poll_interval: Duration,
    ) -> (Self, QueueWorker) {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();
        let shared = Arc::new(QueueShared {
            state: AtomicU8::new(QueueState::Running as u8),
            shutdown: shutdown.clone(),
        });

        let queue = Self {
            sender,
            shared: shared.clone(),
            capacity,
        };
        let worker = QueueWorker {
            receiver,
            shared,
            poller: ConfirmationPoller::new(lookup, poll_interval, shutdown),
            confirmation_timeout,
            capacity,
        };

        (queue, worker)
    }

    /// Enqueue a send operation
    ///
    /// Fails immediately with `QueueClosed` once a shutdown was requested. Waits
    /// for buffer space while the queue is full. The returned submission resolves
    /// exactly once with the outcome.
    pub async fn enqueue<F, Fut>(&self, send: F) -> SubmitterResult<PendingSubmission>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SubmitterResult<SubmittedTransaction>> + Send + 'static,
    {
        self.enqueue_boxed(Box::new(move || send().boxed())).await
    }

    /// Enqueue an already boxed send operation
    pub async fn enqueue_boxed(
        &self,
        send: TransactionSendFn,
    ) -> SubmitterResult<PendingSubmission> {
        if self.shared.shutdown.is_cancelled() {
            return Err(self.reject());
        }

        let permit = tokio::select! {
            biased;

            _ = self.shared.shutdown.cancelled() => None,
            reserved = self.sender.reserve() => reserved.ok(),
        };

        let Some(permit) = permit else {
            return Err(self.reject());
        };

        let (responder, pending) = response_channel(Uuid::new_v4());
        debug!(submission_id = %pending.id(), "Transaction enqueued");

        permit.send(QueueEntry {
            send,
            responder,
            enqueued_at: Instant::now(),
        });

        crate::metrics::record_enqueued();
        crate::metrics::set_queue_depth(self.depth());
        Ok(pending)
    }

    /// Request shutdown
    ///
    /// Safe to call any number of times from any number of tasks. Returns `true`
    /// only for the call that moved the queue out of `Running`.
    pub fn stop(&self) -> bool {
        let initiated = self
            .shared
            .state
            .compare_exchange(
                QueueState::Running as u8,
                QueueState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if initiated {
            info!("Transaction queue shutdown initiated");
            self.shared.shutdown.cancel();
        }

        initiated
    }

    pub fn state(&self) -> QueueState {
        self.shared.state()
    }

    /// Submissions buffered behind the one in flight
    pub fn depth(&self) -> usize {
        self.capacity.saturating_sub(self.sender.capacity())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn reject(&self) -> SubmitterError {
        crate::metrics::record_rejected();
        debug!("Rejected enqueue on closed queue");
        SubmitterError::QueueClosed
    }
}

/// The queue's only consumer
pub struct QueueWorker {
    receiver: mpsc::Receiver<QueueEntry>,
    shared: Arc<QueueShared>,
    poller: ConfirmationPoller,
    confirmation_timeout: Duration,
    capacity: usize,
}

impl QueueWorker {
    /// Run the worker on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process submissions until shutdown, then drain
    pub async fn run(mut self) {
        info!(
            capacity = self.capacity,
            confirmation_timeout_secs = self.confirmation_timeout.as_secs(),
            "Transaction queue started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shared.shutdown.cancelled() => {
                    self.drain().await;
                    break;
                }

                entry = self.receiver.recv() => match entry {
                    Some(entry) => self.process(entry).await,
                    None => {
                        info!("All queue handles dropped");
                        break;
                    }
                },
            }
        }
    }

    async fn process(&self, entry: QueueEntry) {
        let QueueEntry {
            send,
            responder,
            enqueued_at,
        } = entry;
        let id = responder.id();

        crate::metrics::set_queue_depth(self.receiver.len());
        debug!(
            submission_id = %id,
            waited_ms = enqueued_at.elapsed().as_millis() as u64,
            "Executing send operation"
        );

        let tx = match send().await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(submission_id = %id, error = %e, "Send operation failed");
                crate::metrics::record_send_failed();
                responder.respond(QueueResponse::Failed(e));
                return;
            }
        };

        info!(
            submission_id = %id,
            chain_id = tx.chain_id,
            tx_hash = ?tx.hash,
            "Transaction sent, waiting for confirmation"
        );

        let started = Instant::now();
        let response = match self
            .poller
            .wait_for_confirmation(tx.chain_id, tx.hash, self.confirmation_timeout)
            .await
        {
            Ok(()) => {
                crate::metrics::record_tx_confirmed(tx.chain_id, started.elapsed().as_secs_f64());
                info!(submission_id = %id, tx_hash = ?tx.hash, "Transaction confirmed");
                QueueResponse::Submitted(tx)
            }
            Err(e) => {
                crate::metrics::record_tx_unconfirmed(tx.chain_id);
                warn!(submission_id = %id, tx_hash = ?tx.hash, error = %e, "Transaction unconfirmed");
                QueueResponse::Failed(e)
            }
        };

        responder.respond(response);
    }

    /// Answer everything still buffered with `QueueClosed`
    async fn drain(&mut self) {
        self.receiver.close();

        let mut drained = 0usize;
        while let Some(entry) = self.receiver.recv().await {
            debug!(submission_id = %entry.responder.id(), "Draining submission");
            entry
                .responder
                .respond(QueueResponse::Failed(SubmitterError::QueueClosed));
            drained += 1;
        }

        crate::metrics::record_drained(drained);
        info!(drained, "Transaction queue drained");
    }
}

/// Leaving the worker by any path, including a panicking send operation, ends the lifecycle
impl Drop for QueueWorker {
    fn drop(&mut self) {
        let previous = self
            .shared
            .state
            .swap(QueueState::Stopped as u8, Ordering::AcqRel);
        crate::metrics::set_queue_depth(0);
        info!(
            previous = QueueState::from_u8(previous).as_str(),
            "Transaction queue stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockTransactionLookup;
    use ethers::types::{Transaction, H256};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;
    use tokio_test::{assert_pending, assert_ready};

    fn confirming_lookup() -> Arc<MockTransactionLookup> {
        let mut lookup = MockTransactionLookup::new();
        lookup
            .expect_transaction_by_hash()
            .returning(|_, _| Ok((Transaction::default(), false)));
        Arc::new(lookup)
    }

    fn pending_lookup(pending_polls: usize) -> Arc<MockTransactionLookup> {
        let calls = AtomicUsize::new(0);
        let mut lookup = MockTransactionLookup::new();
        lookup.expect_transaction_by_hash().returning(move |_, _| {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok((Transaction::default(), n < pending_polls))
        });
        Arc::new(lookup)
    }

    fn tx(byte: u8) -> SubmittedTransaction {
        SubmittedTransaction::new(1, H256::repeat_byte(byte))
    }

    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "elapsed {:?}, expected {:?}",
            elapsed,
            expected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_after_three_pending_polls() {
        let (queue, worker) =
            TransactionQueue::new(1, pending_lookup(3), Duration::from_secs(5));
        let handle = worker.spawn();

        let start = Instant::now();
        let pending = queue.enqueue(|| async { Ok(tx(0xaa)) }).await.unwrap();
        let result = pending.await.result();

        assert_eq!(result.unwrap(), tx(0xaa));
        assert_elapsed(start, Duration::from_secs(3));

        queue.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_after_timeout() {
        let (queue, worker) =
            TransactionQueue::new(1, pending_lookup(usize::MAX), Duration::from_secs(2));
        let handle = worker.spawn();

        let start = Instant::now();
        let pending = queue.enqueue(|| async { Ok(tx(0xaa)) }).await.unwrap();
        let result = pending.await.result();

        match result {
            Err(SubmitterError::TransactionMissing { tx_hash }) => {
                assert_eq!(tx_hash, H256::repeat_byte(0xaa))
            }
            other => panic!("expected unconfirmed failure, got {:?}", other),
        }
        assert_elapsed(start, Duration::from_secs(2));

        queue.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_skips_polling() {
        let mut lookup = MockTransactionLookup::new();
        lookup.expect_transaction_by_hash().never();

        let (queue, worker) = TransactionQueue::new(1, Arc::new(lookup), Duration::from_secs(2));
        let handle = worker.spawn();

        let pending = queue
            .enqueue(|| async { Err(SubmitterError::Transaction("signing failed".to_string())) })
            .await
            .unwrap();

        match pending.await.result() {
            Err(SubmitterError::Transaction(msg)) => assert_eq!(msg, "signing failed"),
            other => panic!("expected send failure, got {:?}", other),
        }

        queue.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_processes_in_fifo_order() {
        let (queue, worker) = TransactionQueue::new(8, confirming_lookup(), Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut submissions = Vec::new();
        for i in 0..5u8 {
            let order = order.clone();
            let pending = queue
                .enqueue(move || async move {
                    order.lock().unwrap().push(i);
                    Ok(tx(i))
                })
                .await
                .unwrap();
            submissions.push(pending);
        }
        assert_eq!(queue.depth(), 5);

        let handle = worker.spawn();
        for (i, pending) in submissions.into_iter().enumerate() {
            assert_eq!(pending.await.result().unwrap(), tx(i as u8));
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);

        queue.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_item_gets_one_result() {
        let (queue, worker) = TransactionQueue::new(4, confirming_lookup(), Duration::from_secs(5));
        let handle = worker.spawn();

        let producers: Vec<_> = (0..20u8)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let pending = queue
                        .enqueue(move || async move {
                            if i % 3 == 0 {
                                Err(SubmitterError::Transaction(format!("failed {}", i)))
                            } else {
                                Ok(tx(i))
                            }
                        })
                        .await?;
                    Ok::<_, SubmitterError>(pending.await)
                })
            })
            .collect();

        let mut submitted = 0;
        let mut failed = 0;
        for producer in producers {
            match producer.await.unwrap().unwrap() {
                QueueResponse::Submitted(_) => submitted += 1,
                QueueResponse::Failed(SubmitterError::Transaction(_)) => failed += 1,
                other => panic!("unexpected response {:?}", other),
            }
        }
        assert_eq!(submitted, 13);
        assert_eq!(failed, 7);

        queue.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_buffered_items_with_closed_error() {
        let (queue, worker) = TransactionQueue::new(4, confirming_lookup(), Duration::from_secs(5));
        let executed = Arc::new(AtomicBool::new(false));

        let mut submissions = Vec::new();
        for i in 0..3u8 {
            let executed = executed.clone();
            submissions.push(
                queue
                    .enqueue(move || async move {
                        executed.store(true, std::sync::atomic::Ordering::SeqCst);
                        Ok(tx(i))
                    })
                    .await
                    .unwrap(),
            );
        }

        assert!(queue.stop());
        assert_eq!(queue.state(), QueueState::Stopping);
        worker.run().await;

        for pending in submissions {
            assert!(matches!(
                pending.await.result(),
                Err(SubmitterError::QueueClosed)
            ));
        }
        assert!(!executed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(queue.state(), QueueState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_stop_is_rejected() {
        let (queue, worker) = TransactionQueue::new(4, confirming_lookup(), Duration::from_secs(5));
        let handle = worker.spawn();
        queue.stop();

        let executed = Arc::new(AtomicBool::new(false));
        let flag = executed.clone();
        let result = queue
            .enqueue(move || async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(tx(1))
            })
            .await;

        assert!(matches!(result, Err(SubmitterError::QueueClosed)));
        handle.await.unwrap();
        assert!(!executed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stop_transitions_once() {
        let (queue, worker) = TransactionQueue::new(4, confirming_lookup(), Duration::from_secs(5));
        let handle = worker.spawn();

        let stoppers: Vec<_> = (0..16)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.stop() })
            })
            .collect();

        let mut initiated = 0;
        for stopper in stoppers {
            if stopper.await.unwrap() {
                initiated += 1;
            }
        }

        assert_eq!(initiated, 1);
        assert!(!queue.stop());
        handle.await.unwrap();
        assert_eq!(queue.state(), QueueState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_applies_backpressure_until_shutdown() {
        let (queue, worker) = TransactionQueue::new(1, confirming_lookup(), Duration::from_secs(5));

        let first = queue.enqueue(|| async { Ok(tx(1)) }).await.unwrap();

        let blocked_queue = queue.clone();
        let mut blocked =
            tokio_test::task::spawn(async move { blocked_queue.enqueue(|| async { Ok(tx(2)) }).await });
        assert_pending!(blocked.poll());

        queue.stop();
        assert!(blocked.is_woken());
        let result = assert_ready!(blocked.poll());
        assert!(matches!(result, Err(SubmitterError::QueueClosed)));

        worker.run().await;
        assert!(matches!(first.await.result(), Err(SubmitterError::QueueClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_releases_when_worker_frees_space() {
        let (queue, worker) = TransactionQueue::new(1, confirming_lookup(), Duration::from_secs(5));

        let first = queue.enqueue(|| async { Ok(tx(1)) }).await.unwrap();

        let blocked_queue = queue.clone();
        let second = tokio::spawn(async move {
            blocked_queue.enqueue(|| async { Ok(tx(2)) }).await
        });
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        let handle = worker.spawn();
        assert_eq!(first.await.result().unwrap(), tx(1));
        let second = second.await.unwrap().unwrap();
        assert_eq!(second.await.result().unwrap(), tx(2));

        queue.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_confirmation_reports_submission() {
        let (queue, worker) =
            TransactionQueue::new(1, pending_lookup(usize::MAX), Duration::from_secs(60));
        let handle = worker.spawn();

        let pending = queue.enqueue(|| async { Ok(tx(0xbb)) }).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        queue.stop();

        assert_eq!(pending.await.result().unwrap(), tx(0xbb));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_exits_when_handles_dropped() {
        let (queue, worker) = TransactionQueue::new(1, confirming_lookup(), Duration::from_secs(5));
        let observer = queue.shared.clone();
        drop(queue);

        worker.run().await;
        assert_eq!(observer.state(), QueueState::Stopped);
    }

    #[tokio::test]
    async fn test_crashed_worker_reports_missing_results_and_stops() {
        let (queue, worker) = TransactionQueue::new(2, confirming_lookup(), Duration::from_secs(5));

        let in_flight = queue
            .enqueue(|| async {
                let crashed = true;
                if crashed {
                    panic!("send operation crashed");
                }
                Ok(tx(1))
            })
            .await
            .unwrap();
        let buffered = queue.enqueue(|| async { Ok(tx(2)) }).await.unwrap();

        let handle = worker.spawn();

        assert!(matches!(
            in_flight.await.result(),
            Err(SubmitterError::MissingResult)
        ));
        assert!(matches!(
            buffered.await.result(),
            Err(SubmitterError::MissingResult)
        ));
        assert!(handle.await.unwrap_err().is_panic());

        assert_eq!(queue.state(), QueueState::Stopped);
        assert!(matches!(
            queue.enqueue(|| async { Ok(tx(3)) }).await,
            Err(SubmitterError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let (queue, worker) = TransactionQueue::new(0, confirming_lookup(), Duration::from_secs(5));
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.state(), QueueState::Running);

        drop(worker);
        assert_eq!(queue.state(), QueueState::Stopped);
    }
}
