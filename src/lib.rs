//! Transaction submitter
//!
//! Allocates per-account nonces, serializes signed-transaction submissions through
//! a single-consumer queue, and waits for every broadcast transaction to leave the
//! pending pool before reporting its outcome.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod tx;

pub use error::{SubmitterError, SubmitterResult};
pub use tx::{
    NonceTracker, PendingSubmission, QueueResponse, QueueState, QueueWorker,
    SubmittedTransaction, TransactionQueue,
};
