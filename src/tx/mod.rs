//! Transaction submission module with nonce tracking and confirmation polling

mod confirm;
mod nonce;
mod queue;
mod response;
mod sender;

pub use confirm::{ConfirmationPoller, DEFAULT_POLL_INTERVAL};
pub use nonce::NonceTracker;
pub use queue::{QueueState, QueueWorker, SendFuture, TransactionQueue, TransactionSendFn};
pub use response::{response_channel, PendingSubmission, QueueResponse, Responder, SubmittedTransaction};
pub use sender::RawTransactionSender;
