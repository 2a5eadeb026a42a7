//! Single-use result delivery for queued submissions
//!
//! Every accepted submission is paired with exactly one [`Responder`] and one
//! [`PendingSubmission`]. The responder is consumed by the write, so a second
//! response cannot be expressed; the pending side resolves once, either to the
//! written response or, if the responder was dropped unused, to
//! [`SubmitterError::MissingResult`].

use crate::error::{SubmitterError, SubmitterResult};

use ethers::types::H256;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

/// Handle of a transaction that a send operation broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmittedTransaction {
    pub chain_id: u64,
    pub hash: H256,
}

impl SubmittedTransaction {
    pub fn new(chain_id: u64, hash: H256) -> Self {
        Self { chain_id, hash }
    }
}

/// Outcome of one queued submission
#[derive(Debug)]
pub enum QueueResponse {
    /// Broadcast and no longer pending, or still in flight when the queue shut down
    Submitted(SubmittedTransaction),
    Failed(SubmitterError),
}

impl QueueResponse {
    /// Extracts the transaction or the failure
    pub fn result(self) -> SubmitterResult<SubmittedTransaction> {
        match self {
            QueueResponse::Submitted(tx) => Ok(tx),
            QueueResponse::Failed(err) => Err(err),
        }
    }

    pub fn is_submitted(&self) -> bool {
        matches!(self, QueueResponse::Submitted(_))
    }
}

/// Creates the write and read halves for one submission
pub fn response_channel(id: Uuid) -> (Responder, PendingSubmission) {
    let (tx, rx) = oneshot::channel();
    (Responder { id, tx }, PendingSubmission { id, rx })
}

/// Write half, owned by the queue from acceptance until completion
#[derive(Debug)]
pub struct Responder {
    id: Uuid,
    tx: oneshot::Sender<QueueResponse>,
}

impl Responder {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Delivers the response and closes the channel
    pub fn respond(self, response: QueueResponse) {
        if self.tx.send(response).is_err() {
            debug!(submission_id = %self.id, "Caller stopped waiting for queue response");
        }
    }
}

/// Read half returned to the enqueuing caller; resolves exactly once
#[derive(Debug)]
pub struct PendingSubmission {
    id: Uuid,
    rx: oneshot::Receiver<QueueResponse>,
}

impl PendingSubmission {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for PendingSubmission {
    type Output = QueueResponse;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                error!(submission_id = %id, "Queue dropped submission without a response");
                QueueResponse::Failed(SubmitterError::MissingResult)
            })
        })
    }
}
