//! HTTP API for nonce allocation, transaction submission, health and status

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::error::{SubmitterError, SubmitterResult};
use crate::tx::{NonceTracker, QueueResponse, RawTransactionSender, TransactionQueue};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::{Address, Bytes, H256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub queue: TransactionQueue,
    pub nonce_trackers: Arc<DashMap<u64, Arc<NonceTracker>>>,
    pub chain_manager: Arc<ChainManager>,
    pub sender: Arc<RawTransactionSender>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    fn nonce_tracker(&self, chain_id: u64) -> SubmitterResult<Arc<NonceTracker>> {
        self.nonce_trackers
            .get(&chain_id)
            .map(|t| t.clone())
            .ok_or(SubmitterError::ChainNotFound { chain_id })
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/nonces", post(allocate_nonce))
        .route("/nonces/:chain_id/:account", delete(reset_nonce))
        .route("/transactions", post(submit_transaction))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server until `shutdown` fires
pub async fn run_server(
    config: ApiConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> SubmitterResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!(%addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SubmitterError::Config(format!("Cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| SubmitterError::Internal(e.to_string()))?;

    Ok(())
}

/// HTTP status for a failed submission or allocation
fn error_status(err: &SubmitterError) -> StatusCode {
    match err {
        SubmitterError::TransactionMissing { .. } => StatusCode::ACCEPTED,
        SubmitterError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        SubmitterError::Nonce { .. } => StatusCode::CONFLICT,
        SubmitterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SubmitterError::ChainNotFound { .. } => StatusCode::NOT_FOUND,
        SubmitterError::MissingResult
        | SubmitterError::Internal(_)
        | SubmitterError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(err: SubmitterError) -> (StatusCode, Json<ErrorResponse>) {
    let status = error_status(&err);
    if err.should_alert() {
        error!(error = %err, "Request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            unknown_outcome: err.is_unknown_outcome(),
        }),
    )
}

fn parse_account(input: &str) -> SubmitterResult<Address> {
    input
        .parse::<Address>()
        .map_err(|e| SubmitterError::InvalidRequest(format!("invalid account {}: {}", input, e)))
}

fn parse_raw_transaction(input: &str) -> SubmitterResult<Bytes> {
    let hex_str = input.strip_prefix("0x").unwrap_or(input);
    let raw = hex::decode(hex_str)
        .map_err(|e| SubmitterError::InvalidRequest(format!("invalid raw transaction: {}", e)))?;
    if raw.is_empty() {
        return Err(SubmitterError::InvalidRequest(
            "empty raw transaction".to_string(),
        ));
    }
    Ok(Bytes::from(raw))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - queue accepting work and chains reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let queue_state = state.queue.state();
    let queue_ok = queue_state == crate::tx::QueueState::Running;

    let chain_health = state.chain_manager.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if queue_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: queue_ok && chains_ok,
            queue: queue_state.as_str(),
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(id, h)| ChainHealth {
                    chain_id: id,
                    healthy: h,
                })
                .collect(),
        }),
    )
}

/// Get submitter status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = Utc::now() - state.started_at;

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: state.started_at,
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        queue: QueueStatus {
            state: state.queue.state().as_str(),
            depth: state.queue.depth(),
            capacity: state.queue.capacity(),
        },
        connected_chains: state.chain_manager.connected_chains(),
    })
}

/// Allocate the next nonce for an account
async fn allocate_nonce(
    State(state): State<AppState>,
    Json(request): Json<NonceRequest>,
) -> Result<Json<NonceResponse>, (StatusCode, Json<ErrorResponse>)> {
    let account = parse_account(&request.account).map_err(error_response)?;
    let tracker = state
        .nonce_tracker(request.chain_id)
        .map_err(error_response)?;

    let nonce = tracker.get_nonce(account).await.map_err(error_response)?;

    Ok(Json(NonceResponse {
        chain_id: request.chain_id,
        account,
        nonce,
    }))
}

/// Forget the cached nonce so the next allocation re-reads the chain
async fn reset_nonce(
    State(state): State<AppState>,
    Path((chain_id, account)): Path<(u64, String)>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let account = parse_account(&account).map_err(error_response)?;
    let tracker = state.nonce_tracker(chain_id).map_err(error_response)?;

    if tracker.reset(account).await {
        info!(chain_id, account = ?account, "Nonce cache reset");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

/// Submit a signed transaction and wait for the queue to report its outcome
async fn submit_transaction(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ErrorResponse>)> {
    let raw = parse_raw_transaction(&request.raw_transaction).map_err(error_response)?;
    state
        .chain_manager
        .get_provider(request.chain_id)
        .map_err(error_response)?;

    let pending = state
        .queue
        .enqueue_boxed(state.sender.send_fn(request.chain_id, raw))
        .await
        .map_err(error_response)?;
    let submission_id = pending.id();

    match pending.await {
        QueueResponse::Submitted(tx) => Ok(Json(SubmitResponse {
            submission_id: submission_id.to_string(),
            chain_id: tx.chain_id,
            tx_hash: tx.hash,
        })),
        QueueResponse::Failed(e) => {
            warn!(submission_id = %submission_id, error = %e, "Submission failed");
            Err(error_response(e))
        }
    }
}

// Request types

#[derive(Deserialize)]
struct NonceRequest {
    chain_id: u64,
    account: String,
}

#[derive(Deserialize)]
struct SubmitRequest {
    chain_id: u64,
    raw_transaction: String,
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    queue: &'static str,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    started_at: DateTime<Utc>,
    uptime_seconds: u64,
    queue: QueueStatus,
    connected_chains: Vec<u64>,
}

#[derive(Serialize)]
struct QueueStatus {
    state: &'static str,
    depth: usize,
    capacity: usize,
}

#[derive(Serialize)]
struct NonceResponse {
    chain_id: u64,
    account: Address,
    nonce: u64,
}

#[derive(Serialize)]
struct SubmitResponse {
    submission_id: String,
    chain_id: u64,
    tx_hash: H256,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    unknown_outcome: bool,
}
