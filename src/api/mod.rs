//! HTTP API for health checks, stats and transaction lookup

use crate::chain::ChainClient;
use crate::config::ApiConfig;
use crate::error::{TxmError, TxmResult};
use crate::store::TxStore;
use crate::tx::models::{Transaction, TransactionStats};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TxStore>,
    pub client: Arc<dyn ChainClient>,
    pub chain_id: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/transactions/:id", get(get_transaction))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> TxmResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TxmError::Internal(format!("api bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| TxmError::Internal(format!("api server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and chain both reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();
    let chain_ok = state.client.latest_header().await.is_ok();

    let status = if store_ok && chain_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: store_ok && chain_ok,
            store: store_ok,
            chain: chain_ok,
            chain_id: state.chain_id,
        }),
    )
}

/// Transaction counts by state
async fn get_stats(State(state): State<AppState>) -> Result<Json<TransactionStats>, (StatusCode, String)> {
    state
        .store
        .stats(state.chain_id)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TransactionResponse>, (StatusCode, String)> {
    match state.store.find_transaction(id).await {
        Ok(Some(tx)) => Ok(Json(TransactionResponse::from(tx))),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("transaction {} not found", id))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
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
    store: bool,
    chain: bool,
    chain_id: u64,
}

#[derive(Debug, Serialize)]
struct AttemptResponse {
    hash: H256,
    fee: String,
    state: String,
    broadcast_before_block_num: Option<u64>,
    receipt_block: Option<u64>,
}

#[derive(Debug, Serialize)]
struct TransactionResponse {
    id: i64,
    from: Address,
    to: Address,
    nonce: Option<u64>,
    state: String,
    error: Option<String>,
    broadcast_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    attempts: Vec<AttemptResponse>,
}

impl From<Transaction> for TransactionResponse {
    fn from(tx: Transaction) -> Self {
        Self {
            id: tx.id,
            from: tx.from_address,
            to: tx.to_address,
            nonce: tx.sequence,
            state: tx.state.to_string(),
            error: tx.error,
            broadcast_at: tx.broadcast_at,
            created_at: tx.created_at,
            attempts: tx
                .attempts
                .into_iter()
                .map(|a| AttemptResponse {
                    hash: a.hash,
                    fee: a.fee.to_string(),
                    state: a.state.to_string(),
                    broadcast_before_block_num: a.broadcast_before_block_num,
                    receipt_block: a.receipts.first().map(|r| r.block_number),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::store::MemoryTxStore;
    use crate::tx::models::{NewTransaction, TxState, TxStrategy};
    use ethers::types::{Bytes, U256};

    fn fatal_tx() -> Transaction {
        let mut tx = Transaction::unstarted(
            1,
            &NewTransaction {
                from_address: Address::repeat_byte(1),
                to_address: Address::repeat_byte(2),
                encoded_payload: Bytes::default(),
                value: U256::zero(),
                fee_limit: 21_000,
                strategy: TxStrategy::SendEvery,
                min_confirmations: None,
                pipeline_task_run_id: None,
                signal_callback: false,
            },
        );
        tx.state = TxState::FatalError;
        tx.error = Some("exceeds block gas limit".to_string());
        tx
    }

    #[test]
    fn test_transaction_response_exposes_error() {
        let response = TransactionResponse::from(fatal_tx());
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["state"], "fatal_error");
        assert_eq!(json["error"], "exceeds block gas limit");
        assert!(json["nonce"].is_null());
        assert_eq!(json["attempts"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_missing_transaction_is_not_found() {
        let state = AppState {
            store: Arc::new(MemoryTxStore::new()),
            client: Arc::new(MockChainClient::new()),
            chain_id: 1,
        };
        let err = get_transaction(State(state), Path(42)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }
}
