//! HTTP API over the escrow service
//!
//! Thin transport: requests map onto `EscrowService` calls and errors onto a
//! small set of `{error, message}` bodies.

use crate::config::ApiConfig;
use crate::error::{EscrowError, EscrowResult};
use crate::lifecycle::{AccessToken, CreateEscrow, CreatedEscrow, EscrowService, EscrowStats};
use crate::state::EscrowRecord;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::Address;
use ethers::utils::to_checksum;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const CLIENT_TOKEN_HEADER: &str = "x-client-token";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EscrowService>,
    pub escrow_address: Address,
    /// Chain id the node reported at startup; `None` if it was unreachable
    pub chain_id: Option<u64>,
}

/// Build the router; split out so tests can drive it without a socket
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/transaction", post(create_transaction))
        .route("/api/transaction/:id", get(get_transaction))
        .route("/api/transactions", get(list_transactions))
        .route("/api/stats", get(get_stats))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> EscrowResult<()> {
    let app = router(state, &config.cors_origins);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EscrowError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| EscrowError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(CLIENT_TOKEN_HEADER),
        ])
}

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        escrow_address: to_checksum(&state.escrow_address, None),
        chain_id: state.chain_id,
    })
}

async fn create_transaction(
    State(state): State<AppState>,
    body: Result<Json<CreateEscrow>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedEscrow>), ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::BadBody(rejection.body_text()))?;
    let created = state.service.create(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<EscrowView>, ApiError> {
    let access = AccessToken {
        client_token: header_str(&headers, CLIENT_TOKEN_HEADER),
        admin_token: bearer_token(&headers),
    };
    let record = state.service.get(&id, access).await?;
    Ok(Json(EscrowView::from(&record)))
}

async fn list_transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<EscrowView>>, ApiError> {
    let records = state.service.list(bearer_token(&headers)).await?;
    Ok(Json(records.iter().map(EscrowView::from).collect()))
}

async fn get_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<EscrowStats>, ApiError> {
    Ok(Json(state.service.stats(bearer_token(&headers)).await?))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Error response wrapper
pub enum ApiError {
    Escrow(EscrowError),
    BadBody(String),
}

impl From<EscrowError> for ApiError {
    fn from(e: EscrowError) -> Self {
        ApiError::Escrow(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadBody(message) => (StatusCode::BAD_REQUEST, "missing-field", message),
            ApiError::Escrow(e) => {
                let status = match e.kind() {
                    "missing-field" | "invalid-address" | "invalid-tx-hash" | "invalid-amount" => {
                        StatusCode::BAD_REQUEST
                    }
                    "already-exists" => StatusCode::CONFLICT,
                    "not-found" => StatusCode::NOT_FOUND,
                    "forbidden" => StatusCode::FORBIDDEN,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!("API request failed: {}", e);
                    "internal error".to_string()
                } else {
                    e.to_string()
                };
                (status, e.kind(), message)
            }
        };

        (status, Json(ErrorResponse { error: kind, message })).into_response()
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    escrow_address: String,
    chain_id: Option<u64>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

/// Record as returned to callers; no token, no signed payload
#[derive(Debug, Serialize)]
pub struct EscrowView {
    pub id: String,
    pub sender: String,
    pub destination: String,
    pub deposit_wei: String,
    pub recipient_amount_wei: String,
    pub gas_buffer_wei: String,
    pub fee_wei: String,
    pub forwarded_amount_wei: Option<String>,
    pub status: &'static str,
    pub forward_tx_hash: Option<String>,
    pub escrow_block: Option<u64>,
    pub forward_block: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub forwarded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl From<&EscrowRecord> for EscrowView {
    fn from(r: &EscrowRecord) -> Self {
        Self {
            id: r.id.clone(),
            sender: to_checksum(&r.sender, None),
            destination: to_checksum(&r.destination, None),
            deposit_wei: r.deposit_wei.to_string(),
            recipient_amount_wei: r.recipient_amount_wei.to_string(),
            gas_buffer_wei: r.gas_buffer_wei.to_string(),
            fee_wei: r.fee_wei.to_string(),
            forwarded_amount_wei: r.forwarded_amount_wei.map(|v| v.to_string()),
            status: r.status.as_str(),
            forward_tx_hash: r.forward_tx_hash.map(|h| format!("{:?}", h)),
            escrow_block: r.escrow_block,
            forward_block: r.forward_block,
            error: r.error.clone(),
            created_at: r.created_at,
            verified_at: r.verified_at,
            forwarded_at: r.forwarded_at,
            completed_at: r.completed_at,
            failed_at: r.failed_at,
        }
    }
}
