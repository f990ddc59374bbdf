//! HTTP API for makers, resolvers and operators

use crate::chain::ChainRegistry;
use crate::config::ApiConfig;
use crate::coordination::{
    AuctionParams, CoordinationEngine, DeploymentReport, OrderStatus, RevealResponse,
    SafetyReport, SubmitOrder,
};
use crate::error::{CoordinatorError, CoordinatorResult, ErrorKind};
use crate::order::{ChainSide, Order, OrderHash, OrderPhase, OrderTerms, PreparedOrder, ResolverAccounts};
use crate::partial::FillRecord;
use crate::secret::Secret;
use crate::store::OrderStore;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CoordinationEngine>,
    pub chains: Arc<ChainRegistry>,
    pub store: Arc<dyn OrderStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/orders", post(submit_order).get(list_orders))
        .route("/orders/prepare", post(prepare_order))
        .route("/orders/prepared/:id/submit", post(submit_prepared))
        .route("/orders/:hash", get(order_status))
        .route("/orders/:hash/claim", post(claim_order))
        .route("/orders/:hash/escrows/:side", post(confirm_escrow))
        .route("/orders/:hash/safety", get(verify_order))
        .route("/orders/:hash/reveal", post(request_reveal))
        .route("/orders/:hash/fills", post(submit_fill))
        .route("/orders/:hash/cancel", post(cancel_order))
        .route("/orders/:hash/resume", post(resume_order))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> CoordinatorResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoordinatorError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| CoordinatorError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

// Errors

pub struct ApiError(CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        Self(e)
    }
}

/// HTTP status for an engine error
pub fn status_for(error: &CoordinatorError) -> StatusCode {
    match error.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Rejected => match error {
            CoordinatorError::InvalidOrder(_)
            | CoordinatorError::InvalidSignature(_)
            | CoordinatorError::InvalidSecret(_)
            | CoordinatorError::InvalidTimelocks(_)
            | CoordinatorError::InvalidFill(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::CONFLICT,
        },
        ErrorKind::Internal => match error {
            CoordinatorError::ChainUnavailable { .. } | CoordinatorError::Database(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorResponse {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_hash(raw: &str) -> Result<OrderHash, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(CoordinatorError::InvalidOrder(format!("bad order hash {}", raw))))
}

// Handlers

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify all dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();

    let chain_health = state.chains.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let ready = store_ok && chains_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            store: store_ok,
            chains: chain_health
                .into_iter()
                .map(|(family, healthy)| ChainHealth {
                    chain: family.to_string(),
                    healthy,
                })
                .collect(),
        }),
    )
}

async fn prepare_order(
    State(state): State<AppState>,
    Json(terms): Json<OrderTerms>,
) -> ApiResult<PreparedOrder> {
    Ok(Json(state.engine.prepare_order(terms).await?))
}

async fn submit_prepared(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SubmitPreparedRequest>,
) -> ApiResult<Order> {
    let order = state
        .engine
        .submit_prepared(&id, body.signature, body.secrets, body.auction)
        .await?;
    Ok(Json(order))
}

async fn submit_order(
    State(state): State<AppState>,
    Json(request): Json<SubmitOrder>,
) -> ApiResult<Order> {
    Ok(Json(state.engine.submit_order(request).await?))
}

async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Order>> {
    let phase = query.phase.unwrap_or(OrderPhase::Submitted);
    Ok(Json(state.engine.orders_in_phase(phase).await?))
}

async fn order_status(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<OrderStatus> {
    let order_hash = parse_hash(&hash)?;
    Ok(Json(state.engine.order_status(&order_hash).await?))
}

async fn claim_order(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Json(body): Json<ClaimRequest>,
) -> ApiResult<Order> {
    let order_hash = parse_hash(&hash)?;
    let order = state
        .engine
        .claim(&order_hash, &body.resolver, body.accounts)
        .await?;
    Ok(Json(order))
}

async fn confirm_escrow(
    State(state): State<AppState>,
    Path((hash, side)): Path<(String, String)>,
    Json(body): Json<ConfirmEscrowRequest>,
) -> ApiResult<Order> {
    let order_hash = parse_hash(&hash)?;
    let side: ChainSide = side.parse().map_err(ApiError)?;
    let order = state
        .engine
        .confirm_escrow_deployed(&order_hash, &body.resolver, side, body.deployment)
        .await?;
    Ok(Json(order))
}

async fn verify_order(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<SafetyReport> {
    let order_hash = parse_hash(&hash)?;
    Ok(Json(state.engine.verify_order(&order_hash).await?))
}

async fn request_reveal(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Json(body): Json<RevealRequest>,
) -> ApiResult<RevealResponse> {
    let order_hash = parse_hash(&hash)?;
    let response = state
        .engine
        .request_reveal(&order_hash, &body.requestor, body.index)
        .await?;
    Ok(Json(response))
}

async fn submit_fill(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Json(body): Json<FillRequest>,
) -> ApiResult<FillRecord> {
    let order_hash = parse_hash(&hash)?;
    let fill = state
        .engine
        .submit_partial_fill(&order_hash, &body.resolver, body.amount, body.secret_index)
        .await?;
    Ok(Json(fill))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Json(body): Json<CancelRequest>,
) -> ApiResult<Order> {
    let order_hash = parse_hash(&hash)?;
    let order = state
        .engine
        .cancel(&order_hash, &body.caller, &body.reason)
        .await?;
    Ok(Json(order))
}

async fn resume_order(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Json(body): Json<ResumeRequest>,
) -> ApiResult<Order> {
    let order_hash = parse_hash(&hash)?;
    Ok(Json(
        state.engine.resume_order(&order_hash, &body.operator).await?,
    ))
}

// Request types

#[derive(Deserialize)]
struct SubmitPreparedRequest {
    signature: Option<String>,
    secrets: Vec<Secret>,
    #[serde(default)]
    auction: AuctionParams,
}

#[derive(Deserialize)]
struct ListQuery {
    phase: Option<OrderPhase>,
}

#[derive(Deserialize)]
struct ClaimRequest {
    resolver: String,
    accounts: ResolverAccounts,
}

#[derive(Deserialize)]
struct ConfirmEscrowRequest {
    resolver: String,
    #[serde(flatten)]
    deployment: DeploymentReport,
}

#[derive(Deserialize)]
struct RevealRequest {
    requestor: String,
    index: Option<u32>,
}

#[derive(Deserialize)]
struct FillRequest {
    resolver: String,
    amount: u128,
    secret_index: u32,
}

#[derive(Deserialize)]
struct CancelRequest {
    caller: String,
    reason: String,
}

#[derive(Deserialize)]
struct ResumeRequest {
    operator: String,
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
    chains: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: String,
    healthy: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}
