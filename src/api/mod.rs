//! HTTP API for the intent marketplace and swap coordination

use crate::config::{ApiConfig, Settings};
use crate::coordination::{Role, StepReport, SwapCoordinator};
use crate::error::{SwapError, SwapResult};
use crate::intents::{Intent, IntentRegistry, IntentUpdate, Match, MatchUpdate, NewIntent};
use crate::ledger::{ContractStatus, LedgerManager, RateLimitStatus, SwapContract};
use crate::types::{Address, ContractId};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<IntentRegistry>,
    pub ledgers: Arc<LedgerManager>,
    pub coordinator: Arc<SwapCoordinator>,
}

/// Routes served under `/api`
///
/// The API does not authenticate callers. Addresses in request bodies
/// (`actor`, `caller`, `matcherAddress`) are taken as asserted by the client,
/// the same trust model the intent marketplace uses. They only choose which
/// party a step acts for. Hash-lock and timelock rules still apply on the ledger.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health_check))
        .route("/networks", get(get_networks))
        .route("/networks/:network/switch", post(switch_network))
        .route("/networks/:network/contracts/:contract_id", get(get_contract))
        .route("/networks/:network/refunds", post(batch_refund))
        .route("/networks/:network/rate-limit/:address", get(get_rate_limit))
        .route("/networks/:network/emergency-stop", post(toggle_emergency_stop))
        .route("/intents", get(list_intents).post(create_intent))
        .route("/intents/clear", post(clear_intents))
        .route("/intents/user/:address", get(user_intents))
        .route("/intents/:id", get(get_intent).patch(update_intent))
        .route("/intents/:id/match", post(match_intent))
        .route("/matches/user/:address", get(user_matches))
        .route("/matches/:id", get(get_match).patch(update_match))
        .route("/matches/:id/advance", post(advance_match))
        .route("/matches/:id/refund", post(refund_match));

    Router::new().nest("/api", api).with_state(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> SwapResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SwapError::Internal(format!("failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| SwapError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

impl SwapError {
    fn status_code(&self) -> StatusCode {
        match self {
            SwapError::Validation(_) => StatusCode::BAD_REQUEST,
            SwapError::NotFound { .. } => StatusCode::NOT_FOUND,
            SwapError::StateConflict(_) | SwapError::NetworkMismatch { .. } => StatusCode::CONFLICT,
            SwapError::ContractRejection { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SwapError::TransientRpc { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SwapError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            SwapError::Config(_)
            | SwapError::Database(_)
            | SwapError::Storage(_)
            | SwapError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SwapError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() || self.should_alert() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }

        let body = ErrorResponse {
            error: self.user_message(),
            category: self.category(),
        };
        (status, Json(body)).into_response()
    }
}

fn parse_contract_id(raw: &str) -> SwapResult<ContractId> {
    raw.parse()
        .map_err(|e| SwapError::Validation(format!("invalid contract id {}: {}", raw, e)))
}

/// Liveness plus marketplace counters
async fn health_check(State(state): State<AppState>) -> SwapResult<Json<HealthResponse>> {
    let stats = state.registry.stats().await?;
    let database = state.registry.store().health_check().await;
    let networks = state
        .ledgers
        .health_check()
        .await
        .into_iter()
        .map(|(network, healthy)| NetworkHealth { network, healthy })
        .collect();

    Ok(Json(HealthResponse {
        status: if database { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        active_intents: stats.active_intents,
        total_matches: stats.total_matches,
        database,
        networks,
    }))
}

/// Network catalogue
async fn get_networks(State(state): State<AppState>) -> Json<Vec<NetworkInfo>> {
    let mut networks: Vec<NetworkInfo> = state
        .settings
        .enabled_networks()
        .into_iter()
        .map(|(key, network)| NetworkInfo {
            key: key.clone(),
            chain_id: network.chain_id,
            name: network.name.clone(),
            currency: network.currency.clone(),
            decimals: network.decimals,
            rpc_url: network.rpc_urls.first().cloned(),
            htlc_address: network.contract_address.clone(),
            explorer_url: network.explorer_url.clone(),
        })
        .collect();
    networks.sort_by_key(|n| n.chain_id);
    Json(networks)
}

async fn switch_network(
    State(state): State<AppState>,
    Path(network): Path<String>,
) -> SwapResult<Json<SuccessResponse>> {
    state.coordinator.switch_network(&network).await?;
    Ok(Json(SuccessResponse::new(format!("Switched to {}", network))))
}

async fn get_contract(
    State(state): State<AppState>,
    Path((network, contract_id)): Path<(String, String)>,
) -> SwapResult<Json<ContractResponse>> {
    let controller = state.ledgers.controller(&network)?;
    let contract = controller
        .require_contract(parse_contract_id(&contract_id)?)
        .await?;
    let status = ContractStatus::of(&contract, controller.now());
    Ok(Json(ContractResponse { contract, status }))
}

async fn batch_refund(
    State(state): State<AppState>,
    Path(network): Path<String>,
    Json(request): Json<BatchRefundRequest>,
) -> SwapResult<Json<Vec<RefundResult>>> {
    let controller = state.ledgers.controller(&network)?;
    let ids = request
        .contract_ids
        .iter()
        .map(|id| parse_contract_id(id))
        .collect::<SwapResult<Vec<_>>>()?;

    let outcomes = controller
        .batch_refund(&Address::new(&request.caller), &ids)
        .await;
    Ok(Json(
        outcomes
            .into_iter()
            .map(|outcome| match outcome.result {
                Ok(tx) => RefundResult {
                    contract_id: outcome.contract_id,
                    success: true,
                    tx_hash: Some(tx.0),
                    error: None,
                },
                Err(e) => RefundResult {
                    contract_id: outcome.contract_id,
                    success: false,
                    tx_hash: None,
                    error: Some(e.user_message()),
                },
            })
            .collect(),
    ))
}

async fn get_rate_limit(
    State(state): State<AppState>,
    Path((network, address)): Path<(String, String)>,
) -> SwapResult<Json<RateLimitResponse>> {
    let controller = state.ledgers.controller(&network)?;
    let limit = controller.rate_limit(&Address::new(&address)).await?;
    let now = controller.now();
    Ok(Json(RateLimitResponse {
        effective_count: limit.effective_count(now),
        retry_after: limit.retry_after(now),
        limit,
    }))
}

async fn toggle_emergency_stop(
    State(state): State<AppState>,
    Path(network): Path<String>,
    Json(request): Json<CallerRequest>,
) -> SwapResult<Json<EmergencyStopResponse>> {
    let controller = state.ledgers.controller(&network)?;
    let stopped = controller
        .toggle_emergency_stop(&Address::new(&request.caller))
        .await?;
    Ok(Json(EmergencyStopResponse { stopped }))
}

/// Active intents
async fn list_intents(State(state): State<AppState>) -> SwapResult<Json<Vec<Intent>>> {
    Ok(Json(state.registry.list_active().await?))
}

async fn create_intent(
    State(state): State<AppState>,
    Json(request): Json<NewIntent>,
) -> SwapResult<Json<CreateIntentResponse>> {
    let intent = state.registry.create_intent(request).await?;
    let potential_matches = state.registry.find_complementary(&intent).await?.len();
    if potential_matches > 0 {
        info!("Found {} potential matches for intent {}", potential_matches, intent.id);
    }

    Ok(Json(CreateIntentResponse {
        success: true,
        intent,
        potential_matches,
    }))
}

async fn clear_intents(State(state): State<AppState>) -> SwapResult<Json<SuccessResponse>> {
    let (intents, matches) = state.registry.clear().await?;
    Ok(Json(SuccessResponse::new(format!(
        "Cleared {} intents and {} matches",
        intents, matches
    ))))
}

async fn user_intents(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> SwapResult<Json<Vec<Intent>>> {
    Ok(Json(state.registry.intents_for(&address).await?))
}

async fn get_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SwapResult<Json<Intent>> {
    Ok(Json(state.registry.require_intent(&id).await?))
}

async fn update_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<IntentUpdate>,
) -> SwapResult<Json<IntentResponse>> {
    let intent = state.registry.update_intent(&id, update).await?;
    Ok(Json(IntentResponse {
        success: true,
        intent,
    }))
}

async fn match_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<MatchRequest>,
) -> SwapResult<Json<MatchResponse>> {
    let (record, intent) = state
        .registry
        .match_intent(&id, &request.matcher_address)
        .await?;
    Ok(Json(MatchResponse {
        success: true,
        r#match: record,
        intent,
    }))
}

async fn user_matches(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> SwapResult<Json<Vec<Match>>> {
    Ok(Json(state.registry.matches_for(&address).await?))
}

async fn get_match(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SwapResult<Json<Match>> {
    Ok(Json(state.registry.require_match(&id).await?))
}

async fn update_match(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<MatchUpdate>,
) -> SwapResult<Json<MatchUpdateResponse>> {
    let record = state.registry.update_match(&id, update).await?;
    Ok(Json(MatchUpdateResponse {
        success: true,
        r#match: record,
    }))
}

/// Run the next step for `role`. `actor` is caller-asserted and only has to
/// name the matching party of the match.
async fn advance_match(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<StepRequest>,
) -> SwapResult<Json<StepReport>> {
    let report = state
        .coordinator
        .advance(&id, request.role, &Address::new(&request.actor))
        .await?;
    Ok(Json(report))
}

async fn refund_match(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<StepRequest>,
) -> SwapResult<Json<StepReport>> {
    let report = state
        .coordinator
        .refund(&id, request.role, &Address::new(&request.actor))
        .await?;
    Ok(Json(report))
}

// Request types

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchRequest {
    matcher_address: String,
}

/// Unauthenticated; `actor` must be the party holding `role` in the match
#[derive(Deserialize)]
struct StepRequest {
    role: Role,
    actor: String,
}

#[derive(Deserialize)]
struct CallerRequest {
    caller: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRefundRequest {
    caller: String,
    contract_ids: Vec<String>,
}

// Response types

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    category: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: String,
    active_intents: usize,
    total_matches: usize,
    database: bool,
    networks: Vec<NetworkHealth>,
}

#[derive(Serialize)]
struct NetworkHealth {
    network: String,
    healthy: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInfo {
    key: String,
    chain_id: u64,
    name: String,
    currency: String,
    decimals: u32,
    rpc_url: Option<String>,
    htlc_address: String,
    explorer_url: Option<String>,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
    message: String,
    timestamp: String,
}

impl SuccessResponse {
    fn new(message: String) -> Self {
        Self {
            success: true,
            message,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct ContractResponse {
    contract: SwapContract,
    status: ContractStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefundResult {
    contract_id: ContractId,
    success: bool,
    tx_hash: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitResponse {
    #[serde(flatten)]
    limit: RateLimitStatus,
    effective_count: u64,
    retry_after: Option<u64>,
}

#[derive(Serialize)]
struct EmergencyStopResponse {
    stopped: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateIntentResponse {
    success: bool,
    intent: Intent,
    potential_matches: usize,
}

#[derive(Serialize)]
struct IntentResponse {
    success: bool,
    intent: Intent,
}

#[derive(Serialize)]
struct MatchResponse {
    success: bool,
    #[serde(rename = "match")]
    r#match: Match,
    intent: Intent,
}

#[derive(Serialize)]
struct MatchUpdateResponse {
    success: bool,
    #[serde(rename = "match")]
    r#match: Match,
}
