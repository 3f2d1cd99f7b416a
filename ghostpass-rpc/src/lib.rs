//! HTTP and WebSocket surface. Handlers stay thin: decode, call the engine,
//! map typed error kinds onto status codes.

pub mod ws;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use ghostpass_core::{
    duplicate_ticket_type_code, CoreError, Event, EventStatus, OrderingMode, Sale, SaleAction,
    SaleStatus, TicketType,
};
use ghostpass_engine::{allocation, stats, tickets};
use ghostpass_storage::{EventStore, PgStore, SaleStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;
use ws::WsRegistry;

#[derive(Clone)]
pub struct RpcState {
    pub store: Arc<PgStore>,
    pub registry: Arc<WsRegistry>,
    pub ticket_secret: Arc<String>,
    /// Ordering for newly created sales; fixed per deployment mode and
    /// stable for the life of every sale created under it.
    pub default_ordering: OrderingMode,
}

pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn from_core(err: &CoreError) -> Self {
        let (status, code) = match err {
            CoreError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            CoreError::WinnerNotFound => (StatusCode::NOT_FOUND, "WinnerNotFound"),
            CoreError::InvalidStateTransition { .. } => {
                (StatusCode::BAD_REQUEST, "InvalidStateTransition")
            }
            CoreError::InvalidStateForTicketTypeMutation => (
                StatusCode::BAD_REQUEST,
                "InvalidStateForTicketTypeMutation",
            ),
            CoreError::DuplicateTicketTypeCode(_) => {
                (StatusCode::BAD_REQUEST, "DuplicateTicketTypeCode")
            }
            CoreError::NotAWinner => (StatusCode::BAD_REQUEST, "NotAWinner"),
            CoreError::ValidationFailed(_) => (StatusCode::BAD_REQUEST, "ValidationFailed"),
            CoreError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
            CoreError::AdapterUnavailable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "AdapterUnavailable")
            }
        };
        Self::new(status, code, err.to_string())
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self::from_core(&err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(core) = err.downcast_ref::<CoreError>() {
            return Self::from_core(core);
        }
        error!("unhandled internal error: {err:#}");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal",
            "internal error",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: RpcState, cors_origins: Option<Vec<String>>) -> Router {
    let cors = match cors_origins {
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any)
        }
    };

    let v1 = Router::new()
        .route("/events", post(create_event).get(list_events))
        .route("/events/:id", get(get_event))
        .route("/events/:event_id/sales", post(create_sale))
        .route("/sales/:id", get(get_sale))
        .route("/sales/:id/publish", post(publish_sale))
        .route("/sales/:id/finalize", post(finalize_sale))
        .route("/sales/:id/commit", post(commit_sale))
        .route("/sales/:id/onchain-finalized", post(onchain_finalized))
        .route("/sales/:id/ticket-types", post(add_ticket_types))
        .route("/sales/:id/stats", get(sale_stats))
        .route("/sales/:id/my-status", get(my_status))
        .route("/sales/:id/merkle-proof", get(merkle_proof))
        .route("/sales/:id/allocation", get(allocation_view))
        .route("/sales/:id/tickets/:txid/issue", post(issue_ticket))
        .route("/sales/:id/claims/sync", post(sync_claim))
        .route("/scans/verify", post(verify_scan))
        .route("/scans/redeem", post(redeem_scan));

    Router::new()
        .route("/health", get(health))
        .route("/ws/sales/:sale_id", get(ws::ws_handler))
        .nest("/v1", v1)
        .layer(cors)
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: RpcState,
    cors_origins: Option<Vec<String>>,
) -> anyhow::Result<()> {
    let app = router(state, cors_origins);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ---------------------------------------------------------------------------
// Events

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateEventRequest {
    organizer_id: String,
    title: String,
    venue: Option<String>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
}

async fn create_event(
    State(state): State<RpcState>,
    Json(req): Json<CreateEventRequest>,
) -> ApiResult<Event> {
    if req.title.trim().is_empty() {
        return Err(CoreError::ValidationFailed("event title must not be empty".into()).into());
    }
    let event = Event {
        id: Uuid::new_v4(),
        organizer_id: req.organizer_id,
        title: req.title,
        venue: req.venue,
        start_at: req.start_at,
        end_at: req.end_at,
        status: EventStatus::Draft,
    };
    state.store.create_event(&event).await?;
    Ok(Json(event))
}

async fn list_events(State(state): State<RpcState>) -> ApiResult<Vec<Event>> {
    Ok(Json(state.store.list_events().await?))
}

async fn get_event(State(state): State<RpcState>, Path(id): Path<Uuid>) -> ApiResult<Event> {
    let event = state
        .store
        .get_event(id)
        .await?
        .ok_or(CoreError::NotFound("event"))?;
    Ok(Json(event))
}

// ---------------------------------------------------------------------------
// Sales

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TicketTypeRequest {
    code: String,
    name: String,
    price_sompi: u128,
    supply: u32,
    #[serde(default)]
    sort_order: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSaleRequest {
    #[serde(default = "default_network")]
    network: String,
    treasury_address: String,
    ticket_price_sompi: u128,
    supply_total: u32,
    max_per_address: Option<u32>,
    #[serde(default = "default_pow_difficulty")]
    pow_difficulty: u8,
    #[serde(default = "default_finality_depth")]
    finality_depth: u32,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    fallback_enabled: bool,
    #[serde(default)]
    ticket_types: Vec<TicketTypeRequest>,
}

fn default_network() -> String {
    "kaspa-mainnet".into()
}

fn default_pow_difficulty() -> u8 {
    8
}

fn default_finality_depth() -> u32 {
    10
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaleResponse {
    #[serde(flatten)]
    sale: Sale,
    ticket_types: Vec<TicketType>,
}

fn build_ticket_types(sale_id: Uuid, reqs: &[TicketTypeRequest]) -> Result<Vec<TicketType>, ApiError> {
    let types: Vec<TicketType> = reqs
        .iter()
        .map(|t| TicketType {
            sale_id,
            code: t.code.clone(),
            name: t.name.clone(),
            price_sompi: t.price_sompi,
            supply: t.supply,
            sort_order: t.sort_order,
        })
        .collect();
    for t in &types {
        t.validate()?;
    }
    if let Some(code) = duplicate_ticket_type_code(&types) {
        return Err(CoreError::DuplicateTicketTypeCode(code.to_string()).into());
    }
    Ok(types)
}

async fn create_sale(
    State(state): State<RpcState>,
    Path(event_id): Path<Uuid>,
    Json(req): Json<CreateSaleRequest>,
) -> ApiResult<SaleResponse> {
    state
        .store
        .get_event(event_id)
        .await?
        .ok_or(CoreError::NotFound("event"))?;

    let sale = Sale {
        id: Uuid::new_v4(),
        event_id,
        network: req.network,
        treasury_address: req.treasury_address,
        ticket_price_sompi: req.ticket_price_sompi,
        supply_total: req.supply_total,
        max_per_address: req.max_per_address,
        pow_difficulty: req.pow_difficulty,
        finality_depth: req.finality_depth,
        start_at: req.start_at,
        end_at: req.end_at,
        status: SaleStatus::Scheduled,
        ordering: state.default_ordering,
        fallback_enabled: req.fallback_enabled,
        allocation_frozen: false,
        merkle_root: None,
        commit_txid: None,
    };
    sale.validate()?;
    let types = build_ticket_types(sale.id, &req.ticket_types)?;
    state.store.create_sale(&sale, &types).await?;
    info!(sale = %sale.id, event = %event_id, "sale created");
    Ok(Json(SaleResponse {
        sale,
        ticket_types: types,
    }))
}

async fn get_sale(State(state): State<RpcState>, Path(id): Path<Uuid>) -> ApiResult<SaleResponse> {
    let sale = allocation::fetch_sale(state.store.as_ref(), id).await?;
    let ticket_types = state.store.ticket_types(id).await?;
    Ok(Json(SaleResponse { sale, ticket_types }))
}

async fn publish_sale(State(state): State<RpcState>, Path(id): Path<Uuid>) -> ApiResult<Sale> {
    let sale = allocation::apply_transition(state.store.as_ref(), id, SaleAction::Publish).await?;
    Ok(Json(sale))
}

async fn finalize_sale(
    State(state): State<RpcState>,
    Path(id): Path<Uuid>,
) -> ApiResult<allocation::AllocationSummary> {
    Ok(Json(
        allocation::finalize_sale(state.store.as_ref(), id).await?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitRequest {
    commit_txid: String,
}

async fn commit_sale(
    State(state): State<RpcState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CommitRequest>,
) -> ApiResult<Sale> {
    if req.commit_txid.trim().is_empty() {
        return Err(CoreError::ValidationFailed("commitTxid must not be empty".into()).into());
    }
    Ok(Json(
        allocation::commit_sale(state.store.as_ref(), id, &req.commit_txid).await?,
    ))
}

async fn onchain_finalized(State(state): State<RpcState>, Path(id): Path<Uuid>) -> ApiResult<Sale> {
    Ok(Json(
        allocation::mark_onchain_finalized(state.store.as_ref(), id).await?,
    ))
}

async fn add_ticket_types(
    State(state): State<RpcState>,
    Path(id): Path<Uuid>,
    Json(reqs): Json<Vec<TicketTypeRequest>>,
) -> ApiResult<Vec<TicketType>> {
    let sale = allocation::fetch_sale(state.store.as_ref(), id).await?;
    if sale.status != SaleStatus::Scheduled {
        return Err(CoreError::InvalidStateForTicketTypeMutation.into());
    }
    let mut all = state.store.ticket_types(id).await?;
    let new = build_ticket_types(id, &reqs)?;
    all.extend(new.iter().cloned());
    if let Some(code) = duplicate_ticket_type_code(&all) {
        return Err(CoreError::DuplicateTicketTypeCode(code.to_string()).into());
    }
    state.store.add_ticket_types(id, &new).await?;
    Ok(Json(state.store.ticket_types(id).await?))
}

// ---------------------------------------------------------------------------
// Projections

async fn sale_stats(
    State(state): State<RpcState>,
    Path(id): Path<Uuid>,
) -> ApiResult<stats::SaleStats> {
    let sale = allocation::fetch_sale(state.store.as_ref(), id).await?;
    Ok(Json(stats::live_stats(state.store.as_ref(), &sale).await?))
}

#[derive(Debug, Deserialize)]
struct TxidQuery {
    txid: String,
}

async fn my_status(
    State(state): State<RpcState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TxidQuery>,
) -> ApiResult<stats::MyStatus> {
    let sale = allocation::fetch_sale(state.store.as_ref(), id).await?;
    Ok(Json(
        stats::my_status(state.store.as_ref(), &sale, &query.txid).await?,
    ))
}

async fn merkle_proof(
    State(state): State<RpcState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TxidQuery>,
) -> ApiResult<allocation::ProofResponse> {
    Ok(Json(
        allocation::merkle_proof(state.store.as_ref(), id, &query.txid).await?,
    ))
}

async fn allocation_view(
    State(state): State<RpcState>,
    Path(id): Path<Uuid>,
) -> ApiResult<allocation::AllocationSummary> {
    Ok(Json(
        allocation::allocation_summary(state.store.as_ref(), id).await?,
    ))
}

// ---------------------------------------------------------------------------
// Tickets, claims, scans

async fn issue_ticket(
    State(state): State<RpcState>,
    Path((id, txid)): Path<(Uuid, String)>,
) -> ApiResult<tickets::IssuedTicket> {
    Ok(Json(
        tickets::issue_ticket(state.store.as_ref(), id, &txid, &state.ticket_secret).await?,
    ))
}

async fn sync_claim(
    State(state): State<RpcState>,
    Path(id): Path<Uuid>,
    Json(input): Json<allocation::ClaimInput>,
) -> ApiResult<ghostpass_core::Claim> {
    Ok(Json(
        allocation::sync_claim(state.store.as_ref(), id, input).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct ScanRequest {
    qr: String,
}

async fn verify_scan(
    State(state): State<RpcState>,
    Json(req): Json<ScanRequest>,
) -> ApiResult<tickets::VerifyOutcome> {
    Ok(Json(
        tickets::verify_scan(state.store.as_ref(), &req.qr, &state.ticket_secret).await?,
    ))
}

async fn redeem_scan(
    State(state): State<RpcState>,
    Json(req): Json<ScanRequest>,
) -> ApiResult<tickets::RedeemOutcome> {
    Ok(Json(
        tickets::redeem_scan(state.store.as_ref(), &req.qr, &state.ticket_secret).await?,
    ))
}
