// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Bodies and query parameters use
// camelCase keys, matching the serialized records. Engine rejections are
// mapped to status codes by `impl IntoResponse for EngineError`.
//
// CORS is configured permissively; the service has no authentication.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::error::{EngineError, EngineResult};
use crate::events::EventKind;
use crate::market_data::{Candle, InstrumentStatus, Timeframe};
use crate::trading::monitor::{run_sweeps, SweepSummary};
use crate::types::Quote;
use crate::trading::{
    OpenTradeRequest, OrderChanges, PendingOrder, PendingOrderRequest, SweepReport, Trade, Wallet,
};

/// Candles returned when the request names no limit.
const DEFAULT_CANDLE_LIMIT: usize = 100;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        // ── Market data ─────────────────────────────────────────────
        .route("/api/v1/symbols", get(list_symbols).post(subscribe_symbol))
        .route("/api/v1/prices/:symbol", get(price))
        .route("/api/v1/prices/:symbol/quote", get(quote))
        .route("/api/v1/candles/:symbol", get(candles))
        .route("/api/v1/candles/:symbol/current", get(current_candle))
        // ── Wallets ─────────────────────────────────────────────────
        .route("/api/v1/wallets/:user_id", get(wallet))
        .route("/api/v1/wallets/:user_id/deposit", post(deposit))
        // ── Trades ──────────────────────────────────────────────────
        .route("/api/v1/trades", get(list_trades).post(open_trade))
        .route("/api/v1/trades/:id", get(get_trade))
        .route("/api/v1/trades/:id/close", post(close_trade))
        .route("/api/v1/trades/:id/sltp", put(modify_sltp))
        // ── Pending orders ──────────────────────────────────────────
        .route("/api/v1/orders", get(list_orders).post(create_order))
        .route("/api/v1/orders/:id", get(get_order).put(modify_order))
        .route("/api/v1/orders/:id/cancel", post(cancel_order))
        // ── Manual sweeps ───────────────────────────────────────────
        .route("/api/v1/sweeps", post(sweep_all))
        .route("/api/v1/sweeps/sltp", post(sweep_sltp))
        .route("/api/v1/sweeps/pending", post(sweep_pending))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
    uptime_secs: u64,
    symbols: usize,
    stale_symbols: Vec<String>,
    published_events: u64,
    subscribers: BTreeMap<&'static str, usize>,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
        uptime_secs: state.uptime_secs(),
        symbols: state.feed.symbols().len(),
        stale_symbols: state.store.stale_symbols(),
        published_events: state.bus.published_count(),
        subscribers: EventKind::ALL
            .into_iter()
            .map(|kind| (kind.name(), state.bus.subscriber_count(kind)))
            .collect(),
    })
}

// =============================================================================
// Market data
// =============================================================================

#[derive(Deserialize)]
struct SubscribeBody {
    symbol: String,
}

#[derive(Serialize)]
struct SubscribeResponse {
    symbol: String,
    added: bool,
}

async fn list_symbols(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.feed.symbols())
}

async fn subscribe_symbol(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubscribeBody>,
) -> impl IntoResponse {
    let symbol = body.symbol.trim().to_ascii_uppercase();
    if symbol.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "symbol must not be empty" })),
        )
            .into_response();
    }
    let added = state.subscribe_symbol(&symbol);
    if added {
        info!(symbol = %symbol, "symbol subscribed via API");
    }
    Json(SubscribeResponse { symbol, added }).into_response()
}

async fn price(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Json<InstrumentStatus> {
    Json(state.instrument_status(&symbol.to_ascii_uppercase()))
}

/// Last known bid/ask, live or not.
async fn quote(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> EngineResult<Json<Quote>> {
    let symbol = symbol.to_ascii_uppercase();
    state
        .get_price(&symbol)
        .map(Json)
        .ok_or(EngineError::UnknownSymbol(symbol))
}

#[derive(Deserialize)]
struct CandleQuery {
    timeframe: Option<Timeframe>,
    limit: Option<usize>,
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<CandleQuery>,
) -> Json<Vec<Candle>> {
    let timeframe = query.timeframe.unwrap_or(Timeframe::M1);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CANDLE_LIMIT)
        .min(state.candles.history_limit());
    Json(state.get_candles(&symbol.to_ascii_uppercase(), timeframe, limit))
}

async fn current_candle(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<CandleQuery>,
) -> Json<Option<Candle>> {
    let timeframe = query.timeframe.unwrap_or(Timeframe::M1);
    Json(state.get_current_candle(&symbol.to_ascii_uppercase(), timeframe))
}

// =============================================================================
// Wallets
// =============================================================================

#[derive(Deserialize)]
struct DepositBody {
    amount: f64,
}

async fn wallet(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> EngineResult<Json<Wallet>> {
    state.engine.wallet(&user_id).map(Json)
}

async fn deposit(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(body): Json<DepositBody>,
) -> EngineResult<Json<Wallet>> {
    state.engine.fund_wallet(&user_id, body.amount).map(Json)
}

// =============================================================================
// Trades
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserQuery {
    user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseBody {
    user_id: String,
    lot: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SltpBody {
    user_id: String,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
}

async fn list_trades(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> EngineResult<Json<Vec<Trade>>> {
    state.engine.user_trades(&query.user_id).map(Json)
}

async fn get_trade(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> EngineResult<Json<Trade>> {
    state.engine.trade(&query.user_id, &id).map(Json)
}

async fn open_trade(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenTradeRequest>,
) -> EngineResult<(StatusCode, Json<Trade>)> {
    let trade = state.engine.create_trade(req)?;
    Ok((StatusCode::CREATED, Json(trade)))
}

async fn close_trade(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<CloseBody>,
) -> EngineResult<Json<Trade>> {
    state.engine.close_trade(&body.user_id, &id, body.lot).map(Json)
}

async fn modify_sltp(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SltpBody>,
) -> EngineResult<Json<Trade>> {
    state
        .engine
        .modify_sltp(&body.user_id, &id, body.stop_loss, body.take_profit)
        .map(Json)
}

// =============================================================================
// Pending orders
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModifyOrderBody {
    user_id: String,
    #[serde(flatten)]
    changes: OrderChanges,
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> EngineResult<Json<Vec<PendingOrder>>> {
    state.engine.user_orders(&query.user_id).map(Json)
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> EngineResult<Json<PendingOrder>> {
    state.engine.order(&query.user_id, &id).map(Json)
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PendingOrderRequest>,
) -> EngineResult<(StatusCode, Json<PendingOrder>)> {
    let order = state.engine.create_pending_order(req)?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn modify_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ModifyOrderBody>,
) -> EngineResult<Json<PendingOrder>> {
    state
        .engine
        .modify_pending_order(&body.user_id, &id, body.changes)
        .map(Json)
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UserQuery>,
) -> EngineResult<Json<PendingOrder>> {
    state.engine.cancel_pending_order(&body.user_id, &id).map(Json)
}

// =============================================================================
// Manual sweeps
// =============================================================================

async fn sweep_all(State(state): State<Arc<AppState>>) -> Json<SweepSummary> {
    Json(run_sweeps(&state.engine))
}

async fn sweep_sltp(State(state): State<Arc<AppState>>) -> Json<SweepReport> {
    Json(state.engine.check_sltp())
}

async fn sweep_pending(State(state): State<Arc<AppState>>) -> Json<SweepReport> {
    Json(state.engine.check_pending_orders())
}
