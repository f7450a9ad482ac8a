use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tradedesk_core::*;

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Health
        .route("/health", get(health_check))
        // Bridge connection
        .route("/bridge/status", get(bridge_status))
        .route("/bridge/config", get(get_bridge_config).put(update_bridge_config))
        .route("/bridge/connect", post(connect_bridge))
        .route("/bridge/disconnect", post(disconnect_bridge))
        // MT5 commands
        .route("/mt5/account", get(account))
        .route("/mt5/login", post(login))
        .route("/mt5/symbols", get(symbols))
        .route("/mt5/market-data/{symbol}", get(market_data))
        .route("/mt5/tick/{symbol}", get(tick))
        .route("/mt5/orders", post(place_order))
        .route("/mt5/positions", get(positions))
        .route("/mt5/positions/{ticket}", delete(close_position))
        .route("/mt5/shutdown", post(shutdown))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let bridge = state.bridge.status();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "bridge": bridge.state,
    }))
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

async fn bridge_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bridge.status())
}

async fn get_bridge_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bridge.config())
}

async fn update_bridge_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<BridgeConfig>,
) -> Result<Json<BridgeConfig>, ApiError> {
    config
        .ws_url()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    state.bridge.update_config(config.clone()).await?;
    Ok(Json(config))
}

async fn connect_bridge(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connected = state.bridge.connect().await;
    Json(serde_json::json!({
        "connected": connected,
        "status": state.bridge.status(),
    }))
}

async fn disconnect_bridge(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.bridge.disconnect().await;
    Json(state.bridge.status())
}

// ---------------------------------------------------------------------------
// MT5
// ---------------------------------------------------------------------------

async fn account(State(state): State<Arc<AppState>>) -> Result<Json<AccountInfo>, ApiError> {
    Ok(Json(state.mt5.test_connection().await?))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(credentials): Json<Credentials>,
) -> Result<Json<AccountInfo>, ApiError> {
    Ok(Json(state.mt5.login(&credentials).await?))
}

async fn symbols(State(state): State<Arc<AppState>>) -> Result<Json<Vec<SymbolInfo>>, ApiError> {
    Ok(Json(state.mt5.symbols().await?))
}

#[derive(Deserialize)]
struct MarketDataQuery {
    timeframe: Option<String>,
    count: Option<u32>,
}

async fn market_data(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<MarketDataQuery>,
) -> Result<Json<Vec<Rate>>, ApiError> {
    let timeframe = match query.timeframe.as_deref() {
        Some(tf) => tf.parse::<Timeframe>().map_err(ApiError::bad_request)?,
        None => Timeframe::default(),
    };
    let count = query.count.unwrap_or(100);
    Ok(Json(state.mt5.market_data(&symbol, timeframe, count).await?))
}

async fn tick(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<TickData>, ApiError> {
    Ok(Json(state.mt5.tick(&symbol).await?))
}

async fn place_order(
    State(state): State<Arc<AppState>>,
    Json(order): Json<OrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.mt5.place_order(&order).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn positions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PositionInfo>>, ApiError> {
    Ok(Json(state.mt5.positions().await?))
}

async fn close_position(
    State(state): State<Arc<AppState>>,
    Path(ticket): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let closed = state.mt5.close_position(ticket).await?;
    Ok(Json(serde_json::json!({ "closed_ticket": closed })))
}

async fn shutdown(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let message = state.mt5.shutdown().await?;
    Ok(Json(serde_json::json!({ "message": message })))
}
