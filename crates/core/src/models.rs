use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::traits::BridgeError;

// ---------------------------------------------------------------------------
// Bridge Connection
// ---------------------------------------------------------------------------

/// Default port the MT5 bridge server listens on.
pub const DEFAULT_BRIDGE_PORT: u16 = 8765;

/// The lifecycle state of the bridge socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The configured endpoint is unusable.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Persisted connection record for the remote bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub enabled: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_BRIDGE_PORT,
            enabled: false,
        }
    }
}

impl BridgeConfig {
    /// `host:port` as shown on the dashboard.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build the WebSocket URL for this endpoint.
    pub fn ws_url(&self) -> Result<String, BridgeError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(BridgeError::InvalidEndpoint("host is empty".to_string()));
        }
        if host.contains('/') || host.contains(char::is_whitespace) {
            return Err(BridgeError::InvalidEndpoint(format!(
                "host '{}' is not a hostname",
                host
            )));
        }
        if self.port == 0 {
            return Err(BridgeError::InvalidEndpoint("port must be non-zero".to_string()));
        }
        Ok(format!("ws://{}:{}", host, self.port))
    }
}

/// Point-in-time view of the bridge connection for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub state: ConnectionState,
    pub endpoint: String,
    pub enabled: bool,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub pending_requests: usize,
}

impl BridgeStatus {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            endpoint: config.endpoint(),
            enabled: config.enabled,
            last_error: None,
            connected_since: None,
            pending_requests: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

// ---------------------------------------------------------------------------
// Market Data
// ---------------------------------------------------------------------------

/// Bar timeframes the bridge can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Timeframe {
    #[default]
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "M1" => Ok(Timeframe::M1),
            "M5" => Ok(Timeframe::M5),
            "M15" => Ok(Timeframe::M15),
            "H1" => Ok(Timeframe::H1),
            "H4" => Ok(Timeframe::H4),
            "D1" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe: {}", other)),
        }
    }
}

/// A single OHLC rate as returned by `get_market_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rate {
    /// Bar open time in unix seconds.
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub tick_volume: u64,
    pub spread: i64,
}

impl Rate {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.time, 0).single()
    }
}

/// Latest quote for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickData {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: u64,
    /// Quote time in unix seconds.
    pub time: i64,
}

impl TickData {
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.time, 0).single()
    }
}

/// A tradeable symbol visible in the terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub spread: i64,
    pub volume_min: Decimal,
    pub volume_max: Decimal,
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Account snapshot reported by the terminal after connect/login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub login: u64,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub server: String,
    pub leverage: u32,
    pub currency: String,
}

impl AccountInfo {
    pub fn free_margin(&self) -> Decimal {
        self.equity - self.margin
    }
}

/// Terminal login credentials for `connect_with_credentials`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub login: u64,
    pub password: String,
    pub server: String,
}

// ---------------------------------------------------------------------------
// Orders & Positions
// ---------------------------------------------------------------------------

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// MT5 `ORDER_TYPE_*` code.
    pub fn mt5_code(&self) -> u8 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }

    pub fn from_mt5_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Side::Buy),
            1 => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// A market order to place through the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, volume: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            volume,
            price: None,
            stop_loss: None,
            take_profit: None,
            comment: None,
        }
    }

    /// Positional arguments in the order the bridge expects:
    /// `[symbol, type, volume, price, sl, tp, comment]`. Unset prices are sent as 0.
    pub fn to_args(&self) -> Vec<serde_json::Value> {
        let num = |d: Option<Decimal>| d.and_then(|d| d.to_f64()).unwrap_or(0.0);
        vec![
            serde_json::json!(self.symbol),
            serde_json::json!(self.side.mt5_code()),
            serde_json::json!(num(Some(self.volume))),
            serde_json::json!(num(self.price)),
            serde_json::json!(num(self.stop_loss)),
            serde_json::json!(num(self.take_profit)),
            serde_json::json!(self.comment.clone().unwrap_or_default()),
        ]
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("symbol is required".to_string());
        }
        if self.volume <= Decimal::ZERO {
            return Err("volume must be positive".to_string());
        }
        for (name, value) in [
            ("price", self.price),
            ("stop_loss", self.stop_loss),
            ("take_profit", self.take_profit),
        ] {
            if matches!(value, Some(v) if v < Decimal::ZERO) {
                return Err(format!("{} must not be negative", name));
            }
        }
        Ok(())
    }
}

/// Execution report for a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub ticket: u64,
    pub volume: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub comment: String,
}

/// An open position in the terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub ticket: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub position_type: u8,
    pub volume: Decimal,
    pub price_open: Decimal,
    pub price_current: Decimal,
    pub profit: Decimal,
    #[serde(default)]
    pub swap: Decimal,
    #[serde(default)]
    pub commission: Decimal,
}

impl PositionInfo {
    pub fn side(&self) -> Option<Side> {
        Side::from_mt5_code(self.position_type)
    }

    /// Profit including swap and commission.
    pub fn net_profit(&self) -> Decimal {
        self.profit + self.swap + self.commission
    }
}
