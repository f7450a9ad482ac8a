use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tradedesk_core::BridgeError;

/// Request sent from the manager TO the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    pub command: String,
    pub args: Vec<Value>,
}

impl CommandEnvelope {
    pub fn new(id: String, command: &str, args: Vec<Value>) -> Self {
        Self {
            id,
            command: command.to_string(),
            args,
        }
    }

    /// Encode as a text frame.
    pub fn to_text(&self) -> String {
        serde_json::json!({
            "id": self.id,
            "command": self.command,
            "args": self.args,
        })
        .to_string()
    }
}

/// Response received FROM the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// `null` when the bridge could not parse our request.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Parse an inbound frame. Anything that is not an envelope yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Resolve the envelope into the command's result.
    ///
    /// Only an explicit `success: false` is a failure; the bridge nests
    /// command errors inside `result`, so both places are checked for a message.
    pub fn into_result(self) -> Result<Value, BridgeError> {
        if self.success == Some(false) {
            let nested = self
                .result
                .as_ref()
                .and_then(|r| r.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let message = self
                .error
                .or(nested)
                .unwrap_or_else(|| "unknown bridge error".to_string());
            return Err(BridgeError::Remote(message));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a correlation id of the form `<unix-millis>-<sequence>`.
pub fn next_correlation_id() -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", Utc::now().timestamp_millis(), seq)
}

/// Commands understood by the MT5 bridge server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mt5Command {
    TestConnection,
    ConnectWithCredentials,
    GetSymbols,
    GetMarketData,
    GetTick,
    PlaceOrder,
    GetPositions,
    ClosePosition,
    Shutdown,
}

impl Mt5Command {
    pub const ALL: [Mt5Command; 9] = [
        Mt5Command::TestConnection,
        Mt5Command::ConnectWithCredentials,
        Mt5Command::GetSymbols,
        Mt5Command::GetMarketData,
        Mt5Command::GetTick,
        Mt5Command::PlaceOrder,
        Mt5Command::GetPositions,
        Mt5Command::ClosePosition,
        Mt5Command::Shutdown,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Mt5Command::TestConnection => "test_connection",
            Mt5Command::ConnectWithCredentials => "connect_with_credentials",
            Mt5Command::GetSymbols => "get_symbols",
            Mt5Command::GetMarketData => "get_market_data",
            Mt5Command::GetTick => "get_tick",
            Mt5Command::PlaceOrder => "place_order",
            Mt5Command::GetPositions => "get_positions",
            Mt5Command::ClosePosition => "close_position",
            Mt5Command::Shutdown => "shutdown",
        }
    }

    /// Field of the `result` object holding the payload.
    pub fn result_field(&self) -> &'static str {
        match self {
            Mt5Command::TestConnection | Mt5Command::ConnectWithCredentials => "account",
            Mt5Command::GetSymbols => "symbols",
            Mt5Command::GetMarketData => "data",
            Mt5Command::GetTick => "tick",
            Mt5Command::PlaceOrder => "order",
            Mt5Command::GetPositions => "positions",
            Mt5Command::ClosePosition => "closed_ticket",
            Mt5Command::Shutdown => "message",
        }
    }

    /// Positional argument names, for help output.
    pub fn arg_names(&self) -> &'static [&'static str] {
        match self {
            Mt5Command::ConnectWithCredentials => &["login", "password", "server"],
            Mt5Command::GetMarketData => &["symbol", "timeframe", "count"],
            Mt5Command::GetTick => &["symbol"],
            Mt5Command::PlaceOrder => &["symbol", "type", "volume", "price", "sl", "tp", "comment"],
            Mt5Command::ClosePosition => &["ticket"],
            _ => &[],
        }
    }
}

impl fmt::Display for Mt5Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mt5Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mt5Command::ALL
            .iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| format!("unknown bridge command: {}", s))
    }
}
