use crate::models::*;
use async_trait::async_trait;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Bridge Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while talking to the remote bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected to bridge at {0}")]
    NotConnected(String),
    #[error("Bridge is disabled")]
    Disabled,
    #[error("Invalid bridge endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
    #[error("Bridge error: {0}")]
    Remote(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Config error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether the failure was at the transport level rather than in the terminal.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionFailed(_)
                | BridgeError::NotConnected(_)
                | BridgeError::Disabled
                | BridgeError::InvalidEndpoint(_)
                | BridgeError::ConnectionClosed(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Bridge Channel Trait
// ---------------------------------------------------------------------------

/// A request/response channel to a trading-platform bridge.
///
/// Implementations own the underlying socket; callers only see
/// correlated commands and a status snapshot.
#[async_trait]
pub trait BridgeChannel: Send + Sync {
    /// Establish the connection, retrying per the channel's policy.
    /// Returns `false` once retries are exhausted.
    async fn connect(&self) -> bool;

    /// Close the connection and fail any in-flight commands.
    async fn disconnect(&self);

    /// Send a command and wait for the matching response's `result`.
    async fn call(
        &self,
        command: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, BridgeError>;

    /// Current connection snapshot. Never blocks on I/O.
    fn status(&self) -> BridgeStatus;

    /// The active connection record.
    fn config(&self) -> BridgeConfig;

    /// Replace and persist the connection record, dropping any live socket.
    async fn update_config(&self, config: BridgeConfig) -> Result<(), BridgeError>;
}
