//! MetaTrader 5 bridge adapter.
//!
//! Talks to a Python bridge process running next to the MT5 terminal, either
//! over a WebSocket (sending `{id, command, args}` envelopes and matching
//! replies by id) or by running the bridge script once per command.

pub mod client;
pub mod config;
pub mod connection;
pub mod local;
pub mod protocol;

pub use client::Mt5Client;
pub use config::{BridgeOptions, ConfigStore};
pub use connection::BridgeManager;
pub use local::LocalBridge;
pub use protocol::Mt5Command;
