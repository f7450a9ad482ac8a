use chrono::{DateTime, Utc};
use std::sync::Arc;
use tradedesk_brokers_metatrader::Mt5Client;
use tradedesk_core::BridgeChannel;

/// Shared application state accessible by all route handlers.
pub struct AppState {
    pub bridge: Arc<dyn BridgeChannel>,
    pub mt5: Mt5Client,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(bridge: Arc<dyn BridgeChannel>) -> Self {
        Self {
            mt5: Mt5Client::new(bridge.clone()),
            bridge,
            started_at: Utc::now(),
        }
    }
}
