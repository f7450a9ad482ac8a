use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use tradedesk_core::*;

use crate::protocol::Mt5Command;

/// Typed MetaTrader 5 operations over a [`BridgeChannel`].
///
/// Each method maps to one bridge command and decodes the payload field
/// of its `result` object.
#[derive(Clone)]
pub struct Mt5Client {
    bridge: Arc<dyn BridgeChannel>,
}

impl Mt5Client {
    pub fn new(bridge: Arc<dyn BridgeChannel>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &Arc<dyn BridgeChannel> {
        &self.bridge
    }

    /// Initialise the terminal and return the logged-in account.
    pub async fn test_connection(&self) -> Result<AccountInfo, BridgeError> {
        self.request(Mt5Command::TestConnection, Vec::new()).await
    }

    /// Log the terminal into a specific account.
    pub async fn login(&self, credentials: &Credentials) -> Result<AccountInfo, BridgeError> {
        let account: AccountInfo = self
            .request(
                Mt5Command::ConnectWithCredentials,
                vec![
                    json!(credentials.login),
                    json!(credentials.password),
                    json!(credentials.server),
                ],
            )
            .await?;
        info!(login = account.login, server = %account.server, "Logged in to MT5 account");
        Ok(account)
    }

    pub async fn symbols(&self) -> Result<Vec<SymbolInfo>, BridgeError> {
        self.request(Mt5Command::GetSymbols, Vec::new()).await
    }

    /// The most recent `count` bars for `symbol`.
    pub async fn market_data(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: u32,
    ) -> Result<Vec<Rate>, BridgeError> {
        if count == 0 {
            return Err(BridgeError::InvalidRequest("count must be positive".to_string()));
        }
        self.request(
            Mt5Command::GetMarketData,
            vec![json!(symbol), json!(timeframe.as_str()), json!(count)],
        )
        .await
    }

    pub async fn tick(&self, symbol: &str) -> Result<TickData, BridgeError> {
        self.request(Mt5Command::GetTick, vec![json!(symbol)]).await
    }

    pub async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult, BridgeError> {
        order.validate().map_err(BridgeError::InvalidRequest)?;
        let result: OrderResult = self.request(Mt5Command::PlaceOrder, order.to_args()).await?;
        info!(
            ticket = result.ticket,
            symbol = %order.symbol,
            side = ?order.side,
            volume = %result.volume,
            price = %result.price,
            "Order placed"
        );
        Ok(result)
    }

    /// Open positions. An absent list means there are none.
    pub async fn positions(&self) -> Result<Vec<PositionInfo>, BridgeError> {
        let command = Mt5Command::GetPositions;
        let mut result = self.bridge.call(command.name(), Vec::new()).await?;
        match result.get_mut(command.result_field()).map(Value::take) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(list) => decode(command, list),
        }
    }

    /// Close a position by ticket, returning the closed ticket.
    pub async fn close_position(&self, ticket: u64) -> Result<u64, BridgeError> {
        let closed: u64 = self.request(Mt5Command::ClosePosition, vec![json!(ticket)]).await?;
        info!(ticket = closed, "Position closed");
        Ok(closed)
    }

    /// Shut down the terminal session on the bridge side.
    pub async fn shutdown(&self) -> Result<String, BridgeError> {
        self.request(Mt5Command::Shutdown, Vec::new()).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        command: Mt5Command,
        args: Vec<Value>,
    ) -> Result<T, BridgeError> {
        let mut result = self.bridge.call(command.name(), args).await?;
        let payload = result
            .get_mut(command.result_field())
            .map(Value::take)
            .ok_or_else(|| {
                BridgeError::InvalidResponse(format!(
                    "'{}' response is missing '{}'",
                    command,
                    command.result_field()
                ))
            })?;
        decode(command, payload)
    }
}

fn decode<T: DeserializeOwned>(command: Mt5Command, payload: Value) -> Result<T, BridgeError> {
    serde_json::from_value(payload).map_err(|e| {
        BridgeError::InvalidResponse(format!(
            "'{}' returned a malformed '{}': {}",
            command,
            command.result_field(),
            e
        ))
    })
}
