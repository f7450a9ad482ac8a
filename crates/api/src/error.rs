use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tradedesk_core::BridgeError;

/// A bridge failure rendered as `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub BridgeError);

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(BridgeError::InvalidRequest(message.into()))
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            BridgeError::ConnectionFailed(_)
            | BridgeError::NotConnected(_)
            | BridgeError::Disabled
            | BridgeError::InvalidEndpoint(_)
            | BridgeError::ConnectionClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Remote(_) | BridgeError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self.0, "Bridge request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}
