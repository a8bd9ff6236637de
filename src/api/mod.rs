// =============================================================================
// HTTP surface: REST routes and the event websocket
// =============================================================================

pub mod rest;
pub mod ws;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, warn};

use crate::error::EngineError;

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InsufficientMargin { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PriceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::WalletNotFound(_) | Self::TradeNotFound(_) | Self::OrderNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Conflict(_) => StatusCode::CONFLICT,
            _ if self.is_validation() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
