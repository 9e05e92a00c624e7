use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use parley_gateway::GatewayError;
use parley_types::api::{ErrorBody, ErrorDetail};
use parley_types::events::ErrorReason;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = match &self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, ErrorReason::Unauthenticated),
            ApiError::Gateway(e) => {
                let status = match e.reason() {
                    ErrorReason::Unauthenticated => StatusCode::UNAUTHORIZED,
                    ErrorReason::InvalidMessage => StatusCode::BAD_REQUEST,
                    ErrorReason::Forbidden => StatusCode::FORBIDDEN,
                    ErrorReason::PersistenceFailure => {
                        error!("Store error while serving request: {}", e);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.reason())
            }
        };

        let body = Json(ErrorBody {
            error: ErrorDetail {
                reason: Some(reason),
                message: self.to_string(),
            },
        });

        (status, body).into_response()
    }
}
