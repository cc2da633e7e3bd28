use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::billing::BillingError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("payment processor unavailable: {0}")]
    BadGateway(String),
    #[error("{0} timed out, please retry")]
    GatewayTimeout(&'static str),
    #[error("{0}")]
    Message(String),
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(message) | BillingError::Precondition(message) => {
                AppError::BadRequest(message)
            }
            BillingError::Catalog(err) => AppError::BadRequest(err.to_string()),
            BillingError::NotFound(what) => AppError::NotFound(what),
            BillingError::Processor(err) => AppError::BadGateway(err.to_string()),
            BillingError::Store(err) => AppError::Db(err),
            BillingError::Timeout(operation) => AppError::GatewayTimeout(operation),
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self);
        }
        // Store failures are not echoed to the caller.
        let message = match &self {
            AppError::Db(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
