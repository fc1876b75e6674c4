//! The broker's single error type and its wire representation.
//!
//! Every fallible operation in this crate returns `BrokerError`. Handlers
//! convert it to an HTTP response via `IntoResponse`; nothing here ever
//! serializes a stack trace or secret value into the response body.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// OAuth error codes from RFC 6749 plus the broker-specific
/// `registration_not_supported` (RFC 7591) and `server_error` catch-all.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    InvalidClient(String),

    #[error("{0}")]
    InvalidGrant(String),

    #[error("{0}")]
    UnsupportedGrantType(String),

    #[error("{0}")]
    UnsupportedResponseType(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("{0}")]
    RegistrationNotSupported(String),

    #[error("{0}")]
    ServerError(String),
}

impl BrokerError {
    fn code(&self) -> &'static str {
        match self {
            BrokerError::InvalidRequest(_) => "invalid_request",
            BrokerError::InvalidClient(_) => "invalid_client",
            BrokerError::InvalidGrant(_) => "invalid_grant",
            BrokerError::UnsupportedGrantType(_) => "unsupported_grant_type",
            BrokerError::UnsupportedResponseType(_) => "unsupported_response_type",
            BrokerError::AccessDenied(_) => "access_denied",
            BrokerError::RegistrationNotSupported(_) => "registration_not_supported",
            BrokerError::ServerError(_) => "server_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            BrokerError::InvalidClient(_) => StatusCode::UNAUTHORIZED,
            BrokerError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Logs this error at the level prescribed for its kind, then returns
    /// `self` so it can be chained straight into a handler's error path.
    pub fn log(self) -> Self {
        match &self {
            BrokerError::InvalidRequest(msg) => tracing::info!(error = %msg, "invalid_request"),
            BrokerError::InvalidClient(msg) => tracing::warn!(error = %msg, "invalid_client"),
            BrokerError::InvalidGrant(msg) => tracing::warn!(error = %msg, "invalid_grant"),
            BrokerError::UnsupportedGrantType(msg) => {
                tracing::info!(error = %msg, "unsupported_grant_type")
            }
            BrokerError::UnsupportedResponseType(msg) => {
                tracing::info!(error = %msg, "unsupported_response_type")
            }
            BrokerError::AccessDenied(msg) => tracing::warn!(error = %msg, "access_denied"),
            BrokerError::RegistrationNotSupported(msg) => {
                tracing::info!(error = %msg, "registration_not_supported")
            }
            BrokerError::ServerError(msg) => tracing::error!(error = %msg, "server_error"),
        }
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    error_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_uri: Option<String>,
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.code(),
            error_description: self.to_string(),
            error_uri: None,
        };
        (status, Json(body)).into_response()
    }
}
