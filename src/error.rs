//! # Error Handling
//!
//! The HTTP edge collapses every internal failure into one of two classes:
//! client errors (400, a short reason the caller may see) and server errors
//! (500, a fixed body, full detail in the structured log only).

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::telemetry;

/// Body returned for every server error.
pub const SERVER_ERROR_BODY: &str = "Server error";

/// Error returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or unauthenticated request. The message is returned to the caller.
    #[error("client error: {message}")]
    Client { message: String },
    /// Internal failure. Only the log sees the source.
    #[error("server error: {0:#}")]
    Server(#[from] anyhow::Error),
}

impl ApiError {
    pub fn client(message: impl Into<String>) -> Self {
        Self::Client {
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Client { .. } => StatusCode::BAD_REQUEST,
            ApiError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::Client { message } => {
                tracing::warn!(reason = %message, "Client error");
                format!("Client error: {}", message)
            }
            ApiError::Server(source) => {
                tracing::error!(error = ?source, "Server error");
                SERVER_ERROR_BODY.to_string()
            }
        };

        (status, trace_headers(), body).into_response()
    }
}

/// Response headers echoing the active trace id, when there is one.
pub fn trace_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(trace_id) = telemetry::current_trace_id()
        && let Ok(value) = HeaderValue::from_str(&trace_id)
    {
        headers.insert("x-trace-id", value);
    }
    headers
}
