//! Error types.
//!
//! [`GenAiError`] covers everything that can go wrong talking to the model
//! API. [`RelayError`] is what a `/generate` handler returns; its
//! [`IntoResponse`] impl is the single place failures become HTTP responses.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Body returned when the request carries no usable query.
pub const MISSING_QUERY_MESSAGE: &str = "Missing 'query' in request body";

/// Prefix of every server-error body, including errors appended mid-stream.
pub const SERVER_ERROR_PREFIX: &str = "❗ Server error: ";

#[derive(Debug, Error)]
pub enum GenAiError {
    #[error("request to model API failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model API returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("invalid response chunk from model API: {0}")]
    Decode(#[from] serde_json::Error),

    /// Error object delivered inside the event stream after a 200.
    #[error("model API error {code} {status}: {message}")]
    Upstream {
        code: i64,
        status: String,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Auth(String),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Missing 'query' in request body")]
    MissingQuery,

    #[error("{0}")]
    InvalidBody(String),

    #[error(transparent)]
    Upstream(#[from] GenAiError),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MissingQuery => StatusCode::BAD_REQUEST,
            RelayError::InvalidBody(_) | RelayError::Upstream(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Render an error the way a failed request reports it to the caller.
pub fn server_error_text(err: &dyn std::fmt::Display) -> String {
    format!("{SERVER_ERROR_PREFIX}{err}")
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            RelayError::MissingQuery => MISSING_QUERY_MESSAGE.to_string(),
            other => {
                tracing::error!(error = %other, "Request failed");
                server_error_text(other)
            }
        };

        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    }
}
