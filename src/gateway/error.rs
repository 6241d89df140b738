//! Errors surfaced by the provider gateway.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 429. `retry_after` comes from the `Retry-After` header when sent.
    #[error("rate limited by provider, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        request_id: Option<String>,
    },

    /// Any other non-2xx status.
    #[error("provider returned HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        /// `error.code` from the response body.
        code: Option<String>,
        request_id: Option<String>,
    },

    /// A 2xx response the gateway could not use.
    #[error("unusable provider response: {0}")]
    InvalidResponse(String),

    /// Rejected locally before anything was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing credentials or an unbuildable client.
    #[error("gateway not configured: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// 429, 408 and 5xx are transient, as are connect and timeout failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Status { status, .. } => *status == 408 || *status >= 500,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::InvalidResponse(_) | Self::InvalidRequest(_) | Self::Config(_) => false,
        }
    }

    /// Stable short name for usage records and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Status { status, .. } if *status >= 500 => "server_error",
            Self::Status { .. } => "client_error",
            Self::InvalidResponse(_) => "invalid_response",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Http(e) if e.is_timeout() => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    /// `x-request-id` of the failed exchange, for support tickets.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::RateLimited { request_id, .. } | Self::Status { request_id, .. } => {
                request_id.as_deref()
            }
            _ => None,
        }
    }
}
