//! Provider error taxonomy.

use reqwest::StatusCode;
use thiserror::Error;

/// Failure reported by an external provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Retryable: timeouts, connection resets, rate limits, 5xx.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Unretryable: bad credentials, malformed request or configuration.
    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(provider: &str, status: StatusCode, body: &str) -> Self {
        let msg = format!("{provider} API error {status}: {body}");
        if is_retryable_status(status) {
            Self::Transient(msg)
        } else {
            Self::Fatal(msg)
        }
    }

    pub fn missing_api_key(provider: &str) -> Self {
        Self::Fatal(format!("No API key configured for provider '{provider}'"))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if is_retryable_status(status) {
                return Self::Transient(e.to_string());
            }
            return Self::Fatal(e.to_string());
        }
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            Self::Transient(e.to_string())
        } else {
            Self::Fatal(e.to_string())
        }
    }
}
