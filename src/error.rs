//! Error taxonomy shared by the ingestion and retrieval pipelines.
//!
//! Library code returns [`KbError`]; the `wkb` binary wraps it with
//! `anyhow` for context. Every HTTP collaborator maps response status codes
//! through [`KbError::from_status`] so retry decisions are made in one place.

use reqwest::StatusCode;

/// Top-level error type for all knowledge-base operations.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// Network or service unavailability. Retried with backoff at the call site.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The remote side asked us to slow down.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<std::time::Duration>,
    },

    /// A per-call deadline elapsed.
    #[error("timed out after {secs}s: {what}")]
    Timeout { what: String, secs: u64 },

    /// A referenced page, attachment, document or session does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Credential rejected. Fatal for the current run.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Markup that cannot be parsed into normalized text.
    #[error("malformed content: {0}")]
    MalformedContent(String),

    /// Content that cannot be rendered safely.
    #[error("sanitization violation: {0}")]
    SanitizationViolation(String),

    /// A source asset or remote resource could not be fetched.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// A conditional write lost against a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Local database failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A model or remote service returned a response we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KbError>;

impl KbError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_) | Self::RateLimited { .. } | Self::Timeout { .. }
        )
    }

    /// Short machine-readable label, used in reports and API errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientIo(_) => "transient_io",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout { .. } => "timeout",
            Self::NotFound(_) => "not_found",
            Self::Auth(_) => "auth",
            Self::MalformedContent(_) => "malformed_content",
            Self::SanitizationViolation(_) => "sanitization_violation",
            Self::Fetch(_) => "fetch",
            Self::Conflict(_) => "conflict",
            Self::Config { .. } => "config",
            Self::Storage(_) => "storage",
            Self::InvalidResponse(_) => "invalid_response",
        }
    }

    /// Classify a non-success HTTP status.
    ///
    /// | Status | Error |
    /// |--------|-------|
    /// | 401, 403 | [`KbError::Auth`] |
    /// | 404 | [`KbError::NotFound`] |
    /// | 429 | [`KbError::RateLimited`] |
    /// | 408, 5xx | [`KbError::TransientIo`] |
    /// | other | [`KbError::Fetch`] |
    pub fn from_status(status: StatusCode, context: impl Into<String>) -> Self {
        let msg = format!("{} (HTTP {})", context.into(), status.as_u16());
        match status.as_u16() {
            401 | 403 => Self::Auth(msg),
            404 => Self::NotFound(msg),
            429 => Self::RateLimited {
                message: msg,
                retry_after: None,
            },
            408 => Self::TransientIo(msg),
            s if s >= 500 => Self::TransientIo(msg),
            _ => Self::Fetch(msg),
        }
    }
}

impl From<sqlx::Error> for KbError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for KbError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::TransientIo(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status, err.to_string())
        } else {
            Self::Fetch(err.to_string())
        }
    }
}

impl From<serde_json::Error> for KbError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            KbError::from_status(StatusCode::UNAUTHORIZED, "list"),
            KbError::Auth(_)
        ));
        assert!(matches!(
            KbError::from_status(StatusCode::NOT_FOUND, "page"),
            KbError::NotFound(_)
        ));
        assert!(KbError::from_status(StatusCode::TOO_MANY_REQUESTS, "x").is_retryable());
        assert!(KbError::from_status(StatusCode::BAD_GATEWAY, "x").is_retryable());
        assert!(!KbError::from_status(StatusCode::BAD_REQUEST, "x").is_retryable());
    }

    #[test]
    fn display_formatting() {
        let err = KbError::config("spaces must not be empty");
        assert_eq!(err.to_string(), "config error: spaces must not be empty");
        assert_eq!(err.kind(), "config");
    }
}
