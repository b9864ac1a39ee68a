use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::strategy::Strategy;

/// Engine-wide error types for Argos.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP-level failure that is not a block (bad response framing, body read error).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Transport failure (DNS, connect, reset). Retried locally.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The source detected and resisted automated access.
    #[error("Blocked by source (strategy {strategy}, status {status:?})")]
    Blocked {
        strategy: Strategy,
        status: Option<u16>,
    },

    /// Host circuit is open; no I/O was attempted.
    #[error("Circuit open for {host}, retry after {retry_after:?}")]
    CircuitOpen { host: String, retry_after: Duration },

    /// No rate-limit token became available within the allowed wait.
    #[error("Rate limit exceeded for {0}")]
    RateLimitExceeded(String),

    /// Projected AI extraction cost is over the per-operation budget.
    #[error(
        "AI budget exceeded for {provider}: estimated ${estimated_cost_usd:.4} > ${budget_usd:.4}"
    )]
    AiBudgetExceeded {
        provider: String,
        estimated_cost_usd: f64,
        budget_usd: f64,
    },

    /// Structural parse of a fetched document failed.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Extraction provider call failed.
    #[error("LLM error (HTTP {status_code}): {message}")]
    LlmError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// HTML-to-text conversion failed.
    #[error("Cleaner error: {0}")]
    CleanerError(String),

    /// Extracted JSON does not match the expected schema.
    #[error("Schema validation error: {0}")]
    SchemaValidationError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The operation was cancelled by its parent.
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::LlmError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should count against a host's circuit.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::Blocked { .. }
            | AppError::RateLimitExceeded(_) => true,
            AppError::LlmError {
                status_code,
                retryable,
                ..
            } => *status_code == 429 || *status_code >= 500 || *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("connection")
            }
            _ => false,
        }
    }

    /// True for upstream throttling signals, which lengthen circuit cooldowns.
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            AppError::RateLimitExceeded(_)
                | AppError::Blocked {
                    status: Some(429),
                    ..
                }
                | AppError::LlmError {
                    status_code: 429,
                    ..
                }
        )
    }
}

/// Classification of a per-source failure, as surfaced in session metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorKind {
    Network,
    Blocked,
    CircuitOpen,
    RateLimited,
    Timeout,
    Parse,
    Extraction,
    /// The session deadline cut the source off before it finished.
    Incomplete,
    Other,
}

/// A structured, per-source error annotation.
///
/// Adapters return these alongside whatever records they managed to collect
/// instead of failing the whole call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceError {
    pub source: String,
    pub kind: SourceErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(source: impl Into<String>, kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn from_app_error(source: impl Into<String>, error: &AppError) -> Self {
        let kind = match error {
            AppError::NetworkError(_) | AppError::HttpError(_) => SourceErrorKind::Network,
            AppError::Blocked { .. } => SourceErrorKind::Blocked,
            AppError::CircuitOpen { .. } => SourceErrorKind::CircuitOpen,
            AppError::RateLimitExceeded(_) => SourceErrorKind::RateLimited,
            AppError::Timeout(_) => SourceErrorKind::Timeout,
            AppError::ParseError(_)
            | AppError::SerializationError(_)
            | AppError::CleanerError(_) => SourceErrorKind::Parse,
            AppError::LlmError { .. }
            | AppError::AiBudgetExceeded { .. }
            | AppError::SchemaValidationError(_) => SourceErrorKind::Extraction,
            AppError::Cancelled => SourceErrorKind::Incomplete,
            AppError::ConfigError(_) | AppError::Generic(_) => SourceErrorKind::Other,
        };
        Self::new(source, kind, error.to_string())
    }

    /// Deadline truncation, reported as a warning rather than a hard failure.
    pub fn incomplete(source: impl Into<String>) -> Self {
        Self::new(
            source,
            SourceErrorKind::Incomplete,
            "session deadline reached before the source finished",
        )
    }

    pub fn is_incomplete(&self) -> bool {
        self.kind == SourceErrorKind::Incomplete
    }
}
