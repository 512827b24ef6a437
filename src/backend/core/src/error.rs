//! Error handling for Relay Core.
//!
//! This module provides:
//! - A single error type with a stable, machine-readable [`ErrorCode`]
//! - The outbox failure taxonomy (transient backend, validation, lease lost, storage)
//! - User-facing vs internal messages, source chaining and severity-based logging
//! - HTTP status mapping for the admin API
//!
//! # Usage
//!
//! ```rust,ignore
//! use relay_core::error::{RelayError, Result};
//!
//! fn check(batch_size: usize) -> Result<()> {
//!     if batch_size == 0 {
//!         return Err(RelayError::validation("batch_size must be positive"));
//!     }
//!     Ok(())
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::lease::ShardId;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and are part of the admin API contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Coordination Errors (1000-1099)
    LeaseLost,
    ShardNotOwned,
    AgentNotRegistered,

    // Storage Errors (2000-2099)
    StorageError,
    StorageConnectionFailed,
    StorageTransactionFailed,
    RecordNotFound,
    DuplicateRecord,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Index Backend Errors (3000-3099)
    IndexBackendError,
    IndexBackendTimeout,
    IndexBackendUnavailable,
    WriteFenced,
    NetworkError,

    // Validation Errors (4100-4199)
    ValidationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::LeaseLost => 1000,
            Self::ShardNotOwned => 1001,
            Self::AgentNotRegistered => 1002,

            Self::StorageError => 2000,
            Self::StorageConnectionFailed => 2001,
            Self::StorageTransactionFailed => 2002,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::IndexBackendError => 3000,
            Self::IndexBackendTimeout => 3001,
            Self::IndexBackendUnavailable => 3002,
            Self::WriteFenced => 3003,
            Self::NetworkError => 3005,

            Self::ValidationError => 4100,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::RecordNotFound | Self::AgentNotRegistered => StatusCode::NOT_FOUND,

            Self::DuplicateRecord
            | Self::LeaseLost
            | Self::ShardNotOwned
            | Self::WriteFenced => StatusCode::CONFLICT,

            Self::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,

            Self::StorageConnectionFailed | Self::IndexBackendUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            Self::IndexBackendTimeout => StatusCode::GATEWAY_TIMEOUT,

            Self::IndexBackendError | Self::NetworkError => StatusCode::BAD_GATEWAY,

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable by the caller.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageConnectionFailed
                | Self::StorageTransactionFailed
                | Self::IndexBackendTimeout
                | Self::IndexBackendUnavailable
                | Self::NetworkError
        )
    }

    /// Errors that must abort the whole processing cycle.
    pub const fn is_systemic(&self) -> bool {
        matches!(
            self,
            Self::LeaseLost
                | Self::ShardNotOwned
                | Self::AgentNotRegistered
                | Self::WriteFenced
                | Self::StorageError
                | Self::StorageConnectionFailed
                | Self::StorageTransactionFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "coordination",
            2000..=2199 => "storage",
            2200..=2299 => "serialization",
            3000..=3099 => "index_backend",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            _ => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown ids)
    Low,
    /// Operational issues (timeouts, lost leases)
    Medium,
    /// Storage and internal failures
    High,
    /// Failures that stop the agent
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord => Self::Low,

            ErrorCode::LeaseLost
            | ErrorCode::ShardNotOwned
            | ErrorCode::AgentNotRegistered
            | ErrorCode::IndexBackendError
            | ErrorCode::IndexBackendTimeout
            | ErrorCode::IndexBackendUnavailable
            | ErrorCode::WriteFenced
            | ErrorCode::NetworkError => Self::Medium,

            ErrorCode::StorageError
            | ErrorCode::StorageConnectionFailed
            | ErrorCode::StorageTransactionFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InternalError => Self::High,

            ErrorCode::ConfigurationError | ErrorCode::InvalidConfiguration => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured error details.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// The entity type involved (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// The entity ID involved (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// The shard involved (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<u32>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_shard(mut self, shard: ShardId) -> Self {
        self.shard = Some(shard.0);
        self
    }

    fn is_empty(&self) -> bool {
        self.entity_type.is_none() && self.shard.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Relay Core.
#[derive(Error, Debug)]
pub struct RelayError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to API clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl RelayError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// The caller's lease on `shard` has been taken over or its epoch is stale.
    pub fn lease_lost(shard: ShardId, message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::LeaseLost,
            format!("Lease on shard {} is no longer held", shard),
            message,
        )
        .with_details(ErrorDetails::new().with_shard(shard))
    }

    /// The caller's fence never covered `shard`, so it cannot settle events there.
    pub fn shard_not_owned(shard: ShardId, message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ShardNotOwned,
            format!("Shard {} is not leased by the caller", shard),
            message,
        )
        .with_details(ErrorDetails::new().with_shard(shard))
    }

    /// The index refused a write because a newer writer got there first.
    pub fn write_fenced(entity_type: impl Into<String>, entity_id: impl Into<String>, message: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::with_internal(
            ErrorCode::WriteFenced,
            format!("Index write for {}:{} was fenced off", entity_type, entity_id),
            message,
        )
        .with_details(ErrorDetails::new().with_entity(entity_type, entity_id))
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvalidConfiguration,
            "Invalid configuration",
            message,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Whether this error must abort the current processing cycle.
    pub fn is_systemic(&self) -> bool {
        self.code.is_systemic()
    }

    pub fn is_lease_lost(&self) -> bool {
        self.code == ErrorCode::LeaseLost
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "Relay error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "Relay error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Relay error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "relay_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for admin API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,

    /// Human-readable error message
    pub error: String,

    /// Machine-readable error code
    pub error_code: ErrorCode,

    /// Numeric error code
    pub numeric_code: u32,

    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&RelayError> for ErrorResponse {
    fn from(error: &RelayError) -> Self {
        Self {
            success: false,
            error: error.user_message.to_string(),
            error_code: error.code,
            numeric_code: error.code.numeric_code(),
            details: if error.details.is_empty() {
                None
            } else {
                Some(error.details.clone())
            },
            timestamp: chrono::Utc::now(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for RelayError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => {
                if let Some(constraint) = db_err.constraint() {
                    if constraint.contains("pkey") || constraint.contains("unique") {
                        return Self::with_internal(
                            ErrorCode::DuplicateRecord,
                            "A record with this identifier already exists",
                            format!("Constraint violation: {}", constraint),
                        )
                        .with_source(error);
                    }
                }
                (ErrorCode::StorageError, "An outbox storage error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::StorageConnectionFailed,
                "Unable to connect to the outbox database",
            ),
            _ => (ErrorCode::StorageError, "An outbox storage error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() {
            (ErrorCode::IndexBackendTimeout, "Index backend request timed out")
        } else if error.is_connect() {
            (ErrorCode::NetworkError, "Failed to connect to index backend")
        } else {
            (ErrorCode::IndexBackendError, "Index backend request failed")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Failed to load configuration",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for RelayError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An I/O error occurred", error.to_string())
            .with_source(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_lost_is_systemic_not_retryable() {
        let err = RelayError::lease_lost(ShardId(3), "epoch 4 superseded by 5");
        assert_eq!(err.code(), ErrorCode::LeaseLost);
        assert!(err.is_systemic());
        assert!(!err.is_retryable());
        assert_eq!(err.details().shard, Some(3));
        assert_eq!(err.http_status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_display_includes_internal_message() {
        let err = RelayError::with_internal(
            ErrorCode::StorageError,
            "Outbox storage failure",
            "connection reset by peer",
        );
        let rendered = err.to_string();
        assert!(rendered.starts_with("[StorageError]"));
        assert!(rendered.contains("connection reset by peer"));
    }

    #[test]
    fn test_categories() {
        assert_eq!(ErrorCode::LeaseLost.category(), "coordination");
        assert_eq!(ErrorCode::StorageError.category(), "storage");
        assert_eq!(ErrorCode::IndexBackendTimeout.category(), "index_backend");
        assert_eq!(ErrorCode::ValidationError.category(), "validation");
    }

    #[test]
    fn test_ownership_errors_are_systemic_conflicts() {
        let err = RelayError::shard_not_owned(ShardId(2), "acknowledge by agent a");
        assert_eq!(err.code(), ErrorCode::ShardNotOwned);
        assert!(err.is_systemic());
        assert_eq!(err.http_status(), StatusCode::CONFLICT);
        assert_eq!(err.details().shard, Some(2));

        let fenced = RelayError::write_fenced("Book", "42", "version conflict");
        assert!(fenced.is_systemic());
        assert_eq!(fenced.details().entity_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_error_response_omits_empty_details() {
        let err = RelayError::validation("max_batch_size must be positive");
        let response = ErrorResponse::from(&err);
        assert!(!response.success);
        assert!(response.details.is_none());
        assert_eq!(response.numeric_code, 4100);
    }
}
