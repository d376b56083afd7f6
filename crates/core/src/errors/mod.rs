//! Error types for the DocForge reasoning engine
//!
//! Provides:
//! - Distinct error types for each failure mode of the pipeline
//! - Machine-readable error codes for the API layer
//! - HTTP status code mapping for front-ends that expose the session API

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,

    // Session errors (4xxx)
    SessionNotFound,
    InvalidSessionState,
    SessionTimeout,
    ReasoningFailed,

    // External service errors (8xxx)
    LlmUnavailable,
    LlmStatus,
    LlmTimeout,
    MalformedResponse,
    KnowledgeLookup,
    UpstreamError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,

            ErrorCode::SessionNotFound => 4005,
            ErrorCode::InvalidSessionState => 4006,
            ErrorCode::SessionTimeout => 4007,
            ErrorCode::ReasoningFailed => 4008,

            ErrorCode::LlmUnavailable => 8010,
            ErrorCode::LlmStatus => 8011,
            ErrorCode::LlmTimeout => 8012,
            ErrorCode::MalformedResponse => 8013,
            ErrorCode::KnowledgeLookup => 8020,
            ErrorCode::UpstreamError => 8001,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    // Session errors
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Session {id} is {state}, expected {expected}")]
    InvalidSessionState {
        id: String,
        state: String,
        expected: String,
    },

    #[error("Session {id} did not finish within {timeout_ms}ms")]
    SessionTimeout { id: String, timeout_ms: u64 },

    #[error("Reasoning failed for session {id}: {message}")]
    ReasoningFailed { id: String, message: String },

    // LLM backend errors
    #[error("LLM backend unavailable: {message}")]
    LlmUnavailable { message: String },

    #[error("LLM backend returned status {status}: {body}")]
    LlmStatus { status: u16, body: String },

    #[error("LLM request timed out after {timeout_ms}ms")]
    LlmTimeout { timeout_ms: u64 },

    #[error("Malformed LLM response: {message}")]
    MalformedResponse { message: String },

    // Knowledge lookup errors
    #[error("Knowledge lookup failed: {message}")]
    KnowledgeLookup { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            AppError::InvalidSessionState { .. } => ErrorCode::InvalidSessionState,
            AppError::SessionTimeout { .. } => ErrorCode::SessionTimeout,
            AppError::ReasoningFailed { .. } => ErrorCode::ReasoningFailed,
            AppError::LlmUnavailable { .. } => ErrorCode::LlmUnavailable,
            AppError::LlmStatus { .. } => ErrorCode::LlmStatus,
            AppError::LlmTimeout { .. } => ErrorCode::LlmTimeout,
            AppError::MalformedResponse { .. } => ErrorCode::MalformedResponse,
            AppError::KnowledgeLookup { .. } => ErrorCode::KnowledgeLookup,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration(_) => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            AppError::SessionNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::InvalidSessionState { .. } => StatusCode::CONFLICT,

            // 500 Internal Server Error
            AppError::ReasoningFailed { .. }
            | AppError::Internal { .. }
            | AppError::Configuration(_)
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::LlmStatus { .. }
            | AppError::MalformedResponse { .. }
            | AppError::KnowledgeLookup { .. }
            | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::LlmUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            AppError::SessionTimeout { .. } | AppError::LlmTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
        }
    }

    /// Whether a pipeline stage may recover from this error with a heuristic fallback
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::LlmUnavailable { .. }
                | AppError::LlmStatus { .. }
                | AppError::LlmTimeout { .. }
                | AppError::MalformedResponse { .. }
                | AppError::KnowledgeLookup { .. }
                | AppError::HttpClient(_)
                | AppError::Serialization(_)
        )
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Structured body for API layers
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetails {
                code: self.code(),
                message: self.to_string(),
                details: None,
            },
        }
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        let field = err.field_errors().keys().next().map(|f| f.to_string());
        AppError::Validation {
            message: err.to_string(),
            field,
        }
    }
}
