//! Error types for the rendering engine
//!
//! `RenderError` is the engine-wide failure type. Every variant maps onto an
//! `ErrorKind` from the failure taxonomy, which drives retry and fallback
//! decisions. `ErrorRecord` is the serializable form kept in error histories,
//! diagnostics and render results. `AppError` is the HTTP-facing wrapper.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::preferences::PreferenceError;
use crate::progress::RenderStage;
use crate::renderer::RenderingMethod;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, RenderError>;

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// DNS, connection and transfer failures
    NetworkError,
    /// Expired or invalid signed URL that could not be refreshed
    AuthenticationError,
    /// Rendering surface allocation failure
    CanvasError,
    /// Allocation failure or memory pressure
    MemoryError,
    PdfPasswordProtected,
    PdfCorrupted,
    /// The current method is not available in this environment
    BrowserCompatibility,
    SecurityPermissionDenied,
    TimeoutError,
    /// Cooperative cancellation by the caller
    Cancelled,
    /// Unclassified primitive failure
    Unknown,
}

impl ErrorKind {
    /// Terminal kinds are never retried and never fall back
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorKind::AuthenticationError
                | ErrorKind::PdfPasswordProtected
                | ErrorKind::PdfCorrupted
                | ErrorKind::SecurityPermissionDenied
                | ErrorKind::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::AuthenticationError => "AUTHENTICATION_ERROR",
            ErrorKind::CanvasError => "CANVAS_ERROR",
            ErrorKind::MemoryError => "MEMORY_ERROR",
            ErrorKind::PdfPasswordProtected => "PDF_PASSWORD_PROTECTED",
            ErrorKind::PdfCorrupted => "PDF_CORRUPTED",
            ErrorKind::BrowserCompatibility => "BROWSER_COMPATIBILITY",
            ErrorKind::SecurityPermissionDenied => "SECURITY_PERMISSION_DENIED",
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-wide error type
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// Connection, DNS or body transfer failure
    #[error("Network error: {0}")]
    Network(String),

    /// Non-success HTTP status that is not an expired signature
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// Signed URL expired and could not be refreshed
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Canvas allocation or drawing failure
    #[error("Canvas error: {0}")]
    Canvas(String),

    /// Allocation failure or memory pressure
    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Document is password protected")]
    PasswordProtected,

    #[error("Document is corrupted: {0}")]
    Corrupted(String),

    /// Method unavailable in the current environment
    #[error("Browser compatibility: {0}")]
    BrowserCompatibility(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Rendering cancelled: {0}")]
    Cancelled(String),

    /// Failure reported by the page-rendering primitive, classified by message
    #[error("Render error: {0}")]
    Primitive(String),
}

impl RenderError {
    /// Map this error onto the failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            RenderError::Network(_) => ErrorKind::NetworkError,
            RenderError::Http { status, .. } => match status {
                401 | 403 => ErrorKind::AuthenticationError,
                408 | 504 => ErrorKind::TimeoutError,
                _ => ErrorKind::NetworkError,
            },
            RenderError::Authentication(_) => ErrorKind::AuthenticationError,
            RenderError::Canvas(_) => ErrorKind::CanvasError,
            RenderError::Memory(_) => ErrorKind::MemoryError,
            RenderError::PasswordProtected => ErrorKind::PdfPasswordProtected,
            RenderError::Corrupted(_) => ErrorKind::PdfCorrupted,
            RenderError::BrowserCompatibility(_) => ErrorKind::BrowserCompatibility,
            RenderError::PermissionDenied(_) => ErrorKind::SecurityPermissionDenied,
            RenderError::Timeout(_) => ErrorKind::TimeoutError,
            RenderError::Cancelled(_) => ErrorKind::Cancelled,
            RenderError::Primitive(message) => classify_message(message),
        }
    }

    /// Whether repeating the same request can succeed
    ///
    /// Permanent client errors (404, 410, ...) are not worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            RenderError::Http { status, .. } => {
                matches!(status, 408 | 425 | 429) || *status >= 500
            }
            other => !other.kind().is_terminal(),
        }
    }
}

/// Classify a free-text failure message from an external primitive
pub fn classify_message(message: &str) -> ErrorKind {
    let message = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    if has(&["password", "encrypted"]) {
        ErrorKind::PdfPasswordProtected
    } else if has(&["invalid pdf", "corrupt", "malformed", "unexpected end", "bad xref"]) {
        ErrorKind::PdfCorrupted
    } else if has(&["canvas", "context lost", "getcontext"]) {
        ErrorKind::CanvasError
    } else if has(&["out of memory", "memory", "allocation failed"]) {
        ErrorKind::MemoryError
    } else if has(&["timeout", "timed out"]) {
        ErrorKind::TimeoutError
    } else if has(&["permission", "security", "cors", "not allowed"]) {
        ErrorKind::SecurityPermissionDenied
    } else if has(&["unauthorized", "forbidden", "expired", "signature"]) {
        ErrorKind::AuthenticationError
    } else if has(&["not supported", "unsupported", "not available"]) {
        ErrorKind::BrowserCompatibility
    } else if has(&["network", "fetch", "connection", "dns", "socket"]) {
        ErrorKind::NetworkError
    } else {
        ErrorKind::Unknown
    }
}

/// Serializable record of one failure within a render request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    /// Method active when the failure happened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<RenderingMethod>,
    pub stage: RenderStage,
    /// Attempt number within the method (1-based)
    pub attempt: u32,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Build a record from an engine error
    pub fn from_error(
        error: &RenderError,
        method: Option<RenderingMethod>,
        stage: RenderStage,
        attempt: u32,
    ) -> Self {
        let kind = error.kind();
        Self {
            kind,
            message: error.to_string(),
            method,
            stage,
            attempt,
            recoverable: !kind.is_terminal() && error.is_retryable(),
            timestamp: Utc::now(),
        }
    }
}

/// HTTP surface error type
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Preference error: {0}")]
    Preferences(#[from] PreferenceError),
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Render(e) => {
                tracing::warn!(kind = %e.kind(), "Render error: {}", e);
                let status = match e.kind() {
                    ErrorKind::AuthenticationError => StatusCode::UNAUTHORIZED,
                    ErrorKind::SecurityPermissionDenied => StatusCode::FORBIDDEN,
                    ErrorKind::PdfPasswordProtected | ErrorKind::PdfCorrupted => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    ErrorKind::TimeoutError => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_GATEWAY,
                };
                (status, "render_error", e.kind().as_str().to_string())
            }
            AppError::Preferences(PreferenceError::Invalid(msg)) => {
                (StatusCode::BAD_REQUEST, "bad_request", msg.clone())
            }
            AppError::Preferences(e) => {
                tracing::error!("Preference error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "preferences_error",
                    "Failed to persist preferences".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}
