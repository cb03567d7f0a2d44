use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Error taxonomy for the capture engine.
///
/// Render-side failures carry enough of the underlying message to be
/// pattern-classified into an [`ErrorCategory`]; engine-side failures
/// (claims, checkpoints, lifecycle) are explicit variants so callers can
/// react without string matching.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Render session creation failed: {0}")]
    SessionCreationFailed(String),

    #[error("Render navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Render capture failed: {0}")]
    CaptureFailed(String),

    #[error("Render connection error: {0}")]
    ConnectionError(String),

    #[error("Render timed out after {0:?}")]
    RenderTimeout(Duration),

    #[error("Render resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Target not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported renderer version: {0}")]
    UnsupportedVersion(String),

    #[error("Rate limit permit not acquired within {0:?}")]
    RateLimitTimeout(Duration),

    #[error("Artifact upload failed for key {key}: {reason}")]
    Upload { key: String, reason: String },

    #[error("Checkpoint write failed: {0}")]
    CheckpointWrite(String),

    /// Another worker owns the item. A skip signal, not a failure.
    #[error("Item {0} already claimed")]
    ClaimConflict(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Invalid job transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tweet source error: {0}")]
    Source(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Semaphore acquire error: {0}")]
    SemaphoreError(String),
}

/// Classification of a render failure for retry purposes.
///
/// Persisted on failed items as `last_error_category` so an operator can
/// distinguish "renderer is down, retry later" from "this tweet is gone".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Connection, timeout, or session-level failure; retryable.
    Transient,
    /// The target no longer exists or cannot be accessed; never retried.
    Permanent,
    /// Unrecognized failure; retried with the same cap as Transient.
    Unknown,
}

impl CaptureError {
    /// Pattern-based classification of the error's kind and message.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CaptureError::SessionCreationFailed(_)
            | CaptureError::NavigationFailed(_)
            | CaptureError::ConnectionError(_)
            | CaptureError::RenderTimeout(_)
            | CaptureError::ResourceUnavailable(_)
            | CaptureError::RateLimitTimeout(_) => ErrorCategory::Transient,
            CaptureError::NotFound(_)
            | CaptureError::PermissionDenied(_)
            | CaptureError::UnsupportedVersion(_) => ErrorCategory::Permanent,
            CaptureError::CaptureFailed(msg) => classify_message(msg),
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() != ErrorCategory::Permanent
    }

    /// Process exit code for the CLI: 2 bad input, 3 resource unavailable,
    /// 4 job not found, 1 anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            CaptureError::InvalidInput(_) | CaptureError::ConfigurationError(_) => 2,
            CaptureError::ResourceUnavailable(_)
            | CaptureError::RateLimitTimeout(_)
            | CaptureError::SessionCreationFailed(_) => 3,
            CaptureError::JobNotFound(_) => 4,
            _ => 1,
        }
    }
}

/// Fallback classification for capture failures whose only signal is the
/// underlying renderer message.
fn classify_message(msg: &str) -> ErrorCategory {
    let lower = msg.to_lowercase();
    let transient = [
        "timeout",
        "timed out",
        "connection",
        "reset",
        "unavailable",
        "session not created",
        "target crashed",
    ];
    let permanent = [
        "not found",
        "no such",
        "permission denied",
        "unsupported version",
    ];

    if transient.iter().any(|p| lower.contains(p)) {
        ErrorCategory::Transient
    } else if permanent.iter().any(|p| lower.contains(p)) {
        ErrorCategory::Permanent
    } else {
        ErrorCategory::Unknown
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<AcquireError> for CaptureError {
    fn from(err: AcquireError) -> Self {
        CaptureError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for CaptureError {
    fn from(err: reqwest::Error) -> Self {
        CaptureError::Source(err.to_string())
    }
}
