// src/error.rs

//! Unified error handling for the dedup engine.

use std::fmt;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Timeout, connection reset or throttling response from a blob store.
    #[error("Transient storage error on {path}: {message}")]
    TransientStore { path: String, message: String },

    /// Authorization failure or other non-retryable store response.
    #[error("Permanent storage error on {path}: {message}")]
    PermanentStore { path: String, message: String },

    /// Blob does not exist
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// Retry budget spent on a transient failure
    #[error("{operation} {path} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        path: String,
        attempts: u32,
        #[source]
        source: Box<AppError>,
    },

    /// Startup could not load or rebuild dedup state. Always fatal.
    #[error("Initialization failed for job {job_id}: {source}")]
    Initialization {
        job_id: String,
        #[source]
        source: Box<AppError>,
    },

    /// Filter snapshot failed validation
    #[error("Corrupt filter snapshot {path}: {message}")]
    CorruptSnapshot { path: String, message: String },

    /// Path or job id rejected before reaching a store
    #[error("Invalid path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    /// Operation not allowed in the current run state
    #[error("Run is {actual}, operation requires {expected}")]
    InvalidState { actual: String, expected: String },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[cfg(feature = "gcs")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Create a transient storage error.
    pub fn transient(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::TransientStore {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create a permanent storage error.
    pub fn permanent(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::PermanentStore {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a corrupt snapshot error.
    pub fn corrupt(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::CorruptSnapshot {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create an invalid path error.
    pub fn invalid_path(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(actual: impl fmt::Display, expected: impl fmt::Display) -> Self {
        Self::InvalidState {
            actual: actual.to_string(),
            expected: expected.to_string(),
        }
    }

    /// Wrap a startup failure for the given job.
    pub fn initialization(job_id: impl Into<String>, source: AppError) -> Self {
        Self::Initialization {
            job_id: job_id.into(),
            source: Box::new(source),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientStore { .. } | Self::RetriesExhausted { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
            ),
            #[cfg(feature = "gcs")]
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Whether this is a missing-blob error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
