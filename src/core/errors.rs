//! Custom error types for dispatch and translation operations

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Translation-related errors
#[derive(Error, Debug)]
pub enum TranslationError {
    /// Vendor answered with a non-2xx status
    #[error("{vendor} HTTP {status}")]
    ApiError {
        vendor: String,
        status: u16,
    },

    /// Opaque failure reported by an external collaborator
    #[error("{message}")]
    VendorError {
        message: String,
    },

    /// Network error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
    },

    /// Invalid response from API
    #[error("Invalid response: {message}")]
    InvalidResponseError {
        message: String,
    },

    /// Request timeout
    #[error("Timeout")]
    TimeoutError,

    /// Configuration error (no channel, no model, missing key)
    #[error("Configuration error: {message}")]
    ConfigError {
        message: String,
    },

    /// File operation error
    #[error("File error: {path} - {message}")]
    FileError {
        path: String,
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// How the backoff controller treats a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// HTTP 429: degrade, wait long, retry once
    RateLimited,
    /// HTTP 5xx or timeout: wait briefly, retry once
    Transient,
    /// Everything else propagates immediately
    Fatal,
}

impl TranslationError {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        TranslationError::ConfigError {
            message: message.into(),
        }
    }

    /// Classify this error for the retry policy.
    ///
    /// Structured variants are classified by status. Opaque collaborator
    /// messages fall back to matching the status code embedded in the text.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            TranslationError::ApiError { status: 429, .. } => RetryClass::RateLimited,
            TranslationError::ApiError { status, .. } if (500..600).contains(status) => {
                RetryClass::Transient
            }
            TranslationError::TimeoutError => RetryClass::Transient,
            TranslationError::VendorError { message } => classify_message(message),
            _ => RetryClass::Fatal,
        }
    }
}

/// Matches a standalone three-digit 5xx status inside free text.
fn server_status_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b5\d\d\b").expect("valid status regex"))
}

fn classify_message(message: &str) -> RetryClass {
    if message.contains("429") {
        return RetryClass::RateLimited;
    }
    if server_status_pattern().is_match(message) || message.to_lowercase().contains("timeout") {
        return RetryClass::Transient;
    }
    RetryClass::Fatal
}

impl From<reqwest::Error> for TranslationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TranslationError::TimeoutError
        } else if let Some(status) = err.status() {
            TranslationError::ApiError {
                vendor: "HTTP".to_string(),
                status: status.as_u16(),
            }
        } else {
            TranslationError::NetworkError {
                message: err.to_string(),
            }
        }
    }
}

impl From<config::ConfigError> for TranslationError {
    fn from(err: config::ConfigError) -> Self {
        TranslationError::config(err.to_string())
    }
}

/// Result type for translation operations
pub type Result<T> = std::result::Result<T, TranslationError>;
