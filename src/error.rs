//! Error types for the BGH Smart sync engine
//!
//! Two layers of errors live here. [`GatewayError`] is what a single round
//! trip to the Solidmation cloud can fail with; it is `Clone` so one failed
//! refresh can be handed to every caller waiting on it. [`SyncError`] is the
//! crate-wide error used by configuration, the HTTP client and the engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Result type alias for a single gateway round trip
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Failure of one gateway call (fetch or command)
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayError {
    /// Transport failed or the backend was unreachable
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials rejected, even after re-authenticating
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The backend refused the command
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// Anything the backend returned that we could not classify
    #[error("Unexpected gateway response: {0}")]
    Unknown(String),
}

impl GatewayError {
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::Auth(msg.into())
    }

    pub fn rejected<S: Into<String>>(msg: S) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn unknown<S: Into<String>>(msg: S) -> Self {
        Self::Unknown(msg.into())
    }

    /// Whether a later caller-triggered attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Unknown(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.status().map(|s| s.as_u16()) == Some(401) {
            Self::Auth(err.to_string())
        } else if err.is_decode() {
            Self::Unknown(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum SyncError {
    /// A gateway round trip failed
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device or home lookups that must succeed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP client construction errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Sanitized error representation safe to show to the host layer
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedError {
    pub error_type: String,
    pub message: String,
    pub is_retryable: bool,
    pub is_auth_error: bool,
}

impl SyncError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Generic(anyhow::anyhow!(msg.into()))
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Gateway(e) => e.is_transient(),
            SyncError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Whether the error means the credentials are no longer accepted
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::Gateway(GatewayError::Auth(_)))
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SyncError::Gateway(GatewayError::Auth(_)) => ErrorSeverity::Critical,
            SyncError::Gateway(GatewayError::Network(_)) => ErrorSeverity::Warning,
            SyncError::Gateway(_) => ErrorSeverity::Error,
            SyncError::Config(_) => ErrorSeverity::Critical,
            SyncError::NotFound(_) | SyncError::InvalidInput(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Strip internals before handing the error to a user-facing layer
    pub fn sanitize(&self) -> SanitizedError {
        let (error_type, message) = match self {
            SyncError::Gateway(GatewayError::Network(_)) => {
                ("network", "Cloud service unreachable".to_string())
            }
            SyncError::Gateway(GatewayError::Auth(_)) => {
                ("authentication", "Authentication failed".to_string())
            }
            SyncError::Gateway(GatewayError::Rejected(_)) => {
                ("rejected", "Command rejected by the device".to_string())
            }
            SyncError::Gateway(GatewayError::Unknown(_)) => {
                ("gateway", "Unexpected cloud response".to_string())
            }
            SyncError::Config(msg) => ("config", msg.clone()),
            SyncError::NotFound(msg) => ("not_found", msg.clone()),
            SyncError::InvalidInput(msg) => ("invalid_input", msg.clone()),
            SyncError::Http(_) => ("http", "HTTP client error".to_string()),
            SyncError::Json(_) | SyncError::Toml(_) => ("parsing", "Parsing failed".to_string()),
            SyncError::Io(_) => ("io", "I/O error".to_string()),
            SyncError::Generic(_) => ("internal", "Internal error".to_string()),
        };

        SanitizedError {
            error_type: error_type.to_string(),
            message,
            is_retryable: self.is_retryable(),
            is_auth_error: self.is_auth_error(),
        }
    }
}
