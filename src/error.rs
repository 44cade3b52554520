//! Error handling module for the registry pusher
//!
//! Every fallible operation in the crate returns [`PusherError`]. The variants
//! mirror the failure classes of a push: credential problems that fail fast,
//! authentication failures handled by the transport's one-shot refresh,
//! registry responses carrying an HTTP status, timeouts, and the terminal
//! [`PusherError::MaxRetriesExceeded`] produced by the retry engine.

use crate::registry::auth::CredentialSource;
use reqwest::StatusCode;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PusherError>;

/// HTTP statuses a registry answers with when the failure is transient.
pub const RETRYABLE_REGISTRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Coarse classification of transport-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionRefused,
    ConnectionReset,
    BrokenPipe,
    TimedOut,
    Connect,
    Other,
}

impl NetworkErrorKind {
    /// Temporary conditions worth another attempt.
    pub fn is_transient(self) -> bool {
        !matches!(self, NetworkErrorKind::Other)
    }
}

#[derive(Debug, Clone, Error)]
pub enum PusherError {
    #[error("build path does not exist: {}", path.display())]
    PathNotFound { path: PathBuf },

    #[error("authentication failed for registry {registry}: {message}")]
    Authentication { registry: String, message: String },

    #[error("credential error from {origin}: {message}")]
    Credential {
        origin: CredentialSource,
        message: String,
    },

    #[error("registry {registry} {operation} failed{}: {message}", status.map(|s| format!(" with status {}", s)).unwrap_or_default())]
    Registry {
        registry: String,
        operation: String,
        status: Option<u16>,
        message: String,
    },

    #[error("timeout during {operation}: {message}")]
    Timeout { operation: String, message: String },

    #[error("operation failed after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        last: Box<PusherError>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(#[source] Arc<serde_json::Error>),

    #[error("Image parsing error: {0}")]
    ImageParsing(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("invalid reference {reference:?}: {message}")]
    InvalidReference { reference: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{failed} of {total} images failed to push")]
    PushFailed { failed: usize, total: usize },
}

/// Errors that know whether repeating the failed operation can help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for PusherError {
    fn is_retryable(&self) -> bool {
        match self {
            PusherError::Registry {
                status: Some(status),
                ..
            } => RETRYABLE_REGISTRY_STATUSES.contains(status),
            PusherError::Timeout { .. } => true,
            PusherError::Network { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }
}

impl PusherError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            PusherError::Registry { status, .. } => *status,
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PusherError::Cancelled)
    }

    /// Build a registry error from an unexpected response status
    pub fn from_status(registry: &str, operation: &str, status: StatusCode, body: &str) -> Self {
        let detail = if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string()
        } else {
            body.trim().to_string()
        };

        let message = match status.as_u16() {
            401 => format!("unauthorized: {}", detail),
            403 => format!("forbidden, insufficient permissions: {}", detail),
            404 => format!("repository or upload session not found: {}", detail),
            429 => format!("rate limited: {}", detail),
            500 => format!("registry server error: {}", detail),
            502 | 503 => format!("registry unavailable: {}", detail),
            504 => format!("registry gateway timeout: {}", detail),
            _ => detail,
        };

        PusherError::Registry {
            registry: registry.to_string(),
            operation: operation.to_string(),
            status: Some(status.as_u16()),
            message,
        }
    }
}

impl From<std::io::Error> for PusherError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::ConnectionRefused => Some(NetworkErrorKind::ConnectionRefused),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                Some(NetworkErrorKind::ConnectionReset)
            }
            ErrorKind::BrokenPipe => Some(NetworkErrorKind::BrokenPipe),
            ErrorKind::TimedOut => Some(NetworkErrorKind::TimedOut),
            _ => None,
        };

        match kind {
            Some(kind) => PusherError::Network {
                kind,
                message: err.to_string(),
            },
            None => PusherError::Io(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for PusherError {
    fn from(err: serde_json::Error) -> Self {
        PusherError::Json(Arc::new(err))
    }
}

impl From<reqwest::Error> for PusherError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return PusherError::Timeout {
                operation: err
                    .url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|| "request".to_string()),
                message: err.to_string(),
            };
        }

        let kind = if err.is_connect() {
            NetworkErrorKind::Connect
        } else {
            NetworkErrorKind::Other
        };

        // reqwest hides the io error two levels down; keep the full chain in the message
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        PusherError::Network { kind, message }
    }
}

impl From<url::ParseError> for PusherError {
    fn from(err: url::ParseError) -> Self {
        PusherError::Validation(err.to_string())
    }
}

impl From<tokio::task::JoinError> for PusherError {
    fn from(err: tokio::task::JoinError) -> Self {
        PusherError::Io(Arc::new(std::io::Error::other(err)))
    }
}
