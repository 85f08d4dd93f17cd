use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for caller-facing handling and retry decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Invalid input or unusable configuration.
    Config,
    /// Authentication/authorization rejected by the backend (401/403).
    Auth,
    /// Any other 4xx response. Never retried.
    Client,
    /// 5xx response. Retried.
    Server,
    /// Transport failure or timeout before a response arrived. Retried.
    Network,
    /// Payload could not be encoded or decoded.
    Serialization,
    /// Push channel unavailable for the requested operation.
    Channel,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload returned across the facade boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status when the error came from a REST response.
    pub status: Option<u16>,
}

impl SyncError {
    /// Construct a new error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Build an error from a non-success HTTP status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            category: classify_http_status(status),
            code: format!("http_{status}"),
            message: message.into(),
            status: Some(status),
        }
    }

    /// Build a transport-level failure (no response received).
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Network, code, message)
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is in state {current:?}"),
        )
    }

    /// Whether the failure may succeed when repeated (network/timeout or 5xx).
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            SyncErrorCategory::Network | SyncErrorCategory::Server
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(
            SyncErrorCategory::Serialization,
            "serde_json_error",
            err.to_string(),
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        401 | 403 => SyncErrorCategory::Auth,
        400..=499 => SyncErrorCategory::Client,
        500..=599 => SyncErrorCategory::Server,
        _ => SyncErrorCategory::Internal,
    }
}
