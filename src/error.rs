use serde::{Deserialize, Serialize};

/// Typed errors raised by the engine core.
///
/// Validation, transition, and dependency errors are resolved locally at the
/// gate / state-machine boundary: the store is left unchanged and the error is
/// returned to the originating client as an `error` message. They are never
/// silently dropped.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// A malformed field in an inbound message. Names the first failing field
    /// and the value that failed.
    #[error("validation failed for field '{field}' (value: {value}): {reason}")]
    Validation {
        field: String,
        value: String,
        reason: String,
    },

    /// A status change that is illegal per the transition table.
    #[error("illegal transition {from} → {to}")]
    Transition { from: String, to: String },

    /// A completion attempt blocked by an incomplete dependency or a live
    /// blocking edge.
    #[error("task '{task_id}' cannot complete: {unmet}")]
    Dependency { task_id: String, unmet: String },

    #[error("task '{id}' not found")]
    NotFound { id: String },

    #[error("invalid channel '{channel}'")]
    InvalidChannel { channel: String },

    #[error("access to domain '{domain}' denied")]
    DomainDenied { domain: String },

    /// Invalid or expired credential. Resets the connection to
    /// "not authenticated" until a new handshake succeeds.
    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    #[error("timed out waiting for {operation}")]
    Timeout { operation: String },

    /// Transport failure. Triggers the reconnect/backoff loop on the client.
    #[error("connection error: {0}")]
    Connection(String),
}

impl EngineError {
    pub fn validation(field: &str, value: impl std::fmt::Display, reason: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Numeric code carried on the wire error payload.
    pub fn code(&self) -> i32 {
        match self {
            Self::Validation { .. } => 400,
            Self::Auth { .. } => 401,
            Self::InvalidChannel { .. } | Self::DomainDenied { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Timeout { .. } => 408,
            Self::Transition { .. } | Self::Dependency { .. } => 409,
            Self::Connection(_) => 503,
        }
    }

    /// Stable machine-readable error type string.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Transition { .. } => "transition_error",
            Self::Dependency { .. } => "dependency_error",
            Self::NotFound { .. } => "not_found",
            Self::InvalidChannel { .. } => "invalid_channel",
            Self::DomainDenied { .. } => "domain_denied",
            Self::Auth { .. } => "auth_error",
            Self::Timeout { .. } => "timeout_error",
            Self::Connection(_) => "connection_error",
        }
    }

    /// Build the wire payload for an `error` message.
    pub fn to_payload(&self) -> ErrorPayload {
        let domain = match self {
            Self::DomainDenied { domain } => Some(domain.clone()),
            _ => None,
        };
        ErrorPayload {
            message: self.to_string(),
            status: "error".to_string(),
            code: self.code(),
            error_type: self.error_type().to_string(),
            domain,
        }
    }
}

/// Wire shape of the `error` message `data` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub status: String,
    pub code: i32,
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

pub type EngineResult<T> = Result<T, EngineError>;
