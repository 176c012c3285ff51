//! Error types for the transport and request-handling layers.
//!
//! | Type | Raised by | Outcome |
//! |------|-----------|---------|
//! | [`ProtocolError`] | framing codec, handshake | connection-local; handshake errors close the connection |
//! | [`TransportError`] | handlers | returned to the client as a response frame |
//! | [`HandlerError`] | router boundary | `Transport` passes through, `Internal` becomes an opaque 500 |

use rag_backend_core::catalog::CatalogError;
use rag_backend_core::recovery::RecoveryError;
use rag_backend_core::IndexUnavailable;
use serde_json::{json, Value};

use crate::reindex::ReindexError;

/// Malformed bytes or envelopes on the wire.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid frame length: {0:?}")]
    InvalidLength(String),

    #[error("frame of {declared} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { declared: usize, limit: usize },

    #[error("connection closed after {received} of {declared} frame bytes")]
    Truncated { declared: usize, received: usize },

    #[error("frame is missing its trailing newline")]
    MissingSentinel,

    #[error("frame payload is not a JSON object: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the serving loop may keep reading after this error.
    ///
    /// End-of-stream, I/O failures, and oversized frames leave no usable
    /// frame boundary.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidJson(_)
                | ProtocolError::InvalidLength(_)
                | ProtocolError::MissingSentinel
        )
    }
}

/// A structured failure returned to the client unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} ({status}): {message}")]
pub struct TransportError {
    pub status: u16,
    pub code: String,
    pub message: String,
    pub remediation: Option<String>,
}

impl TransportError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            remediation: None,
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    pub fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self::new(400, code, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(400, "INVALID_REQUEST", message)
    }

    pub fn not_found(code: &str, message: impl Into<String>) -> Self {
        Self::new(404, code, message)
    }

    pub fn conflict(code: &str, message: impl Into<String>) -> Self {
        Self::new(409, code, message)
    }

    /// `{"code", "message", "remediation"?}`
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(remediation) = &self.remediation {
            body["remediation"] = Value::from(remediation.as_str());
        }
        body
    }
}

impl From<IndexUnavailable> for TransportError {
    fn from(err: IndexUnavailable) -> Self {
        Self::new(IndexUnavailable::STATUS, err.code.as_str(), err.message)
            .with_remediation(err.remediation)
    }
}

impl From<RecoveryError> for TransportError {
    fn from(err: RecoveryError) -> Self {
        Self::conflict("INVALID_JOB_STATE", err.to_string())
    }
}

/// Outcome of a failed handler invocation.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<IndexUnavailable> for HandlerError {
    fn from(err: IndexUnavailable) -> Self {
        HandlerError::Transport(err.into())
    }
}

impl From<ReindexError> for HandlerError {
    fn from(err: ReindexError) -> Self {
        match err {
            ReindexError::AlreadyRunning => TransportError::conflict(
                "REINDEX_IN_PROGRESS",
                "A reindex job is already running.",
            )
            .with_remediation("Wait for the running job to finish, then retry.")
            .into(),
            ReindexError::JobNotFound(job_id) => {
                TransportError::not_found("JOB_NOT_FOUND", format!("Unknown reindex job '{}'", job_id))
                    .into()
            }
            ReindexError::Recovery(e) => TransportError::from(e).into(),
            ReindexError::Failed(e) => HandlerError::Internal(e),
        }
    }
}

impl From<CatalogError> for HandlerError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::UnknownSource(_) => TransportError::not_found("SOURCE_NOT_FOUND", err.to_string()).into(),
            CatalogError::DuplicateAlias(_) => TransportError::conflict("SOURCE_CONFLICT", err.to_string()).into(),
            CatalogError::NothingToUpdate(_) | CatalogError::MissingReason | CatalogError::Language(_) => {
                TransportError::invalid_request(err.to_string()).into()
            }
            CatalogError::Store(e) => HandlerError::Internal(e),
        }
    }
}

pub type HandlerResult<T> = std::result::Result<T, HandlerError>;
