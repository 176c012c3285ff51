//! The "index unavailable" error taxonomy.
//!
//! Raised by the consistency guard and by the query path when the content
//! index is missing or no longer matches the catalog. Always maps to a
//! transport status of 409.

use std::fmt;

/// Stable machine-checkable code carried by [`IndexUnavailable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexErrorCode {
    Missing,
    Stale,
}

impl IndexErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexErrorCode::Missing => "INDEX_MISSING",
            IndexErrorCode::Stale => "INDEX_STALE",
        }
    }
}

impl fmt::Display for IndexErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct IndexUnavailable {
    pub code: IndexErrorCode,
    pub message: String,
    pub remediation: String,
}

impl IndexUnavailable {
    /// Transport status for every index-unavailable response.
    pub const STATUS: u16 = 409;

    pub fn missing() -> Self {
        Self {
            code: IndexErrorCode::Missing,
            message: "No content index is available for the current catalog.".to_string(),
            remediation: "Run ragadmin reindex to build the knowledge index before continuing."
                .to_string(),
        }
    }

    pub fn stale(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self {
            code: IndexErrorCode::Stale,
            message: message.into(),
            remediation: remediation.into(),
        }
    }
}
