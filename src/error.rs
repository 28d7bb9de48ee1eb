//! Error taxonomy for fixbase
//!
//! Nothing in this crate should take the host process down. Every failure
//! either rejects an operation with a reason or defers it to a later cycle:
//! - `ValidationRejected`: banned, rate-limited, malicious or spammy upload
//! - `SyncTransient`: git/network failure, retried on the next tick
//! - `PushRejected`: remote still ahead after the one pull-and-retry
//! - `MergeConflict`: automated resolution itself failed, cycle aborted
//! - `CorruptState`: unreadable persisted document (callers see defaults)

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why an upload was refused by the abuse guard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    /// Identity is under a temporary or permanent ban
    Banned { reason: String },
    /// Upload would exceed the hourly or daily window
    RateLimited { reason: String },
    /// Content matched the malicious pattern table
    Malicious { reason: String },
    /// Too many low-quality uploads
    LowQuality { reason: String },
}

impl Rejection {
    /// Human-readable reason, as surfaced to callers
    pub fn reason(&self) -> &str {
        match self {
            Rejection::Banned { reason }
            | Rejection::RateLimited { reason }
            | Rejection::Malicious { reason }
            | Rejection::LowQuality { reason } => reason,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Rejection::Banned { .. } => "banned",
            Rejection::RateLimited { .. } => "rate limited",
            Rejection::Malicious { .. } => "malicious content",
            Rejection::LowQuality { .. } => "low quality",
        };
        write!(f, "{}: {}", kind, self.reason())
    }
}

/// Crate-wide error type
#[derive(Debug, thiserror::Error)]
pub enum FixbaseError {
    #[error("Upload rejected ({0})")]
    ValidationRejected(Rejection),

    #[error("Sync failed: {0}")]
    SyncTransient(String),

    #[error("Push rejected after retry: {0}")]
    PushRejected(String),

    #[error("Merge conflict on {path}: {reason}")]
    MergeConflict { path: String, reason: String },

    #[error("Corrupt state document {document}: {reason}")]
    CorruptState { document: String, reason: String },

    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    #[error("Identity {0} is already linked")]
    AlreadyLinked(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State lock poisoned")]
    LockPoisoned,

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FixbaseError {
    /// Whether the failure should simply be retried on a later cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FixbaseError::SyncTransient(_) | FixbaseError::Timeout(_) | FixbaseError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FixbaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_display_includes_reason() {
        let rejection = Rejection::RateLimited {
            reason: "20 uploads in the last hour".to_string(),
        };
        assert_eq!(rejection.reason(), "20 uploads in the last hour");
        assert_eq!(
            FixbaseError::ValidationRejected(rejection).to_string(),
            "Upload rejected (rate limited: 20 uploads in the last hour)"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(FixbaseError::SyncTransient("remote hung up".into()).is_transient());
        assert!(FixbaseError::Timeout(30).is_transient());
        assert!(!FixbaseError::NotFound("abc".into()).is_transient());
        assert!(!FixbaseError::PushRejected("remote ahead".into()).is_transient());
    }
}
