//! Error types for the synchronization engine.

use crate::protocol::RejectReason;
use crate::types::{CorrelationId, RecordKey, ScopeKey, Sequence, SessionId};
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A session-originated write was refused by policy.
    #[error("Policy denied: {reason}")]
    PolicyDenied {
        reason: String,
        correlation: Option<CorrelationId>,
    },

    /// A write failed type validation. Terminal for the originating write.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Sequence gap on {key}: expected {expected:?}, got {got:?}")]
    SequenceGap {
        key: RecordKey,
        expected: Sequence,
        got: Sequence,
    },

    /// Fatal at startup.
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("Unknown record type: {0}")]
    UnknownType(String),

    #[error("Unknown association {association} on {record_type}")]
    UnknownAssociation {
        record_type: String,
        association: String,
    },

    #[error("Record not found: {0}")]
    RecordNotFound(RecordKey),

    #[error("Record already exists: {0}")]
    RecordExists(RecordKey),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Scope not exposed: {0}")]
    ScopeNotExposed(ScopeKey),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Checkpoint directory is locked by another process")]
    Locked,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// How a failed session write is reported back to its originator.
    /// `None` for failures that are not the write's fault.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            SyncError::PolicyDenied { .. } => Some(RejectReason::PolicyDenied),
            SyncError::RecordNotFound(_) => Some(RejectReason::NotFound),
            SyncError::Validation(_)
            | SyncError::RecordExists(_)
            | SyncError::MalformedEvent(_)
            | SyncError::UnknownType(_)
            | SyncError::UnknownAssociation { .. }
            | SyncError::InvalidOperation(_) => Some(RejectReason::Validation),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
