//! Error types for the sync engine.

use crate::types::{ColumnId, EntityKind, SubscriptionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Column not found: {0}")]
    ColumnNotFound(ColumnId),

    #[error("Column must reference at least one subscription")]
    EmptyColumn,

    #[error("Missing parameter '{param}' for resource {resource}")]
    MissingParameter { resource: String, param: String },

    #[error("Cannot resolve identity for {kind}: {reason}")]
    IdentityUnresolvable { kind: EntityKind, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    #[error("Snapshot storage is locked by another process")]
    Locked,
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

/// Why a single fetch attempt failed.
///
/// Recorded against the subscription and surfaced through its status; never
/// propagated out of the scheduler loop.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FetchError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    /// The host should prompt for re-authentication.
    #[error("Not authorized: {0}")]
    Auth(String),

    /// Retried on the normal interval, never immediately.
    #[error("Rate limited")]
    RateLimited { reset_at: Option<Timestamp> },

    /// The response arrived but could not be normalized.
    #[error("Unusable payload: {0}")]
    InvalidPayload(String),
}

impl FetchError {
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::Auth(_))
    }
}
