//! Error types for MirrorFS
//!
//! This module defines the common error type used throughout the system and
//! its wire projection ([`RemoteError`]), which lets a secondary report an
//! application-level failure back to the primary.

use crate::types::{GroupId, TargetId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for MirrorFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for MirrorFS
#[derive(Debug, Error)]
pub enum Error {
    // Local execution errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Registry errors
    #[error("unknown buddy group: {0}")]
    UnknownGroup(GroupId),

    #[error("unknown target: {0}")]
    UnknownTarget(TargetId),

    #[error("target {0} is already a member of another buddy group")]
    TargetInUse(TargetId),

    #[error("buddy group already exists: {0}")]
    GroupExists(GroupId),

    #[error("state changed concurrently, try again")]
    Again,

    // Role errors
    #[error("target {target} is not primary of buddy group {group}")]
    NotPrimary { group: GroupId, target: TargetId },

    #[error("target {target} is not secondary of buddy group {group}")]
    NotSecondary { group: GroupId, target: TargetId },

    #[error("target {0} is not consistent and cannot serve requests")]
    NotConsistent(TargetId),

    // Communication-class errors
    #[error("request timeout")]
    Timeout,

    #[error("communication failed: {0}")]
    CommunicationFailed(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    // Resync errors
    #[error("resync already running for target {0}")]
    ResyncAlreadyRunning(TargetId),

    #[error("no resync running for target {0}")]
    ResyncNotRunning(TargetId),

    #[error("resync refused: {0}")]
    ResyncRefused(String),

    // Errors reported by a peer
    #[error("remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a communication error
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::CommunicationFailed(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::CommunicationFailed(_) | Self::Unavailable(_) | Self::Again
        )
    }

    /// Check if this error means the peer could not be reached or did not answer
    #[must_use]
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::CommunicationFailed(_) | Self::Unavailable(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
            || matches!(
                self,
                Self::Remote {
                    code: ErrorCode::NotFound,
                    ..
                }
            )
    }

    /// Wire code for this error
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::Io,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::NotEmpty(_) => ErrorCode::NotEmpty,
            Self::NotADirectory(_) => ErrorCode::NotADirectory,
            Self::IsADirectory(_) => ErrorCode::IsADirectory,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::UnknownGroup(_) => ErrorCode::UnknownGroup,
            Self::UnknownTarget(_) => ErrorCode::UnknownTarget,
            Self::TargetInUse(_) | Self::GroupExists(_) => ErrorCode::InvalidArgument,
            Self::Again => ErrorCode::Again,
            Self::NotPrimary { .. } => ErrorCode::NotPrimary,
            Self::NotSecondary { .. } => ErrorCode::NotSecondary,
            Self::NotConsistent(_) => ErrorCode::NotConsistent,
            Self::Timeout => ErrorCode::Timeout,
            Self::CommunicationFailed(_) => ErrorCode::CommunicationFailed,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::ResyncAlreadyRunning(_)
            | Self::ResyncNotRunning(_)
            | Self::ResyncRefused(_) => ErrorCode::ResyncRefused,
            Self::Remote { code, .. } => *code,
            Self::Configuration(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }
}

/// Serializable error classification used on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Io,
    NotFound,
    AlreadyExists,
    NotEmpty,
    NotADirectory,
    IsADirectory,
    InvalidArgument,
    UnknownGroup,
    UnknownTarget,
    Again,
    NotPrimary,
    NotSecondary,
    NotConsistent,
    Timeout,
    CommunicationFailed,
    Unavailable,
    ResyncRefused,
    Internal,
}

/// An error as reported by a peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&Error> for RemoteError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<Error> for RemoteError {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        Self::Remote {
            code: err.code,
            message: err.message,
        }
    }
}
