use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorShape {
    pub error_message: String,
    pub error_type: String,
}

/// Which of the two per-cycle integrity checks rejected the artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStage {
    Raw,
    Extracted,
}

impl fmt::Display for VerifyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyStage::Raw => write!(f, "raw archive"),
            VerifyStage::Extracted => write!(f, "extracted tree"),
        }
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("Artifact too large: {size} bytes (max: {max_size})")]
    TooLarge { size: u64, max_size: u64 },

    #[error("Unexpected HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Malformed archive: {reason}")]
    MalformedArchive { reason: String },

    #[error("Archive entry escapes staging directory: {entry}")]
    PathTraversal { entry: String },

    #[error("Checksum mismatch on {stage}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        stage: VerifyStage,
        expected: String,
        actual: String,
    },

    #[error("{from} and {to} are on different volumes; refusing non-atomic install")]
    CrossVolume { from: String, to: String },

    #[error("Install failed: {reason}")]
    Install { reason: String, indeterminate: bool },

    #[error("An update cycle is already in progress")]
    UpdateInProgress,

    #[error("No previous release is retained for rollback")]
    NoRollbackAvailable,

    #[error("Update cycle cancelled")]
    Cancelled,

    #[error("Update cycle exceeded {timeout_ms}ms")]
    CycleTimedOut { timeout_ms: u64 },

    #[error("Automatic updates halted: {reason}")]
    Halted { reason: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Database error: {reason}")]
    Database { reason: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

/// Stable, serializable classification of an [`UpdateError`], stored in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    TooLarge,
    HttpStatus,
    MalformedArchive,
    PathTraversal,
    ChecksumMismatch,
    CrossVolume,
    Install,
    UpdateInProgress,
    NoRollbackAvailable,
    Cancelled,
    CycleTimedOut,
    Halted,
    InvalidRequest,
    Io,
    Database,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::TooLarge => "too_large",
            ErrorKind::HttpStatus => "http_status",
            ErrorKind::MalformedArchive => "malformed_archive",
            ErrorKind::PathTraversal => "path_traversal",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::CrossVolume => "cross_volume",
            ErrorKind::Install => "install",
            ErrorKind::UpdateInProgress => "update_in_progress",
            ErrorKind::NoRollbackAvailable => "no_rollback_available",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::CycleTimedOut => "cycle_timed_out",
            ErrorKind::Halted => "halted",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Io => "io",
            ErrorKind::Database => "database",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|_| {
            UpdateError::Database {
                reason: format!("unknown error kind: {s}"),
            }
        })
    }
}

impl UpdateError {
    pub fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        UpdateError::Io {
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        }
    }

    pub fn install(reason: impl Into<String>) -> Self {
        UpdateError::Install {
            reason: reason.into(),
            indeterminate: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Network { .. } => ErrorKind::Network,
            UpdateError::TooLarge { .. } => ErrorKind::TooLarge,
            UpdateError::HttpStatus { .. } => ErrorKind::HttpStatus,
            UpdateError::MalformedArchive { .. } => ErrorKind::MalformedArchive,
            UpdateError::PathTraversal { .. } => ErrorKind::PathTraversal,
            UpdateError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            UpdateError::CrossVolume { .. } => ErrorKind::CrossVolume,
            UpdateError::Install { .. } => ErrorKind::Install,
            UpdateError::UpdateInProgress => ErrorKind::UpdateInProgress,
            UpdateError::NoRollbackAvailable => ErrorKind::NoRollbackAvailable,
            UpdateError::Cancelled => ErrorKind::Cancelled,
            UpdateError::CycleTimedOut { .. } => ErrorKind::CycleTimedOut,
            UpdateError::Halted { .. } => ErrorKind::Halted,
            UpdateError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            UpdateError::Io { .. } => ErrorKind::Io,
            UpdateError::Database { .. } => ErrorKind::Database,
            UpdateError::Sqlx(_) => ErrorKind::Database,
            UpdateError::Config { .. } => ErrorKind::Config,
            UpdateError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// An install failure that may have left the install pointer unusable.
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            UpdateError::Install {
                indeterminate: true,
                ..
            }
        )
    }

    pub fn to_error_shape(&self) -> ErrorShape {
        ErrorShape {
            error_message: self.to_string(),
            error_type: self.error_type().to_string(),
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            UpdateError::Network { .. } => "NetworkError",
            UpdateError::TooLarge { .. } => "TooLargeError",
            UpdateError::HttpStatus { .. } => "HTTPStatusError",
            UpdateError::MalformedArchive { .. } => "MalformedArchiveError",
            UpdateError::PathTraversal { .. } => "PathTraversalError",
            UpdateError::ChecksumMismatch { .. } => "ChecksumMismatchError",
            UpdateError::CrossVolume { .. } => "CrossVolumeError",
            UpdateError::Install { .. } => "InstallError",
            UpdateError::UpdateInProgress => "UpdateInProgressError",
            UpdateError::NoRollbackAvailable => "NoRollbackAvailableError",
            UpdateError::Cancelled => "CancelledError",
            UpdateError::CycleTimedOut { .. } => "CycleTimedOutError",
            UpdateError::Halted { .. } => "HaltedError",
            UpdateError::InvalidRequest { .. } => "InvalidRequestError",
            UpdateError::Io { .. } => "IOError",
            UpdateError::Database { .. } => "ServiceException",
            UpdateError::Sqlx(_) => "ServiceException",
            UpdateError::Config { .. } => "ServiceException",
            UpdateError::Internal { .. } => "ServiceException",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            UpdateError::Network { .. } => 502,
            UpdateError::TooLarge { .. } => 502,
            UpdateError::HttpStatus { .. } => 502,
            UpdateError::MalformedArchive { .. } => 422,
            UpdateError::PathTraversal { .. } => 422,
            UpdateError::ChecksumMismatch { .. } => 422,
            UpdateError::CrossVolume { .. } => 500,
            UpdateError::Install { .. } => 500,
            UpdateError::UpdateInProgress => 409,
            UpdateError::NoRollbackAvailable => 409,
            UpdateError::Cancelled => 409,
            UpdateError::CycleTimedOut { .. } => 504,
            UpdateError::Halted { .. } => 423,
            UpdateError::InvalidRequest { .. } => 400,
            UpdateError::Io { .. } => 500,
            UpdateError::Database { .. } => 500,
            UpdateError::Sqlx(_) => 500,
            UpdateError::Config { .. } => 500,
            UpdateError::Internal { .. } => 500,
        }
    }
}
