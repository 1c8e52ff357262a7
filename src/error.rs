//! Error types for image decoding and range transfers.

use thiserror::Error;

use crate::models::IndexRange;

/// Error codes surfaced by the decoder and the transfer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Decode errors
    MalformedImage,
    ParentNotFound,
    ChecksumMismatch,

    // Transfer errors
    RangeTransferFailure,
    Cancelled,

    // General errors
    InvalidInput,
    Io,
    Remote,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MalformedImage => "MalformedImage",
            ErrorCode::ParentNotFound => "ParentNotFound",
            ErrorCode::ChecksumMismatch => "ChecksumMismatch",
            ErrorCode::RangeTransferFailure => "RangeTransferFailure",
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::InvalidInput => "InvalidInput",
            ErrorCode::Io => "Io",
            ErrorCode::Remote => "Remote",
        }
    }

    /// Returns the default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::MalformedImage => "The image is truncated or structurally invalid.",
            ErrorCode::ParentNotFound => "The parent image of a differencing disk does not exist.",
            ErrorCode::ChecksumMismatch => "A structure checksum does not match its contents.",
            ErrorCode::RangeTransferFailure => "A byte range could not be transferred.",
            ErrorCode::Cancelled => "The operation was cancelled.",
            ErrorCode::InvalidInput => "One of the supplied arguments is not valid.",
            ErrorCode::Io => "A local I/O operation failed.",
            ErrorCode::Remote => "The remote blob service returned an unexpected response.",
        }
    }
}

/// Error with code and message.
#[derive(Debug, Clone, Error)]
#[error("{code:?}: {message}")]
pub struct SyncError {
    pub code: ErrorCode,
    pub message: String,
}

impl SyncError {
    /// Creates a new error with the given code and default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            message: code.default_message().to_string(),
            code,
        }
    }

    /// Creates a new error with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for a `MalformedImage` error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::MalformedImage, message)
    }

    /// Shorthand for a `RangeTransferFailure` error.
    pub fn transfer(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::RangeTransferFailure, message)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        Self::with_message(ErrorCode::Io, e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        Self::with_message(ErrorCode::Remote, e.to_string())
    }
}

/// Result type alias for decode and transfer operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// A single range that could not be transferred.
#[derive(Debug, Clone)]
pub struct RangeFailure {
    pub range: IndexRange,
    pub error: SyncError,
}

/// Failure of a whole transfer call.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The transfer could not start (local file, remote metadata).
    #[error("transfer setup failed: {0}")]
    Setup(#[from] SyncError),

    /// Every range was attempted and at least one failed.
    #[error("{} of {attempted} ranges failed to transfer", failures.len())]
    RangesFailed {
        bytes_transferred: u64,
        attempted: usize,
        failures: Vec<RangeFailure>,
    },

    /// The cancellation token fired before all ranges were started.
    #[error("transfer cancelled with {} ranges not started", pending.len())]
    Cancelled {
        bytes_transferred: u64,
        pending: Vec<IndexRange>,
        failures: Vec<RangeFailure>,
    },
}

impl TransferError {
    /// Ranges a caller needs to retry to complete the transfer.
    pub fn retry_ranges(&self) -> Vec<IndexRange> {
        match self {
            TransferError::Setup(_) => Vec::new(),
            TransferError::RangesFailed { failures, .. } => {
                failures.iter().map(|f| f.range).collect()
            }
            TransferError::Cancelled {
                pending, failures, ..
            } => {
                let mut ranges: Vec<IndexRange> = failures.iter().map(|f| f.range).collect();
                ranges.extend_from_slice(pending);
                ranges.sort_by_key(|r| r.start_index);
                ranges
            }
        }
    }
}
