use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Result type for storage data-plane operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Canonical status codes reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// Codes that a resume policy or reconnect factory may retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::DeadlineExceeded | Self::ResourceExhausted | Self::Aborted
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// Broad error categories used to decide propagation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidToken,
    Cancelled,
    Transient,
    Permanent,
    Desync,
    HashMismatch,
}

/// Errors surfaced by the streaming data plane
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Invalid token: {message}")]
    InvalidToken { message: String },

    #[error("Operation cancelled: {message}")]
    Cancelled { message: String },

    #[error("RPC failed ({code}): {message}")]
    Rpc { code: StatusCode, message: String },

    #[error(
        "Upload {upload_id} out of sync: service reports persisted size {persisted_size}, \
         client would resend from {resend_offset}"
    )]
    Desync {
        upload_id: String,
        resend_offset: i64,
        persisted_size: i64,
    },

    #[error("Checksum mismatch: received {received}, computed {computed}")]
    HashMismatch { received: String, computed: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },
}

impl StorageError {
    /// Create an RPC error with an explicit status code
    pub fn rpc<S: Into<String>>(code: StatusCode, message: S) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Create a transient `UNAVAILABLE` error
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::rpc(StatusCode::Unavailable, message)
    }

    /// Create a permanent `FAILED_PRECONDITION` error
    pub fn failed_precondition<S: Into<String>>(message: S) -> Self {
        Self::rpc(StatusCode::FailedPrecondition, message)
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create an invalid token error
    pub fn invalid_token<S: Into<String>>(message: S) -> Self {
        Self::InvalidToken {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// The canonical status code for this error
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidToken { .. } | Self::HashMismatch { .. } | Self::Config { .. } => {
                StatusCode::InvalidArgument
            }
            Self::Cancelled { .. } => StatusCode::Cancelled,
            Self::Rpc { code, .. } => *code,
            Self::Desync { .. } => StatusCode::Internal,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidToken { .. } => ErrorKind::InvalidToken,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Rpc { code, .. } if code.is_transient() => ErrorKind::Transient,
            Self::Rpc { .. } | Self::Config { .. } => ErrorKind::Permanent,
            Self::Desync { .. } => ErrorKind::Desync,
            Self::HashMismatch { .. } => ErrorKind::HashMismatch,
        }
    }

    /// Check if this error may be retried
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Structured diagnostics attached to the error
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        match self {
            Self::Desync {
                upload_id,
                resend_offset,
                persisted_size,
            } => {
                metadata.insert("upload_id".to_string(), upload_id.clone());
                metadata.insert("resend_offset".to_string(), resend_offset.to_string());
                metadata.insert("persisted_size".to_string(), persisted_size.to_string());
            }
            Self::HashMismatch { received, computed } => {
                metadata.insert("received_hash".to_string(), received.clone());
                metadata.insert("computed_hash".to_string(), computed.clone());
            }
            _ => {}
        }
        metadata
    }
}
