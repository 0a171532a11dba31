//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`] for ergonomic error handling.  Handlers
//! work with `Result<_, CsiError>` internally and convert to a gRPC
//! [`tonic::Status`] at the service boundary, where each variant maps onto the
//! status code the CSI specification mandates for that failure class.

use thiserror::Error;
use tonic::{Code, Response, Status};

/// Unified error type for CSI operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// The caller supplied a missing or malformed field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced resource (node, snapshot, ...) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// A resource with the same name exists with incompatible parameters.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The call is out of order with respect to the volume's lifecycle.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The operation was aborted, e.g. because of an invalid pagination token.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The plugin deliberately does not implement this RPC.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The storage backend returned an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A gRPC / socket level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The driver was configured with unusable values.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Shorthand for [`CsiError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Shorthand for [`CsiError::Unimplemented`].
    pub fn unimplemented(rpc: impl Into<String>) -> Self {
        Self::Unimplemented(rpc.into())
    }

    /// The gRPC status code this error is reported with.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::NotFound(_) | Self::VolumeNotFound(_) => Code::NotFound,
            Self::AlreadyExists(_) => Code::AlreadyExists,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::Aborted(_) => Code::Aborted,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::BackendError(_)
            | Self::TransportError(_)
            | Self::Config(_)
            | Self::Internal(_) => Code::Internal,
        }
    }
}

impl From<CsiError> for Status {
    fn from(err: CsiError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

impl From<Status> for CsiError {
    fn from(status: Status) -> Self {
        let msg = status.message().to_owned();
        match status.code() {
            Code::InvalidArgument => Self::InvalidArgument(msg),
            Code::NotFound => Self::NotFound(msg),
            Code::AlreadyExists => Self::AlreadyExists(msg),
            Code::FailedPrecondition => Self::FailedPrecondition(msg),
            Code::Aborted => Self::Aborted(msg),
            Code::Unimplemented => Self::Unimplemented(msg),
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
                Self::TransportError(msg)
            }
            _ => Self::Internal(msg),
        }
    }
}

/// Wrap a handler result into the shape tonic service methods return.
pub(crate) fn respond<T>(result: Result<T, CsiError>) -> Result<Response<T>, Status> {
    result.map(Response::new).map_err(Status::from)
}

/// Reasons a composite node identifier fails to parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeIdError {
    /// The identifier was the empty string.
    #[error("node id is empty")]
    Empty,

    /// The identifier did not split into exactly two non-empty parts.
    #[error("malformed node id {0:?}")]
    Malformed(String),
}
