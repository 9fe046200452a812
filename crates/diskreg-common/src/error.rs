//! Error types for the Disk Registry
//!
//! Every public registry operation returns `Result<T>`. Failures carry one
//! of the registry error kinds below; benign outcomes where the requested
//! end-state already holds are reported as [`Status`] inside `Ok`.

use std::time::Duration;
use thiserror::Error;

/// Common result type for registry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Registry error
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed or inconsistent request
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Stale version supplied by the caller
    #[error("aborted: {0}")]
    Aborted(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// No capacity matches the request
    #[error("disk allocation failed: {0}")]
    AllocationFailed(String),

    /// A limit was reached; `silent` marks expected exhaustion that should not alert
    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String, silent: bool },

    /// A bounded wait is in progress; poll again after `timeout`
    #[error("try again in {timeout:?}: {message}")]
    TryAgain { message: String, timeout: Duration },

    #[error("rejected: {0}")]
    Rejected(String),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Fail(String),
}

/// Stable error codes, as reported to callers outside the process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ErrorCode {
    #[display("E_ARGUMENT")]
    Argument,
    #[display("E_NOT_FOUND")]
    NotFound,
    #[display("E_INVALID_STATE")]
    InvalidState,
    #[display("E_ABORTED")]
    Aborted,
    #[display("E_PRECONDITION_FAILED")]
    PreconditionFailed,
    #[display("E_BS_DISK_ALLOCATION_FAILED")]
    DiskAllocationFailed,
    #[display("E_BS_RESOURCE_EXHAUSTED")]
    ResourceExhausted,
    #[display("E_TRY_AGAIN")]
    TryAgain,
    #[display("E_REJECTED")]
    Rejected,
    #[display("E_FAIL")]
    Fail,
}

impl Error {
    /// Create an invalid argument error
    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an aborted error
    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::Aborted(msg.into())
    }

    /// Create an allocation failure
    pub fn allocation_failed(msg: impl Into<String>) -> Self {
        Self::AllocationFailed(msg.into())
    }

    /// Create a resource exhausted error that should not trigger alerts
    pub fn silently_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: msg.into(),
            silent: true,
        }
    }

    /// Create a retry-later error
    pub fn try_again(msg: impl Into<String>, timeout: Duration) -> Self {
        Self::TryAgain {
            message: msg.into(),
            timeout,
        }
    }

    /// Create an internal failure
    pub fn fail(msg: impl Into<String>) -> Self {
        Self::Fail(msg.into())
    }

    /// Stable code of this error
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Argument(_) => ErrorCode::Argument,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidState(_) => ErrorCode::InvalidState,
            Self::Aborted(_) => ErrorCode::Aborted,
            Self::PreconditionFailed(_) => ErrorCode::PreconditionFailed,
            Self::AllocationFailed(_) => ErrorCode::DiskAllocationFailed,
            Self::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            Self::TryAgain { .. } => ErrorCode::TryAgain,
            Self::Rejected(_) => ErrorCode::Rejected,
            Self::Fail(_) => ErrorCode::Fail,
        }
    }

    /// Human-readable message without the kind prefix
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Argument(m)
            | Self::NotFound(m)
            | Self::InvalidState(m)
            | Self::Aborted(m)
            | Self::PreconditionFailed(m)
            | Self::AllocationFailed(m)
            | Self::Rejected(m)
            | Self::Fail(m) => m,
            Self::ResourceExhausted { message, .. } | Self::TryAgain { message, .. } => message,
        }
    }

    /// Check if the caller should simply poll again later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TryAgain { .. } | Self::Rejected(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error must not raise alerts
    #[must_use]
    pub const fn is_silent(&self) -> bool {
        matches!(self, Self::ResourceExhausted { silent: true, .. })
    }

    /// Advisory retry delay for `TryAgain` errors
    #[must_use]
    pub const fn retry_timeout(&self) -> Option<Duration> {
        match self {
            Self::TryAgain { timeout, .. } => Some(*timeout),
            _ => None,
        }
    }
}

/// Successful outcome of an idempotent operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, derive_more::Display)]
pub enum Status {
    /// The operation changed the state
    #[default]
    #[display("S_OK")]
    Ok,
    /// The requested end-state already held
    #[display("S_ALREADY")]
    Already,
    /// Nothing to do
    #[display("S_FALSE")]
    False,
}

impl Status {
    /// Check whether the call actually changed anything
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}
