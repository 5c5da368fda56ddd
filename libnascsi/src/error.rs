//! CSI error types.
//!
//! All errors surfaced by the controller are represented by the [`CsiError`]
//! enum.  Each variant maps onto one RPC status [`Code`] via
//! [`CsiError::code`], which is what a transport reports to the container
//! orchestrator.

use std::fmt;

use thiserror::Error;

use crate::appliance::ApplianceError;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// The caller supplied an invalid argument.  Raised before any remote
    /// call is attempted.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced volume, snapshot or source was not found.
    #[error("{0} not found")]
    NotFound(String),

    /// The requested name is already in use by an incompatible resource.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The request is understood but not supported by this driver.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// A bounded wait (bulk replication) ran out of time.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A call to the storage appliance failed.
    #[error("{step} failed: {source}")]
    Upstream {
        /// Which provisioning step issued the failing call.
        step: String,
        /// The error reported by the appliance client.
        #[source]
        source: ApplianceError,
    },

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Wrap an appliance failure with the step that issued it.
    pub fn upstream(step: impl Into<String>, source: ApplianceError) -> Self {
        Self::Upstream {
            step: step.into(),
            source,
        }
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`fmt::Display`].
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// The status code reported to the caller for this error.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::NotFound(_) => Code::NotFound,
            Self::AlreadyExists(_) => Code::AlreadyExists,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Self::Upstream { source, .. } => match source {
                ApplianceError::NotFound(_) => Code::NotFound,
                ApplianceError::Timeout(_) => Code::DeadlineExceeded,
                ApplianceError::AlreadyExists(_) | ApplianceError::Request(_) => Code::Internal,
            },
            Self::Internal(_) => Code::Internal,
        }
    }
}

/// RPC status codes surfaced by the controller.
///
/// The discriminants match the gRPC status code numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Deadline expired before operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// Some entity that we attempted to create already exists.
    AlreadyExists = 6,
    /// Operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
}

impl Code {
    /// Get human-readable description of this code
    pub const fn description(&self) -> &'static str {
        match self {
            Code::InvalidArgument => "Client specified an invalid argument",
            Code::DeadlineExceeded => "Deadline expired before operation could complete",
            Code::NotFound => "Some requested entity was not found",
            Code::AlreadyExists => "Some entity that we attempted to create already exists",
            Code::Unimplemented => "Operation is not implemented or not supported",
            Code::Internal => "Internal error",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl From<Code> for i32 {
    fn from(code: Code) -> i32 {
        code as i32
    }
}
