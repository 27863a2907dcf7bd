//! Error types for the snapshot agent
//!
//! One taxonomy for every layer. Lower layers keep their own error types
//! (kernel channel, catalog file) and are folded into `Error` at the point
//! where the orchestrator knows which operation was running.

use crate::types::SnapStoreId;
use std::io;
use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed source error kept by wrapping variants
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error types for agent operations
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown disk, store, snapshot, location or mapping id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate mapping, disk already snapshotted, location already
    /// registered or on a tracked disk
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A kernel control call failed
    #[error("Kernel channel error while {op}: {source}")]
    Kernel {
        /// What the caller was doing
        op: String,
        /// Underlying failure
        #[source]
        source: BoxedSource,
    },

    /// A snap store ran out of space
    #[error("Snap store {store_id} overflowed (error code {error_code}, fill level {fill_level})")]
    Overflow {
        /// Store that overflowed
        store_id: SnapStoreId,
        /// Kernel error code
        error_code: u32,
        /// Bytes filled when the overflow was raised
        fill_level: u64,
    },

    /// Kernel state did not match what the operation expected
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Filesystem failure with context
    #[error("I/O error while {context}: {source}")]
    Io {
        /// What the caller was doing
        context: String,
        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// Catalog persistence failure
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Device directory failure
    #[error("Device error: {0}")]
    Device(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed message on a snap store stream
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Wrap a kernel failure with the operation that was running
    pub fn kernel<E>(op: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Kernel {
            op: op.into(),
            source: Box::new(source),
        }
    }

    /// Wrap an I/O failure with context
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// True for `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True for `Conflict`
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// True for `Overflow`
    pub fn is_overflow(&self) -> bool {
        matches!(self, Error::Overflow { .. })
    }

    /// True for `InvariantViolation`
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::InvariantViolation(_))
    }
}
