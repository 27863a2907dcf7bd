//! Kernel channel errors

use snapagent_core::DeviceId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Result type alias for kernel channel calls
pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Failure of one control call or stream operation
#[derive(Debug, Error)]
pub enum KernelError {
    /// The device node could not be opened
    #[error("failed to open {}: {source}", path.display())]
    Open {
        /// Device node path
        path: PathBuf,
        /// OS error
        #[source]
        source: io::Error,
    },

    /// The control call returned an error
    #[error("{op} failed: {source}")]
    Ioctl {
        /// Request name
        op: &'static str,
        /// OS error
        #[source]
        source: io::Error,
    },

    /// The kernel returned fewer bytes or entries than requested
    #[error("{op} transferred {actual} of {expected}")]
    ShortTransfer {
        /// Request name
        op: &'static str,
        /// Requested amount
        expected: usize,
        /// Returned amount
        actual: usize,
    },

    /// The device is not under change tracking
    #[error("device {0} is not tracked")]
    NotTracked(DeviceId),

    /// The stream was closed locally
    #[error("snap store stream is closed")]
    ChannelClosed,

    /// Reading or writing the stream failed
    #[error("snap store stream {op} failed: {source}")]
    Stream {
        /// `read` or `write`
        op: &'static str,
        /// OS error
        #[source]
        source: io::Error,
    },

    /// A stream message could not be encoded or decoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl KernelError {
    /// Control call failure with a raw errno
    pub fn errno(op: &'static str, errno: i32) -> Self {
        KernelError::Ioctl {
            op,
            source: io::Error::from_raw_os_error(errno),
        }
    }

    /// The errno behind this error, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            KernelError::Open { source, .. }
            | KernelError::Ioctl { source, .. }
            | KernelError::Stream { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
