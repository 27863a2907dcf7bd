//! Kernel control channel for the veeamsnap module
//!
//! - `codes`: ioctl request numbers
//! - `layout`: packed request structs as byte arrays
//! - `protocol`: messages on a snap store stream
//! - `channel`: the `ControlChannel` and `StoreStream` traits
//! - `veeamsnap`: the implementation on `/dev/veeamsnap`
//! - `testing`: an in-memory kernel for tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod codes;
pub mod error;
pub mod layout;
pub mod protocol;
pub mod testing;
pub mod veeamsnap;

pub use channel::{
    CbtInfo, CleanupOutcome, ControlChannel, CreatedSnapshot, ImageInfo, StoreStream,
};
pub use error::{KernelError, KernelResult};
pub use protocol::{InboundCommand, OutboundCommand, ProtocolError, INBOUND_BUFFER_SIZE};
pub use veeamsnap::{VeeamsnapControl, DEFAULT_DEVICE_NODE};
