//! Snap store stream protocol
//!
//! Messages exchanged with the kernel over an open `/dev/veeamsnap` handle.
//! Every message starts with a little-endian `u32` tag.
//!
//! ## Outbound (agent to kernel)
//!
//! ```text
//! INITIATE               tag id[16] empty_limit:u64 snap_dev count:u32 dev*count   40 + 8n
//! NEXT_PORTION           tag id[16] count:u32 range*count                          24 + 16n
//! NEXT_PORTION_MULTIDEV  tag id[16] snap_dev count:u32 range*count                 32 + 16n
//! ```
//!
//! ## Inbound (kernel to agent), read into a 32-byte buffer
//!
//! ```text
//! ACKNOWLEDGE  tag code:u32
//! HALFFILL     tag fill_low:u32 fill_high:u32
//! OVERFLOW     tag error_code:u32 fill_low:u32 fill_high:u32
//! TERMINATE    tag
//! ```

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use snapagent_core::{DeviceId, ExtentRange, SnapStoreId};
use std::io::{self, Cursor, Read};
use thiserror::Error;

/// Unset tag
pub const TAG_UNDEFINED: u32 = 0x00;
/// Result of the previous outbound message
pub const TAG_ACKNOWLEDGE: u32 = 0x01;
/// Kernel could not parse the previous outbound message
pub const TAG_INVALID: u32 = 0xFF;
/// Bind the stream to a new snap store
pub const TAG_INITIATE: u32 = 0x21;
/// Hand extents to the bound snap store
pub const TAG_NEXT_PORTION: u32 = 0x22;
/// Hand extents on a named device to the bound snap store
pub const TAG_NEXT_PORTION_MULTIDEV: u32 = 0x23;
/// Snap store passed its empty limit
pub const TAG_HALFFILL: u32 = 0x41;
/// Snap store is out of space
pub const TAG_OVERFLOW: u32 = 0x42;
/// Kernel discarded the snap store
pub const TAG_TERMINATE: u32 = 0x43;

/// Read buffer size for inbound messages
pub const INBOUND_BUFFER_SIZE: usize = 32;

const ID_SIZE: usize = 16;
const DEV_SIZE: usize = 8;
const RANGE_SIZE: usize = 16;

/// Malformed stream message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Message shorter than its tag requires
    #[error("message with tag {tag:#04x} truncated")]
    Truncated {
        /// Message tag, 0 when even the tag is missing
        tag: u32,
    },

    /// Tag not valid in this direction
    #[error("unexpected tag {0:#04x}")]
    UnexpectedTag(u32),

    /// Declared count disagrees with the payload
    #[error("declared {declared} entries but payload holds {actual}")]
    CountMismatch {
        /// Count field value
        declared: u32,
        /// Entries present
        actual: usize,
    },
}

fn truncated(tag: u32) -> impl Fn(io::Error) -> ProtocolError {
    move |_| ProtocolError::Truncated { tag }
}

fn put_dev(buf: &mut [u8], dev: DeviceId) {
    LittleEndian::write_u32(&mut buf[0..4], dev.major);
    LittleEndian::write_u32(&mut buf[4..8], dev.minor);
}

fn put_ranges(buf: &mut [u8], ranges: &[ExtentRange]) {
    for (chunk, range) in buf.chunks_exact_mut(RANGE_SIZE).zip(ranges) {
        LittleEndian::write_u64(&mut chunk[0..8], range.left);
        LittleEndian::write_u64(&mut chunk[8..16], range.right);
    }
}

fn read_id(cursor: &mut Cursor<&[u8]>, tag: u32) -> Result<SnapStoreId, ProtocolError> {
    let mut bytes = [0u8; ID_SIZE];
    cursor.read_exact(&mut bytes).map_err(truncated(tag))?;
    Ok(SnapStoreId::from_bytes(bytes))
}

fn read_dev(cursor: &mut Cursor<&[u8]>, tag: u32) -> Result<DeviceId, ProtocolError> {
    let major = cursor.read_u32::<LittleEndian>().map_err(truncated(tag))?;
    let minor = cursor.read_u32::<LittleEndian>().map_err(truncated(tag))?;
    Ok(DeviceId::new(major, minor))
}

fn read_count(
    cursor: &mut Cursor<&[u8]>,
    tag: u32,
    entry_size: usize,
) -> Result<usize, ProtocolError> {
    let declared = cursor.read_u32::<LittleEndian>().map_err(truncated(tag))?;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if remaining != declared as usize * entry_size {
        return Err(ProtocolError::CountMismatch {
            declared,
            actual: remaining / entry_size,
        });
    }
    Ok(declared as usize)
}

fn read_ranges(
    cursor: &mut Cursor<&[u8]>,
    tag: u32,
    count: usize,
) -> Result<Vec<ExtentRange>, ProtocolError> {
    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        let left = cursor.read_u64::<LittleEndian>().map_err(truncated(tag))?;
        let right = cursor.read_u64::<LittleEndian>().map_err(truncated(tag))?;
        ranges.push(ExtentRange { left, right });
    }
    Ok(ranges)
}

/// Message written by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    /// Create the snap store this stream serves
    Initiate {
        /// Store id
        store_id: SnapStoreId,
        /// Free space below which the kernel raises HALFFILL
        empty_limit: u64,
        /// Device hosting the extent files
        snapshot_device: DeviceId,
        /// Devices whose copy-on-write data goes to this store
        devices: Vec<DeviceId>,
    },
    /// Hand extents on the store's device to the kernel
    NextPortion {
        /// Store id
        store_id: SnapStoreId,
        /// Inclusive device byte ranges
        ranges: Vec<ExtentRange>,
    },
    /// Hand extents on an explicit device to the kernel
    NextPortionMultidev {
        /// Store id
        store_id: SnapStoreId,
        /// Device the ranges refer to
        device: DeviceId,
        /// Inclusive device byte ranges
        ranges: Vec<ExtentRange>,
    },
}

impl OutboundCommand {
    /// Wire tag
    pub fn tag(&self) -> u32 {
        match self {
            OutboundCommand::Initiate { .. } => TAG_INITIATE,
            OutboundCommand::NextPortion { .. } => TAG_NEXT_PORTION,
            OutboundCommand::NextPortionMultidev { .. } => TAG_NEXT_PORTION_MULTIDEV,
        }
    }

    /// Encode to the exact byte layout the kernel expects
    pub fn encode(&self) -> Vec<u8> {
        match self {
            OutboundCommand::Initiate {
                store_id,
                empty_limit,
                snapshot_device,
                devices,
            } => {
                let mut buf = vec![0u8; 40 + DEV_SIZE * devices.len()];
                LittleEndian::write_u32(&mut buf[0..4], TAG_INITIATE);
                buf[4..20].copy_from_slice(store_id.as_bytes());
                LittleEndian::write_u64(&mut buf[20..28], *empty_limit);
                put_dev(&mut buf[28..36], *snapshot_device);
                LittleEndian::write_u32(&mut buf[36..40], devices.len() as u32);
                for (chunk, dev) in buf[40..].chunks_exact_mut(DEV_SIZE).zip(devices) {
                    put_dev(chunk, *dev);
                }
                buf
            }
            OutboundCommand::NextPortion { store_id, ranges } => {
                let mut buf = vec![0u8; 24 + RANGE_SIZE * ranges.len()];
                LittleEndian::write_u32(&mut buf[0..4], TAG_NEXT_PORTION);
                buf[4..20].copy_from_slice(store_id.as_bytes());
                LittleEndian::write_u32(&mut buf[20..24], ranges.len() as u32);
                put_ranges(&mut buf[24..], ranges);
                buf
            }
            OutboundCommand::NextPortionMultidev {
                store_id,
                device,
                ranges,
            } => {
                let mut buf = vec![0u8; 32 + RANGE_SIZE * ranges.len()];
                LittleEndian::write_u32(&mut buf[0..4], TAG_NEXT_PORTION_MULTIDEV);
                buf[4..20].copy_from_slice(store_id.as_bytes());
                put_dev(&mut buf[20..28], *device);
                LittleEndian::write_u32(&mut buf[28..32], ranges.len() as u32);
                put_ranges(&mut buf[32..], ranges);
                buf
            }
        }
    }

    /// Decode a message as the kernel would read it
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let tag = cursor
            .read_u32::<LittleEndian>()
            .map_err(truncated(TAG_UNDEFINED))?;
        match tag {
            TAG_INITIATE => {
                let store_id = read_id(&mut cursor, tag)?;
                let empty_limit = cursor.read_u64::<LittleEndian>().map_err(truncated(tag))?;
                let snapshot_device = read_dev(&mut cursor, tag)?;
                let count = read_count(&mut cursor, tag, DEV_SIZE)?;
                let devices = (0..count)
                    .map(|_| read_dev(&mut cursor, tag))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(OutboundCommand::Initiate {
                    store_id,
                    empty_limit,
                    snapshot_device,
                    devices,
                })
            }
            TAG_NEXT_PORTION => {
                let store_id = read_id(&mut cursor, tag)?;
                let count = read_count(&mut cursor, tag, RANGE_SIZE)?;
                let ranges = read_ranges(&mut cursor, tag, count)?;
                Ok(OutboundCommand::NextPortion { store_id, ranges })
            }
            TAG_NEXT_PORTION_MULTIDEV => {
                let store_id = read_id(&mut cursor, tag)?;
                let device = read_dev(&mut cursor, tag)?;
                let count = read_count(&mut cursor, tag, RANGE_SIZE)?;
                let ranges = read_ranges(&mut cursor, tag, count)?;
                Ok(OutboundCommand::NextPortionMultidev {
                    store_id,
                    device,
                    ranges,
                })
            }
            other => Err(ProtocolError::UnexpectedTag(other)),
        }
    }
}

/// Message read from the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundCommand {
    /// Result of the previous outbound message, 0 on success
    Acknowledge {
        /// Kernel status code
        code: u32,
    },
    /// Store passed its empty limit and wants another extent
    HalfFill {
        /// Bytes filled
        fill_level: u64,
    },
    /// Store is out of space
    Overflow {
        /// Kernel error code
        error_code: u32,
        /// Bytes filled
        fill_level: u64,
    },
    /// Kernel discarded the store
    Terminate,
    /// Kernel rejected the previous message as malformed
    Invalid,
    /// Tag this agent does not know
    Unknown(u32),
}

impl InboundCommand {
    /// Decode one inbound read
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let tag = cursor
            .read_u32::<LittleEndian>()
            .map_err(truncated(TAG_UNDEFINED))?;
        match tag {
            TAG_ACKNOWLEDGE => {
                let code = cursor.read_u32::<LittleEndian>().map_err(truncated(tag))?;
                Ok(InboundCommand::Acknowledge { code })
            }
            TAG_HALFFILL => {
                let fill_level = read_fill_level(&mut cursor, tag)?;
                Ok(InboundCommand::HalfFill { fill_level })
            }
            TAG_OVERFLOW => {
                let error_code = cursor.read_u32::<LittleEndian>().map_err(truncated(tag))?;
                let fill_level = read_fill_level(&mut cursor, tag)?;
                Ok(InboundCommand::Overflow {
                    error_code,
                    fill_level,
                })
            }
            TAG_TERMINATE => Ok(InboundCommand::Terminate),
            TAG_INVALID => Ok(InboundCommand::Invalid),
            other => Ok(InboundCommand::Unknown(other)),
        }
    }

    /// Encode as the kernel writes it
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 16];
        let len = match *self {
            InboundCommand::Acknowledge { code } => {
                LittleEndian::write_u32(&mut buf[0..4], TAG_ACKNOWLEDGE);
                LittleEndian::write_u32(&mut buf[4..8], code);
                8
            }
            InboundCommand::HalfFill { fill_level } => {
                LittleEndian::write_u32(&mut buf[0..4], TAG_HALFFILL);
                write_fill_level(&mut buf[4..12], fill_level);
                12
            }
            InboundCommand::Overflow {
                error_code,
                fill_level,
            } => {
                LittleEndian::write_u32(&mut buf[0..4], TAG_OVERFLOW);
                LittleEndian::write_u32(&mut buf[4..8], error_code);
                write_fill_level(&mut buf[8..16], fill_level);
                16
            }
            InboundCommand::Terminate => {
                LittleEndian::write_u32(&mut buf[0..4], TAG_TERMINATE);
                4
            }
            InboundCommand::Invalid => {
                LittleEndian::write_u32(&mut buf[0..4], TAG_INVALID);
                4
            }
            InboundCommand::Unknown(tag) => {
                LittleEndian::write_u32(&mut buf[0..4], tag);
                4
            }
        };
        buf.truncate(len);
        buf
    }
}

/// Fill level travels as two `u32` words, low word first
fn read_fill_level(cursor: &mut Cursor<&[u8]>, tag: u32) -> Result<u64, ProtocolError> {
    let low = cursor.read_u32::<LittleEndian>().map_err(truncated(tag))?;
    let high = cursor.read_u32::<LittleEndian>().map_err(truncated(tag))?;
    Ok(u64::from(low) | (u64::from(high) << 32))
}

fn write_fill_level(buf: &mut [u8], fill_level: u64) {
    LittleEndian::write_u32(&mut buf[0..4], fill_level as u32);
    LittleEndian::write_u32(&mut buf[4..8], (fill_level >> 32) as u32);
}
