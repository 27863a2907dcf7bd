//! Identity and geometry types shared by every layer
//!
//! - DeviceId: block device identity (`major:minor`)
//! - SnapStoreId: UUID of a kernel snap store
//! - GenerationId: UUID of one CBT epoch
//! - ExtentRange: inclusive physical byte range on a device
//! - BlockDeviceInfo / FilesystemInfo / FileExtents: device directory answers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Block device identity
///
/// Equality on `(major, minor)` is the key used to match kernel reports,
/// catalog rows and device nodes against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    /// Major device number
    pub major: u32,
    /// Minor device number
    pub minor: u32,
}

impl DeviceId {
    /// Create a device id from its numbers
    pub const fn new(major: u32, minor: u32) -> Self {
        DeviceId { major, minor }
    }

    /// `0:0`, which the kernel uses for "no device"
    pub const fn unset() -> Self {
        DeviceId { major: 0, minor: 0 }
    }

    /// True for `0:0`
    pub fn is_unset(&self) -> bool {
        self.major == 0 && self.minor == 0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Error returned when parsing a `major:minor` string fails
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid device id '{0}', expected MAJOR:MINOR")]
pub struct ParseDeviceIdError(pub String);

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| ParseDeviceIdError(s.to_string()))?;
        let major = major
            .parse()
            .map_err(|_| ParseDeviceIdError(s.to_string()))?;
        let minor = minor
            .parse()
            .map_err(|_| ParseDeviceIdError(s.to_string()))?;
        Ok(DeviceId { major, minor })
    }
}

/// Unique identifier of a snap store
///
/// Generated on the host, handed to the kernel as 16 raw bytes and never
/// changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapStoreId(Uuid);

impl SnapStoreId {
    /// Create a new random id
    pub fn new() -> Self {
        SnapStoreId(Uuid::new_v4())
    }

    /// Create from the 16 raw bytes used on the kernel boundary
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SnapStoreId(Uuid::from_bytes(bytes))
    }

    /// Parse from the hyphenated string form
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(SnapStoreId)
    }

    /// Raw bytes as sent to the kernel
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for SnapStoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SnapStoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CBT epoch identifier reported by the kernel
///
/// A different value for the same device means every snap number recorded
/// before it is meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationId(Uuid);

impl GenerationId {
    /// Create a new random epoch id
    pub fn new() -> Self {
        GenerationId(Uuid::new_v4())
    }

    /// Wrap the 16 raw bytes from a CBT info record
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        GenerationId(Uuid::from_bytes(bytes))
    }

    /// Parse from the hyphenated string form
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(GenerationId)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for GenerationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical byte range on a block device, both bounds inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRange {
    /// First byte
    pub left: u64,
    /// Last byte
    pub right: u64,
}

impl ExtentRange {
    /// Range covering `length` bytes starting at `offset`
    ///
    /// Returns `None` for an empty extent.
    pub fn from_offset_len(offset: u64, length: u64) -> Option<Self> {
        if length == 0 {
            return None;
        }
        Some(ExtentRange {
            left: offset,
            right: offset + length - 1,
        })
    }

    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.right - self.left + 1
    }

    /// Always false; ranges are never empty
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// What the device directory knows about one block device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    /// Device node path, e.g. `/dev/sdb1`
    pub path: PathBuf,
    /// Device identity
    pub device: DeviceId,
    /// Capacity in bytes
    pub size_bytes: u64,
    /// Logical sector size in bytes
    pub logical_sector_size: u32,
}

/// Capacity of the filesystem hosting a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilesystemInfo {
    /// Total size in bytes
    pub total_bytes: u64,
    /// Bytes available to unprivileged users
    pub available_bytes: u64,
    /// Free bytes including reserved blocks
    pub free_bytes: u64,
}

/// Physical layout of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExtents {
    /// Device the extents live on
    pub device: DeviceId,
    /// Extents in file order
    pub ranges: Vec<ExtentRange>,
}
