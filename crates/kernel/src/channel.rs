//! Control channel abstraction
//!
//! `ControlChannel` is one request per call with no retries. `StoreStream`
//! is the long-lived handle a watcher keeps open for one snap store.

use snapagent_core::{DeviceId, ExtentRange, GenerationId, SnapStoreId};
use std::sync::Arc;

use crate::error::KernelResult;

/// CBT state of one tracked device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbtInfo {
    /// Device
    pub device: DeviceId,
    /// Device capacity in bytes
    pub capacity_bytes: u64,
    /// Bitmap length in bytes, one byte per block
    pub bitmap_size_bytes: u32,
    /// Current CBT generation number
    pub snap_number: u8,
    /// Current CBT epoch
    pub generation_id: GenerationId,
}

/// A snapshot image exposed by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageInfo {
    /// Device the image was taken of
    pub original: DeviceId,
    /// Read-only image device
    pub snapshot: DeviceId,
}

/// Result of `SNAPSHOT_CREATE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedSnapshot {
    /// Kernel snapshot id
    pub snapshot_id: u64,
    /// Number of devices in the snapshot
    pub count: u32,
}

/// Result of `SNAPSTORE_CLEANUP`
///
/// A store without snapshots is deleted by the call and reports
/// `Filled(0)`; a store backing live snapshots survives and reports how
/// many bytes of copy-on-write data it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Bytes filled
    Filled(u64),
    /// Kernel does not know the store
    NotFound,
}

/// Requests understood by the kernel module
///
/// Each method is a single open/request/close round trip. Errors carry the
/// request name; callers decide whether to retry.
pub trait ControlChannel: Send + Sync {
    /// CBT state of every tracked device
    fn query_cbt_info(&self) -> KernelResult<Vec<CbtInfo>>;

    /// Start change tracking on a device
    fn add_tracking(&self, device: DeviceId) -> KernelResult<()>;

    /// Stop change tracking on a device
    fn remove_tracking(&self, device: DeviceId) -> KernelResult<()>;

    /// Bytes covered by one bitmap entry
    fn tracking_block_size(&self) -> KernelResult<u32>;

    /// Full CBT bitmap of a tracked device
    fn read_cbt_bitmap(&self, device: DeviceId) -> KernelResult<Vec<u8>>;

    /// Snapshot a device set in one step
    fn create_snapshot(&self, devices: &[DeviceId]) -> KernelResult<CreatedSnapshot>;

    /// Destroy a snapshot and its images
    fn delete_snapshot(&self, snapshot_id: u64) -> KernelResult<()>;

    /// Create a snap store for `devices` whose extents live on `snapshot_device`
    fn create_snap_store(
        &self,
        id: &SnapStoreId,
        devices: &[DeviceId],
        snapshot_device: DeviceId,
    ) -> KernelResult<()>;

    /// Hand extents to a snap store
    fn add_extents_to_snap_store(
        &self,
        id: &SnapStoreId,
        ranges: &[ExtentRange],
    ) -> KernelResult<()>;

    /// Delete an unused snap store or report how full a used one is
    fn cleanup_snap_store(&self, id: &SnapStoreId) -> KernelResult<CleanupOutcome>;

    /// Every snapshot image currently exposed
    fn collect_snapshot_images(&self) -> KernelResult<Vec<ImageInfo>>;

    /// Open a stream handle for driving one snap store
    fn open_stream(&self) -> KernelResult<Arc<dyn StoreStream>>;
}

/// Open handle on the kernel's character device
///
/// `read` blocks until a message arrives or the handle is closed; after
/// `close` every pending and future call fails with
/// [`KernelError::ChannelClosed`](crate::KernelError::ChannelClosed).
pub trait StoreStream: Send + Sync {
    /// Write one whole message
    fn write(&self, message: &[u8]) -> KernelResult<()>;

    /// Read one message into `buf`, returning its length
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize>;

    /// Close the handle, waking any blocked reader
    fn close(&self);

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;
}
