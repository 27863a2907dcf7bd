//! Catalog entities
//!
//! Rows reference each other by tracking id rather than embedding copies,
//! so a lookup always sees the current state of the referenced row.

use crate::types::{DeviceId, GenerationId, SnapStoreId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A block device under change-block tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedDisk {
    /// Tracking id (device basename, e.g. `sdb1`)
    pub tracking_id: String,
    /// Device node path
    pub path: PathBuf,
    /// Device identity
    pub device: DeviceId,
    /// Logical sector size in bytes
    pub sector_size: u32,
}

/// A directory allowed to host copy-on-write extent files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapStoreLocation {
    /// Tracking id
    pub tracking_id: String,
    /// Directory path
    pub path: PathBuf,
    /// Size of the hosting filesystem when registered
    pub total_capacity: u64,
    /// Device node hosting the directory
    pub device_path: PathBuf,
    /// Device hosting the directory
    pub device: DeviceId,
    /// Whether new snap stores may be placed here
    pub enabled: bool,
}

/// Binds a tracked disk to the location its snap store will live in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapStoreMapping {
    /// Tracking id
    pub tracking_id: String,
    /// Tracked disk id
    pub tracked_disk_id: String,
    /// Location id
    pub location_id: String,
}

/// Kernel copy-on-write store for one tracked disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapStore {
    /// Store id shared with the kernel
    pub id: SnapStoreId,
    /// Tracked disk id
    pub tracked_disk_id: String,
    /// Location id
    pub location_id: String,
    /// Sum of the sizes of all extent files handed to the kernel
    pub total_allocated_size: u64,
}

impl SnapStore {
    /// Directory holding this store's extent files: `location.path / id`
    pub fn path(&self, location: &SnapStoreLocation) -> PathBuf {
        location.path.join(self.id.to_string())
    }
}

/// One preallocated extent file whose extents belong to the kernel
///
/// Deleting the row does not give the extents back; only a module reload
/// or reboot does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapStoreFile {
    /// Tracking id (file name)
    pub tracking_id: String,
    /// Owning store
    pub snap_store_id: SnapStoreId,
    /// Location id
    pub location_id: String,
    /// Absolute file path
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
}

/// Point-in-time image of one or more tracked disks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id (kernel snapshot id in decimal)
    pub id: String,
    /// Kernel snapshot id
    pub kernel_snapshot_id: u64,
    /// Volume snapshots, one per disk
    pub volume_snapshot_ids: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Health of a volume snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeStatus {
    /// Copy-on-write data is complete
    Healthy,
    /// The snap store ran out of space; image content is unreliable
    Overflow,
}

/// One disk's part of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    /// Tracking id
    pub tracking_id: String,
    /// Parent snapshot id
    pub snapshot_id: String,
    /// CBT generation number after the snapshot
    pub snapshot_number: u32,
    /// CBT epoch at snapshot time
    pub generation_id: GenerationId,
    /// Tracked disk id
    pub tracked_disk_id: String,
    /// Snapshot image id
    pub snapshot_image_id: String,
    /// Snap store backing the copy-on-write data
    pub snap_store_id: SnapStoreId,
    /// CBT bitmap read right after the snapshot
    pub bitmap: Vec<u8>,
    /// Health
    pub status: VolumeStatus,
}

/// Read-only device node exposing one disk's snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotImage {
    /// Tracking id (image device basename)
    pub tracking_id: String,
    /// Device node path
    pub device_path: PathBuf,
    /// Device identity
    pub device: DeviceId,
}

/// Tracking id derived from a device or file path: its last component
pub fn tracking_id_for(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
