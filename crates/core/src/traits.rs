//! Collaborator traits
//!
//! The orchestrator talks to persistence and to the host's device naming
//! through these traits so tests can swap in in-memory versions.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::model::{
    Snapshot, SnapshotImage, SnapStore, SnapStoreFile, SnapStoreLocation, SnapStoreMapping,
    TrackedDisk, VolumeSnapshot,
};
use crate::types::{BlockDeviceInfo, DeviceId, FileExtents, FilesystemInfo, SnapStoreId};

/// Persistent catalog of agent entities
///
/// Semantics shared by every entity:
/// - `create_*` fails with `Conflict` when the key already exists
/// - `get`-style lookups by primary key fail with `NotFound`
/// - lookups by secondary key return `Option`
/// - `delete_*` fails with `NotFound` when the row is missing
///
/// Thread safety: all methods must be safe to call concurrently.
pub trait Catalog: Send + Sync {
    // Tracked disks

    /// Insert a tracked disk
    fn create_tracked_disk(&self, disk: TrackedDisk) -> Result<()>;
    /// Tracked disk by id
    fn tracked_disk(&self, id: &str) -> Result<TrackedDisk>;
    /// Tracked disk with the given device identity
    fn tracked_disk_by_device(&self, device: DeviceId) -> Result<Option<TrackedDisk>>;
    /// All tracked disks
    fn list_tracked_disks(&self) -> Result<Vec<TrackedDisk>>;
    /// Remove a tracked disk
    fn delete_tracked_disk(&self, id: &str) -> Result<()>;

    // Snap store locations

    /// Insert a location
    fn create_location(&self, location: SnapStoreLocation) -> Result<()>;
    /// Location by id
    fn location(&self, id: &str) -> Result<SnapStoreLocation>;
    /// Location registered for exactly this directory
    fn location_by_path(&self, path: &Path) -> Result<Option<SnapStoreLocation>>;
    /// All locations
    fn list_locations(&self) -> Result<Vec<SnapStoreLocation>>;
    /// Remove a location
    fn delete_location(&self, id: &str) -> Result<()>;

    // Mappings

    /// Insert a mapping
    fn create_mapping(&self, mapping: SnapStoreMapping) -> Result<()>;
    /// Mapping by id
    fn mapping(&self, id: &str) -> Result<SnapStoreMapping>;
    /// Mapping of a tracked disk
    fn mapping_for_disk(&self, disk_id: &str) -> Result<Option<SnapStoreMapping>>;
    /// All mappings
    fn list_mappings(&self) -> Result<Vec<SnapStoreMapping>>;
    /// Remove a mapping
    fn delete_mapping(&self, id: &str) -> Result<()>;

    // Snap stores

    /// Insert a snap store
    fn create_snap_store(&self, store: SnapStore) -> Result<()>;
    /// Snap store by id
    fn snap_store(&self, id: SnapStoreId) -> Result<SnapStore>;
    /// Snap store of a tracked disk
    fn snap_store_for_disk(&self, disk_id: &str) -> Result<Option<SnapStore>>;
    /// All snap stores
    fn list_snap_stores(&self) -> Result<Vec<SnapStore>>;
    /// Replace an existing snap store row
    fn update_snap_store(&self, store: SnapStore) -> Result<()>;
    /// Remove a snap store
    fn delete_snap_store(&self, id: SnapStoreId) -> Result<()>;
    /// Remove a snap store together with all of its extent file rows
    fn delete_snap_store_with_files(&self, id: SnapStoreId) -> Result<()>;

    // Snap store files

    /// Insert an extent file
    fn create_snap_store_file(&self, file: SnapStoreFile) -> Result<()>;
    /// Insert an extent file and add its size to the owning store
    ///
    /// Both happen or neither does. Fails with `NotFound` when the store
    /// is gone and returns the updated store otherwise.
    fn record_snap_store_file(&self, file: SnapStoreFile) -> Result<SnapStore>;
    /// Extent files of a store
    fn files_for_store(&self, store_id: SnapStoreId) -> Result<Vec<SnapStoreFile>>;
    /// Extent files placed in a location
    fn files_for_location(&self, location_id: &str) -> Result<Vec<SnapStoreFile>>;
    /// Remove an extent file row
    fn delete_snap_store_file(&self, id: &str) -> Result<()>;

    // Snapshot images

    /// Insert an image
    fn create_snapshot_image(&self, image: SnapshotImage) -> Result<()>;
    /// Image by id
    fn snapshot_image(&self, id: &str) -> Result<SnapshotImage>;
    /// Remove an image
    fn delete_snapshot_image(&self, id: &str) -> Result<()>;

    // Volume snapshots

    /// Insert a volume snapshot
    fn create_volume_snapshot(&self, volume: VolumeSnapshot) -> Result<()>;
    /// Volume snapshot by id
    fn volume_snapshot(&self, id: &str) -> Result<VolumeSnapshot>;
    /// Volume snapshots backed by a store
    fn volume_snapshots_for_store(&self, store_id: SnapStoreId) -> Result<Vec<VolumeSnapshot>>;
    /// Replace an existing volume snapshot row
    fn update_volume_snapshot(&self, volume: VolumeSnapshot) -> Result<()>;
    /// Remove a volume snapshot
    fn delete_volume_snapshot(&self, id: &str) -> Result<()>;

    // Snapshots

    /// Insert a snapshot
    fn create_snapshot(&self, snapshot: Snapshot) -> Result<()>;
    /// Snapshot by id
    fn snapshot(&self, id: &str) -> Result<Snapshot>;
    /// All snapshots
    fn list_snapshots(&self) -> Result<Vec<Snapshot>>;
    /// Snapshots with a volume snapshot of the given disk
    fn snapshots_for_disk(&self, disk_id: &str) -> Result<Vec<Snapshot>>;
    /// Remove a snapshot
    fn delete_snapshot(&self, id: &str) -> Result<()>;
    /// Remove a snapshot, its volume snapshots and their images in one step
    fn delete_snapshot_with_volumes(&self, id: &str) -> Result<()>;
}

/// Host device naming and filesystem queries
///
/// Implementations must be safe to share between the orchestrator and
/// every watcher thread.
pub trait DeviceDirectory: Send + Sync {
    /// Device node for `major:minor`, if one exists right now
    fn device_path(&self, device: DeviceId) -> Result<Option<PathBuf>>;

    /// Identity of the device node at `path`
    fn device_id(&self, path: &Path) -> Result<DeviceId>;

    /// Size and geometry of a block device
    fn device_info(&self, device: DeviceId) -> Result<BlockDeviceInfo>;

    /// Block device hosting a file or directory
    fn backing_device(&self, path: &Path) -> Result<BlockDeviceInfo>;

    /// Capacity of the filesystem hosting `path`
    fn filesystem_info(&self, path: &Path) -> Result<FilesystemInfo>;

    /// Physical extents of a file as inclusive device byte ranges
    fn file_extents(&self, path: &Path) -> Result<FileExtents>;

    /// Create a new file and reserve `size` bytes for it
    ///
    /// Fails if the file already exists. Returns the size actually
    /// allocated.
    fn create_extent_file(&self, path: &Path, size: u64) -> Result<u64>;

    /// Device node for `major:minor` once udev has created it
    ///
    /// Differs from [`device_path`](Self::device_path) in that the node
    /// itself must exist, not only the sysfs entry.
    fn resolve_device_node(&self, device: DeviceId) -> Result<Option<PathBuf>> {
        Ok(self.device_path(device)?.filter(|path| path.exists()))
    }
}
