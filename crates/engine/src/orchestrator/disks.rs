//! Tracked disks, snap store locations and mappings

use snapagent_core::{
    tracking_id_for, Error, Result, SnapStoreLocation, SnapStoreMapping, TrackedDisk,
};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use super::Orchestrator;

/// A location together with its current capacity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationReport {
    /// Catalog row
    pub location: SnapStoreLocation,
    /// Size of the hosting filesystem
    pub total_bytes: u64,
    /// Bytes still available to the agent
    pub available_bytes: u64,
    /// Bytes held by extent files of this location
    pub allocated_bytes: u64,
}

fn require_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::BadRequest(format!("{} id must not be empty", kind)));
    }
    Ok(())
}

impl Orchestrator {
    // ========================================================================
    // Tracked disks
    // ========================================================================

    /// Put the block device at `path` under change-block tracking
    ///
    /// Idempotent: a device already in the catalog is returned as is. The
    /// kernel is only asked to track the device when it does not already
    /// report a CBT map for it.
    pub fn add_tracked_disk(&self, path: impl AsRef<Path>) -> Result<TrackedDisk> {
        let path = path.as_ref();
        let s = &self.shared;
        let _guard = s.lifecycle.lock();

        let device = s.directory.device_id(path)?;
        if let Some(existing) = s.catalog.tracked_disk_by_device(device)? {
            return Ok(existing);
        }
        if s
            .catalog
            .list_locations()?
            .iter()
            .any(|location| location.device == device)
        {
            return Err(Error::Conflict(format!(
                "{} hosts a snap store location",
                path.display()
            )));
        }
        let info = s.directory.device_info(device)?;

        let cbt = s
            .kernel
            .query_cbt_info()
            .map_err(|e| Error::kernel("querying CBT info", e))?;
        let already_tracked = cbt
            .iter()
            .any(|entry| entry.device == device && entry.bitmap_size_bytes > 0);
        if !already_tracked {
            s.kernel
                .add_tracking(device)
                .map_err(|e| Error::kernel(format!("adding {} to tracking", device), e))?;
        }

        let disk = TrackedDisk {
            tracking_id: tracking_id_for(path),
            path: path.to_path_buf(),
            device,
            sector_size: info.logical_sector_size,
        };
        s.catalog.create_tracked_disk(disk.clone())?;
        info!(
            target: "snapagent::engine",
            disk = %disk.tracking_id,
            device = %device,
            already_tracked,
            "Disk added to tracking"
        );
        Ok(disk)
    }

    /// All tracked disks
    pub fn list_tracked_disks(&self) -> Result<Vec<TrackedDisk>> {
        self.shared.catalog.list_tracked_disks()
    }

    /// One tracked disk
    pub fn get_tracked_disk(&self, id: &str) -> Result<TrackedDisk> {
        require_id("tracked disk", id)?;
        self.shared.catalog.tracked_disk(id)
    }

    /// Stop tracking a disk
    ///
    /// Refused while a snapshot or a mapping still refers to it.
    pub fn remove_tracked_disk(&self, id: &str) -> Result<()> {
        require_id("tracked disk", id)?;
        let s = &self.shared;
        let _guard = s.lifecycle.lock();

        let disk = s.catalog.tracked_disk(id)?;
        if !s.catalog.snapshots_for_disk(id)?.is_empty() {
            return Err(Error::Conflict(format!("disk {} has a snapshot", id)));
        }
        if s.catalog.mapping_for_disk(id)?.is_some() {
            return Err(Error::Conflict(format!(
                "disk {} is mapped to a snap store location",
                id
            )));
        }
        s.kernel
            .remove_tracking(disk.device)
            .map_err(|e| Error::kernel(format!("removing {} from tracking", disk.device), e))?;
        s.catalog.delete_tracked_disk(id)?;
        info!(target: "snapagent::engine", disk = id, "Disk removed from tracking");
        Ok(())
    }

    // ========================================================================
    // Snap store locations
    // ========================================================================

    /// Allow snap stores to place extent files under `path`
    ///
    /// Locations are unique by path and get a generated id. The directory
    /// must live on a device that is not tracked: copy-on-write
    /// data written to a tracked disk would itself need copying.
    pub fn add_snap_store_location(&self, path: impl AsRef<Path>) -> Result<SnapStoreLocation> {
        let path = path.as_ref();
        let s = &self.shared;
        let _guard = s.lifecycle.lock();

        if s.catalog.location_by_path(path)?.is_some() {
            return Err(Error::Conflict(format!(
                "{} is already a snap store location",
                path.display()
            )));
        }
        let backing = s.directory.backing_device(path)?;
        if backing.device.is_unset() {
            return Err(Error::BadRequest(format!(
                "{} is not backed by a block device",
                path.display()
            )));
        }
        if let Some(disk) = s.catalog.tracked_disk_by_device(backing.device)? {
            return Err(Error::Conflict(format!(
                "{} is on tracked disk {}",
                path.display(),
                disk.tracking_id
            )));
        }
        let fs_info = s.directory.filesystem_info(path)?;

        let location = SnapStoreLocation {
            tracking_id: Uuid::new_v4().to_string(),
            path: path.to_path_buf(),
            total_capacity: fs_info.total_bytes,
            device_path: backing.path,
            device: backing.device,
            enabled: true,
        };
        s.catalog.create_location(location.clone())?;
        info!(
            target: "snapagent::engine",
            location = %location.tracking_id,
            path = %path.display(),
            device = %location.device,
            "Snap store location added"
        );
        Ok(location)
    }

    /// All locations with their capacity
    pub fn list_snap_store_locations(&self) -> Result<Vec<LocationReport>> {
        self.shared
            .catalog
            .list_locations()?
            .into_iter()
            .map(|location| self.location_report(location))
            .collect()
    }

    /// One location with its capacity
    pub fn get_snap_store_location(&self, id: &str) -> Result<LocationReport> {
        require_id("snap store location", id)?;
        let location = self.shared.catalog.location(id)?;
        self.location_report(location)
    }

    /// Forget a location
    ///
    /// Refused while a mapping or a snap store refers to it.
    pub fn delete_snap_store_location(&self, id: &str) -> Result<()> {
        require_id("snap store location", id)?;
        let s = &self.shared;
        let _guard = s.lifecycle.lock();

        s.catalog.location(id)?;
        if s
            .catalog
            .list_mappings()?
            .iter()
            .any(|mapping| mapping.location_id == id)
        {
            return Err(Error::Conflict(format!("location {} is mapped", id)));
        }
        if s
            .catalog
            .list_snap_stores()?
            .iter()
            .any(|store| store.location_id == id)
        {
            return Err(Error::Conflict(format!("location {} hosts a snap store", id)));
        }
        s.catalog.delete_location(id)?;
        info!(target: "snapagent::engine", location = id, "Snap store location deleted");
        Ok(())
    }

    fn location_report(&self, location: SnapStoreLocation) -> Result<LocationReport> {
        let s = &self.shared;
        let fs_info = s.directory.filesystem_info(&location.path)?;
        let allocated_bytes = s
            .catalog
            .files_for_location(&location.tracking_id)?
            .iter()
            .map(|file| file.size)
            .sum();
        Ok(LocationReport {
            total_bytes: fs_info.total_bytes,
            available_bytes: fs_info.available_bytes,
            allocated_bytes,
            location,
        })
    }

    // ========================================================================
    // Mappings
    // ========================================================================

    /// Decide where a disk's snap store will live
    ///
    /// The mapping id is the disk id; a disk has at most one mapping.
    pub fn create_snap_store_mapping(
        &self,
        disk_id: &str,
        location_id: &str,
    ) -> Result<SnapStoreMapping> {
        require_id("tracked disk", disk_id)?;
        require_id("snap store location", location_id)?;
        let s = &self.shared;
        let _guard = s.lifecycle.lock();

        s.catalog.tracked_disk(disk_id)?;
        let location = s.catalog.location(location_id)?;
        if !location.enabled {
            return Err(Error::Conflict(format!("location {} is disabled", location_id)));
        }
        let mapping = SnapStoreMapping {
            tracking_id: disk_id.to_string(),
            tracked_disk_id: disk_id.to_string(),
            location_id: location_id.to_string(),
        };
        s.catalog.create_mapping(mapping.clone())?;
        info!(target: "snapagent::engine", disk = disk_id, location = location_id, "Mapping created");
        Ok(mapping)
    }

    /// All mappings
    pub fn list_snap_store_mappings(&self) -> Result<Vec<SnapStoreMapping>> {
        self.shared.catalog.list_mappings()
    }

    /// Remove a mapping
    ///
    /// Refused while the disk has a snap store.
    pub fn delete_snap_store_mapping(&self, id: &str) -> Result<()> {
        require_id("mapping", id)?;
        let s = &self.shared;
        let _guard = s.lifecycle.lock();

        let mapping = s.catalog.mapping(id)?;
        if s
            .catalog
            .snap_store_for_disk(&mapping.tracked_disk_id)?
            .is_some()
        {
            return Err(Error::Conflict(format!(
                "disk {} has a snap store",
                mapping.tracked_disk_id
            )));
        }
        s.catalog.delete_mapping(id)?;
        info!(target: "snapagent::engine", mapping = id, "Mapping deleted");
        Ok(())
    }
}
