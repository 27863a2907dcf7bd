//! Snap store creation, reporting and growth

use snapagent_core::{Error, Result, SnapStore, SnapStoreId, TrackedDisk};
use snapagent_kernel::CleanupOutcome;
use snapagent_watcher::{AllocatedExtent, SnapStoreWatcher};
use std::fs;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Orchestrator;

/// A snap store with its sizes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapStoreReport {
    /// Catalog row
    pub store: SnapStore,
    /// Sum of the sizes of its extent files
    pub allocated_bytes: u64,
    /// Copy-on-write bytes in use, 0 while no snapshot depends on it
    pub used_bytes: u64,
    /// Whether a watcher services the store
    pub watcher_running: bool,
}

impl Orchestrator {
    /// All snap stores
    pub fn list_snap_stores(&self) -> Result<Vec<SnapStoreReport>> {
        let _guard = self.shared.lifecycle.lock();
        self.shared
            .catalog
            .list_snap_stores()?
            .into_iter()
            .map(|store| self.snap_store_report(store))
            .collect()
    }

    /// One snap store
    pub fn get_snap_store(&self, id: SnapStoreId) -> Result<SnapStoreReport> {
        let _guard = self.shared.lifecycle.lock();
        let store = self.shared.catalog.snap_store(id)?;
        self.snap_store_report(store)
    }

    /// Hand the kernel one more extent of `bytes` for store `id`
    pub fn add_snap_store_capacity(&self, id: SnapStoreId, bytes: u64) -> Result<AllocatedExtent> {
        if bytes == 0 {
            return Err(Error::BadRequest(
                "capacity to add must be greater than zero".to_string(),
            ));
        }
        let s = &self.shared;
        let _guard = s.lifecycle.lock();

        let store = s.catalog.snap_store(id)?;
        let location = s.catalog.location(&store.location_id)?;
        let fs_info = s.directory.filesystem_info(&location.path)?;
        if fs_info.available_bytes < bytes {
            return Err(Error::Conflict(format!(
                "location {} has {} bytes available, {} requested",
                location.tracking_id, fs_info.available_bytes, bytes
            )));
        }

        let extent = {
            let watchers = s.watchers.lock();
            let watcher = watchers
                .get(&id)
                .filter(|watcher| watcher.is_running())
                .ok_or_else(|| Error::Conflict(format!("snap store {} has no running watcher", id)))?;
            watcher.allocate_storage(bytes)?
        };
        s.record_extent(id, &location.tracking_id, &extent)?;
        info!(target: "snapagent::engine", store_id = %id, size = extent.size, "Snap store capacity added");
        Ok(extent)
    }

    fn snap_store_report(&self, store: SnapStore) -> Result<SnapStoreReport> {
        let s = &self.shared;
        let allocated_bytes = s
            .catalog
            .files_for_store(store.id)?
            .iter()
            .map(|file| file.size)
            .sum();
        // cleanup on a store without snapshots would delete it
        let used_bytes = if s.catalog.volume_snapshots_for_store(store.id)?.is_empty() {
            0
        } else {
            match s
                .kernel
                .cleanup_snap_store(&store.id)
                .map_err(|e| Error::kernel(format!("reading fill level of {}", store.id), e))?
            {
                CleanupOutcome::Filled(bytes) => bytes,
                CleanupOutcome::NotFound => 0,
            }
        };
        let watcher_running = s
            .watchers
            .lock()
            .get(&store.id)
            .map_or(false, |watcher| watcher.is_running());
        Ok(SnapStoreReport {
            store,
            allocated_bytes,
            used_bytes,
            watcher_running,
        })
    }

    /// The disk's snap store, created with its first extent if needed
    ///
    /// Returns the store and whether this call created it. Caller holds the
    /// lifecycle lock.
    pub(super) fn ensure_snap_store(&self, disk: &TrackedDisk) -> Result<(SnapStore, bool)> {
        let s = &self.shared;
        if let Some(store) = s.catalog.snap_store_for_disk(&disk.tracking_id)? {
            let running = s
                .watchers
                .lock()
                .get(&store.id)
                .map_or(false, |watcher| watcher.is_running());
            if running {
                return Ok((store, false));
            }
            warn!(
                target: "snapagent::engine",
                store_id = %store.id,
                disk = %disk.tracking_id,
                "Replacing snap store without a running watcher"
            );
            self.release_snap_store(store.id)?;
        }

        let mapping = s
            .catalog
            .mapping_for_disk(&disk.tracking_id)?
            .ok_or_else(|| {
                Error::NotFound(format!("snap store mapping for disk {}", disk.tracking_id))
            })?;
        let location = s.catalog.location(&mapping.location_id)?;
        if location.device.is_unset() {
            return Err(Error::BadRequest(format!(
                "location {} has no backing block device",
                location.tracking_id
            )));
        }
        if !location.enabled {
            return Err(Error::Conflict(format!(
                "location {} is disabled",
                location.tracking_id
            )));
        }

        let store = SnapStore {
            id: SnapStoreId::new(),
            tracked_disk_id: disk.tracking_id.clone(),
            location_id: location.tracking_id.clone(),
            total_allocated_size: 0,
        };
        s.catalog.create_snap_store(store.clone())?;

        let watcher = match SnapStoreWatcher::start(
            self.watcher_params(&store, &location, disk),
            s.kernel.as_ref(),
            Arc::clone(&s.directory),
            s.events.clone(),
        ) {
            Ok(watcher) => watcher,
            Err(e) => {
                if let Err(forget) = s.forget_snap_store(store.id) {
                    warn!(target: "snapagent::engine", store_id = %store.id, error = %forget, "Failed to remove snap store row");
                }
                return Err(e);
            }
        };

        let initial = self.initial_allocation(disk)?;
        let allocated = watcher
            .allocate_storage(initial)
            .and_then(|extent| s.record_extent(store.id, &location.tracking_id, &extent));
        if let Err(e) = allocated {
            watcher.stop();
            if let Err(release) = self.release_snap_store(store.id) {
                warn!(target: "snapagent::engine", store_id = %store.id, error = %release, "Failed to release snap store");
            }
            return Err(e);
        }
        s.watchers.lock().insert(store.id, watcher);

        let store = s.catalog.snap_store(store.id)?;
        info!(
            target: "snapagent::engine",
            store_id = %store.id,
            disk = %disk.tracking_id,
            location = %location.tracking_id,
            allocated = store.total_allocated_size,
            "Snap store created"
        );
        Ok((store, true))
    }

    /// Give a store back to the kernel and forget it
    ///
    /// Extents already handed over stay reserved kernel-side until the
    /// module is reloaded; only the files and rows go away here.
    pub(super) fn release_snap_store(&self, id: SnapStoreId) -> Result<()> {
        let s = &self.shared;
        let outcome = s
            .kernel
            .cleanup_snap_store(&id)
            .map_err(|e| Error::kernel(format!("cleaning up snap store {}", id), e))?;
        debug!(target: "snapagent::engine", store_id = %id, ?outcome, "Snap store cleaned up");
        self.retire_watcher(id);

        let base_dir = s
            .catalog
            .snap_store(id)
            .ok()
            .and_then(|store| {
                s.catalog
                    .location(&store.location_id)
                    .ok()
                    .map(|location| store.path(&location))
            });
        if let Some(dir) = base_dir {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(target: "snapagent::engine", store_id = %id, path = %dir.display(), error = %e, "Failed to remove extent files");
                }
            }
        }
        s.forget_snap_store(id)
    }

    fn initial_allocation(&self, disk: &TrackedDisk) -> Result<u64> {
        let config = &self.shared.config;
        let size = self.shared.directory.device_info(disk.device)?.size_bytes;
        Ok(match config.initial_allocation(size) {
            0 => config.snap_store_file_size,
            bytes => bytes,
        })
    }
}
