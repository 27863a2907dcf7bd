//! Snapshot create, delete and changed-sector queries

use chrono::Utc;
use snapagent_core::{
    tracking_id_for, DeviceId, Error, GenerationId, Result, Snapshot, SnapshotImage, SnapStoreId,
    TrackedDisk, VolumeSnapshot, VolumeStatus,
};
use snapagent_kernel::{CbtInfo, ImageInfo};
use std::path::PathBuf;
use std::thread;
use tracing::{debug, error, info, warn};

use super::{ignore_not_found, Orchestrator};
use crate::increments::{fetch_increments, BackupType, ChangedSectors};

/// A snapshot with its volume snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDetails {
    /// Catalog row
    pub snapshot: Snapshot,
    /// One entry per disk, in creation order
    pub volumes: Vec<VolumeSnapshot>,
}

/// What a failed create has to undo, in creation order
#[derive(Debug, Default)]
struct Rollback {
    stores: Vec<SnapStoreId>,
    kernel_snapshot: Option<u64>,
    images: Vec<String>,
    volumes: Vec<String>,
}

impl Orchestrator {
    /// Snapshot a set of tracked disks as one point in time
    ///
    /// Creates missing snap stores, asks the kernel for one snapshot of the
    /// whole set and checks that exactly one generation and one image per
    /// disk appeared. Anything else means another actor touched the kernel
    /// state concurrently. On failure every row written by this call is
    /// removed, the kernel snapshot destroyed and new snap stores cleaned
    /// up; problems while undoing are logged.
    pub fn create_snapshot<S: AsRef<str>>(&self, disk_ids: &[S]) -> Result<SnapshotDetails> {
        if disk_ids.is_empty() {
            return Err(Error::BadRequest(
                "a snapshot needs at least one disk".to_string(),
            ));
        }
        let s = &self.shared;
        let _guard = s.lifecycle.lock();

        let mut disks: Vec<TrackedDisk> = Vec::with_capacity(disk_ids.len());
        for id in disk_ids {
            let id = id.as_ref();
            if id.is_empty() {
                return Err(Error::BadRequest("tracked disk id must not be empty".to_string()));
            }
            if disks.iter().any(|disk| disk.tracking_id == id) {
                return Err(Error::BadRequest(format!("disk {} listed twice", id)));
            }
            disks.push(s.catalog.tracked_disk(id)?);
        }
        for disk in &disks {
            if !s.catalog.snapshots_for_disk(&disk.tracking_id)?.is_empty() {
                return Err(Error::Conflict(format!(
                    "disk {} already has a snapshot",
                    disk.tracking_id
                )));
            }
        }

        let mut rollback = Rollback::default();
        match self.take_snapshot(&disks, &mut rollback) {
            Ok(details) => {
                info!(
                    target: "snapagent::engine",
                    snapshot_id = %details.snapshot.id,
                    disks = disks.len(),
                    "Snapshot created"
                );
                Ok(details)
            }
            Err(e) => {
                error!(target: "snapagent::engine", error = %e, "Snapshot creation failed, rolling back");
                self.compensate(rollback);
                Err(e)
            }
        }
    }

    fn take_snapshot(
        &self,
        disks: &[TrackedDisk],
        rollback: &mut Rollback,
    ) -> Result<SnapshotDetails> {
        let s = &self.shared;

        let mut stores = Vec::with_capacity(disks.len());
        for disk in disks {
            let (store, created) = self.ensure_snap_store(disk)?;
            if created {
                rollback.stores.push(store.id);
            }
            stores.push(store);
        }

        let devices: Vec<DeviceId> = disks.iter().map(|disk| disk.device).collect();
        let (pre_cbt, pre_images) = self.kernel_state()?;
        let created = s
            .kernel
            .create_snapshot(&devices)
            .map_err(|e| Error::kernel("creating snapshot", e))?;
        rollback.kernel_snapshot = Some(created.snapshot_id);
        let (post_cbt, post_images) = self.kernel_state()?;
        let snapshot_id = created.snapshot_id.to_string();
        debug!(target: "snapagent::engine", snapshot_id = %snapshot_id, count = created.count, "Kernel snapshot taken");

        let mut verified = Vec::with_capacity(disks.len());
        for disk in disks {
            let before = cbt_for(&pre_cbt, disk)?;
            let after = cbt_for(&post_cbt, disk)?;
            let delta = after.snap_number.wrapping_sub(before.snap_number);
            if delta != 1 {
                return Err(Error::InvariantViolation(format!(
                    "snap number of disk {} moved from {} to {}, expected one step",
                    disk.tracking_id, before.snap_number, after.snap_number
                )));
            }
            let new_images: Vec<ImageInfo> = post_images
                .iter()
                .filter(|image| image.original == disk.device && !pre_images.contains(image))
                .copied()
                .collect();
            if new_images.len() != 1 {
                return Err(Error::InvariantViolation(format!(
                    "expected one new snapshot image for disk {}, found {}",
                    disk.tracking_id,
                    new_images.len()
                )));
            }
            verified.push((after, new_images[0]));
        }

        let mut volumes = Vec::with_capacity(disks.len());
        for ((disk, store), (cbt, image)) in disks.iter().zip(&stores).zip(verified) {
            let node = self.wait_for_device_node(image.snapshot)?;
            let bitmap = s.kernel.read_cbt_bitmap(disk.device).map_err(|e| {
                Error::kernel(format!("reading CBT bitmap of {}", disk.tracking_id), e)
            })?;

            let image_row = SnapshotImage {
                tracking_id: tracking_id_for(&node),
                device_path: node,
                device: image.snapshot,
            };
            s.catalog.create_snapshot_image(image_row.clone())?;
            rollback.images.push(image_row.tracking_id.clone());

            let volume = VolumeSnapshot {
                tracking_id: format!("{}-{}", snapshot_id, disk.tracking_id),
                snapshot_id: snapshot_id.clone(),
                snapshot_number: u32::from(cbt.snap_number),
                generation_id: cbt.generation_id,
                tracked_disk_id: disk.tracking_id.clone(),
                snapshot_image_id: image_row.tracking_id,
                snap_store_id: store.id,
                bitmap,
                status: VolumeStatus::Healthy,
            };
            s.catalog.create_volume_snapshot(volume.clone())?;
            rollback.volumes.push(volume.tracking_id.clone());
            volumes.push(volume);
        }

        let snapshot = Snapshot {
            id: snapshot_id,
            kernel_snapshot_id: created.snapshot_id,
            volume_snapshot_ids: volumes.iter().map(|v| v.tracking_id.clone()).collect(),
            created_at: Utc::now(),
        };
        s.catalog.create_snapshot(snapshot.clone())?;
        Ok(SnapshotDetails { snapshot, volumes })
    }

    fn kernel_state(&self) -> Result<(Vec<CbtInfo>, Vec<ImageInfo>)> {
        let kernel = &self.shared.kernel;
        let cbt = kernel
            .query_cbt_info()
            .map_err(|e| Error::kernel("querying CBT info", e))?;
        let images = kernel
            .collect_snapshot_images()
            .map_err(|e| Error::kernel("collecting snapshot images", e))?;
        Ok((cbt, images))
    }

    /// Poll until udev has created the node for a new image device
    fn wait_for_device_node(&self, device: DeviceId) -> Result<PathBuf> {
        let config = &self.shared.config;
        for attempt in 1..=config.device_node_attempts {
            if let Some(path) = self.shared.directory.resolve_device_node(device)? {
                debug!(target: "snapagent::engine", device = %device, path = %path.display(), attempt, "Image device node found");
                return Ok(path);
            }
            if attempt < config.device_node_attempts {
                thread::sleep(config.device_node_interval());
            }
        }
        Err(Error::Device(format!(
            "no device node for snapshot image {} after {} attempts",
            device, config.device_node_attempts
        )))
    }

    fn compensate(&self, rollback: Rollback) {
        let s = &self.shared;
        for id in rollback.volumes.iter().rev() {
            if let Err(e) = ignore_not_found(s.catalog.delete_volume_snapshot(id)) {
                warn!(target: "snapagent::engine", volume = %id, error = %e, "Rollback: failed to delete volume snapshot");
            }
        }
        for id in rollback.images.iter().rev() {
            if let Err(e) = ignore_not_found(s.catalog.delete_snapshot_image(id)) {
                warn!(target: "snapagent::engine", image = %id, error = %e, "Rollback: failed to delete snapshot image");
            }
        }
        if let Some(snapshot_id) = rollback.kernel_snapshot {
            if let Err(e) = s.kernel.delete_snapshot(snapshot_id) {
                warn!(target: "snapagent::engine", snapshot_id, error = %e, "Rollback: failed to destroy kernel snapshot");
            }
        }
        for id in rollback.stores.iter().rev() {
            if let Err(e) = self.release_snap_store(*id) {
                warn!(target: "snapagent::engine", store_id = %id, error = %e, "Rollback: failed to release snap store");
            }
        }
    }

    /// Destroy a snapshot and release the snap stores behind it
    ///
    /// Deleting an unknown snapshot succeeds. A kernel snapshot that is
    /// already gone is not an error either, so a failed delete can be
    /// retried.
    pub fn delete_snapshot(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::BadRequest("snapshot id must not be empty".to_string()));
        }
        let s = &self.shared;
        let _guard = s.lifecycle.lock();

        let snapshot = match s.catalog.snapshot(id) {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_not_found() => {
                debug!(target: "snapagent::engine", snapshot_id = id, "Snapshot already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match s.kernel.delete_snapshot(snapshot.kernel_snapshot_id) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                warn!(target: "snapagent::engine", snapshot_id = id, "Kernel snapshot already destroyed");
            }
            Err(e) => return Err(Error::kernel(format!("destroying snapshot {}", id), e)),
        }

        for volume_id in &snapshot.volume_snapshot_ids {
            let volume = match s.catalog.volume_snapshot(volume_id) {
                Ok(volume) => volume,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            self.release_snap_store(volume.snap_store_id)?;
        }
        // one write, so the snapshot never outlives its volume rows
        ignore_not_found(s.catalog.delete_snapshot_with_volumes(id))?;
        info!(target: "snapagent::engine", snapshot_id = id, "Snapshot deleted");
        Ok(())
    }

    /// One snapshot with its volumes
    pub fn get_snapshot(&self, id: &str) -> Result<SnapshotDetails> {
        if id.is_empty() {
            return Err(Error::BadRequest("snapshot id must not be empty".to_string()));
        }
        let s = &self.shared;
        let snapshot = s.catalog.snapshot(id)?;
        let volumes = snapshot
            .volume_snapshot_ids
            .iter()
            .map(|volume_id| s.catalog.volume_snapshot(volume_id))
            .collect::<Result<Vec<_>>>()?;
        Ok(SnapshotDetails { snapshot, volumes })
    }

    /// All snapshots
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        self.shared.catalog.list_snapshots()
    }

    /// The part of snapshot `snapshot_id` that covers disk `disk_id`
    pub fn find_volume_snapshot(&self, snapshot_id: &str, disk_id: &str) -> Result<VolumeSnapshot> {
        if snapshot_id.is_empty() || disk_id.is_empty() {
            return Err(Error::BadRequest(
                "snapshot and disk ids must not be empty".to_string(),
            ));
        }
        let s = &self.shared;
        let snapshot = s.catalog.snapshot(snapshot_id)?;
        for volume_id in &snapshot.volume_snapshot_ids {
            let volume = s.catalog.volume_snapshot(volume_id)?;
            if volume.tracked_disk_id == disk_id {
                return Ok(volume);
            }
        }
        Err(Error::NotFound(format!(
            "disk {} in snapshot {}",
            disk_id, snapshot_id
        )))
    }

    /// Byte ranges a backup of `disk_id` from this snapshot must read
    ///
    /// A full backup is reported when no previous number is given or the
    /// CBT epoch changed since the previous backup.
    pub fn get_changed_sectors(
        &self,
        snapshot_id: &str,
        disk_id: &str,
        previous_generation_id: &str,
        previous_number: u32,
    ) -> Result<ChangedSectors> {
        let previous_generation = if previous_generation_id.is_empty() {
            None
        } else {
            Some(GenerationId::from_string(previous_generation_id).ok_or_else(|| {
                Error::BadRequest(format!(
                    "invalid generation id '{}'",
                    previous_generation_id
                ))
            })?)
        };

        let volume = self.find_volume_snapshot(snapshot_id, disk_id)?;
        if volume.status == VolumeStatus::Overflow {
            return Err(Error::Overflow {
                store_id: volume.snap_store_id,
                error_code: 0,
                fill_level: 0,
            });
        }

        let full = previous_number == 0 || previous_generation != Some(volume.generation_id);
        let previous = if full { 0 } else { previous_number };
        let block_size = self
            .shared
            .kernel
            .tracking_block_size()
            .map_err(|e| Error::kernel("reading CBT block size", e))?;
        let ranges = fetch_increments(&volume.bitmap, previous, volume.snapshot_number, block_size);
        debug!(
            target: "snapagent::engine",
            snapshot_id,
            disk = disk_id,
            full,
            ranges = ranges.len(),
            "Changed sectors computed"
        );

        Ok(ChangedSectors {
            disk_id: disk_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            backup_type: if full {
                BackupType::Full
            } else {
                BackupType::Incremental
            },
            block_size,
            ranges,
        })
    }
}

fn cbt_for(entries: &[CbtInfo], disk: &TrackedDisk) -> Result<CbtInfo> {
    entries
        .iter()
        .find(|entry| entry.device == disk.device)
        .copied()
        .ok_or_else(|| {
            Error::InvariantViolation(format!(
                "disk {} ({}) is not tracked by the kernel",
                disk.tracking_id, disk.device
            ))
        })
}
