//! In-memory catalog tables with optional file persistence
//!
//! All tables live behind one `RwLock`. Reads clone rows out. Mutations
//! take the write lock; for a file-backed catalog the change is applied to
//! a staged copy, the whole file is rewritten, and only then is the copy
//! swapped in, so a failed write leaves memory matching the file.

use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snapagent_core::{
    Catalog, DeviceId, Error, Result, SnapStore, SnapStoreFile, SnapStoreId, SnapStoreLocation,
    SnapStoreMapping, Snapshot, SnapshotImage, TrackedDisk, VolumeSnapshot,
};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::persist::{load_catalog, write_catalog};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    tracked_disks: BTreeMap<String, TrackedDisk>,
    locations: BTreeMap<String, SnapStoreLocation>,
    mappings: BTreeMap<String, SnapStoreMapping>,
    snap_stores: BTreeMap<SnapStoreId, SnapStore>,
    snap_store_files: BTreeMap<String, SnapStoreFile>,
    snapshot_images: BTreeMap<String, SnapshotImage>,
    volume_snapshots: BTreeMap<String, VolumeSnapshot>,
    snapshots: BTreeMap<String, Snapshot>,
}

fn insert<K, V>(map: &mut BTreeMap<K, V>, kind: &str, key: K, value: V) -> Result<()>
where
    K: Ord + Display,
{
    if map.contains_key(&key) {
        return Err(Error::Conflict(format!("{} {} already exists", kind, key)));
    }
    map.insert(key, value);
    Ok(())
}

fn get<K, Q, V>(map: &BTreeMap<K, V>, kind: &str, key: &Q) -> Result<V>
where
    K: Ord + Borrow<Q>,
    Q: Ord + Display + ?Sized,
    V: Clone,
{
    map.get(key)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("{} {}", kind, key)))
}

fn replace<K, V>(map: &mut BTreeMap<K, V>, kind: &str, key: &K, value: V) -> Result<()>
where
    K: Ord + Display,
{
    match map.get_mut(key) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(Error::NotFound(format!("{} {}", kind, key))),
    }
}

fn remove<K, Q, V>(map: &mut BTreeMap<K, V>, kind: &str, key: &Q) -> Result<()>
where
    K: Ord + Borrow<Q>,
    Q: Ord + Display + ?Sized,
{
    map.remove(key)
        .map(|_| ())
        .ok_or_else(|| Error::NotFound(format!("{} {}", kind, key)))
}

struct Backing {
    path: PathBuf,
    // held for the lifetime of the store
    _lock: File,
}

/// Catalog implementation used by the agent
pub struct CatalogStore {
    tables: RwLock<Tables>,
    backing: Option<Backing>,
    fresh: bool,
}

impl CatalogStore {
    /// Catalog that lives only in memory
    pub fn ephemeral() -> Self {
        CatalogStore {
            tables: RwLock::new(Tables::default()),
            backing: None,
            fresh: true,
        }
    }

    /// Open or create a file-backed catalog
    ///
    /// A sibling `.lock` file is locked exclusively so two agents cannot
    /// share one catalog.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;
        }

        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::Catalog(format!("failed to open lock file: {}", e)))?;
        lock.try_lock_exclusive().map_err(|_| {
            Error::Catalog(format!(
                "catalog at '{}' is already in use by another process",
                path.display()
            ))
        })?;

        let fresh = !path.exists();
        let tables = if fresh {
            let tables = Tables::default();
            write_catalog(&path, &tables)
                .map_err(|e| Error::Catalog(format!("creating {}: {}", path.display(), e)))?;
            tables
        } else {
            load_catalog(&path)
                .map_err(|e| Error::Catalog(format!("loading {}: {}", path.display(), e)))?
        };

        info!(
            target: "snapagent::catalog",
            path = %path.display(),
            fresh,
            snapshots = tables.snapshots.len(),
            snap_stores = tables.snap_stores.len(),
            "Catalog opened"
        );

        Ok(CatalogStore {
            tables: RwLock::new(tables),
            backing: Some(Backing { path, _lock: lock }),
            fresh,
        })
    }

    /// True when the catalog did not exist before this process opened it
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// File backing this catalog, if any
    pub fn path(&self) -> Option<&Path> {
        self.backing.as_ref().map(|b| b.path.as_path())
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.tables.read())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.write();
        let backing = match &self.backing {
            Some(backing) => backing,
            None => return f(&mut tables),
        };
        let mut staged = tables.clone();
        let out = f(&mut staged)?;
        write_catalog(&backing.path, &staged).map_err(|e| {
            Error::Catalog(format!("writing {}: {}", backing.path.display(), e))
        })?;
        *tables = staged;
        debug!(target: "snapagent::catalog", path = %backing.path.display(), "Catalog persisted");
        Ok(out)
    }
}

impl Catalog for CatalogStore {
    fn create_tracked_disk(&self, disk: TrackedDisk) -> Result<()> {
        self.mutate(|t| {
            let key = disk.tracking_id.clone();
            insert(&mut t.tracked_disks, "tracked disk", key, disk)
        })
    }

    fn tracked_disk(&self, id: &str) -> Result<TrackedDisk> {
        self.read(|t| get(&t.tracked_disks, "tracked disk", id))
    }

    fn tracked_disk_by_device(&self, device: DeviceId) -> Result<Option<TrackedDisk>> {
        Ok(self.read(|t| {
            t.tracked_disks
                .values()
                .find(|disk| disk.device == device)
                .cloned()
        }))
    }

    fn list_tracked_disks(&self) -> Result<Vec<TrackedDisk>> {
        Ok(self.read(|t| t.tracked_disks.values().cloned().collect()))
    }

    fn delete_tracked_disk(&self, id: &str) -> Result<()> {
        self.mutate(|t| remove(&mut t.tracked_disks, "tracked disk", id))
    }

    fn create_location(&self, location: SnapStoreLocation) -> Result<()> {
        self.mutate(|t| {
            let key = location.tracking_id.clone();
            insert(&mut t.locations, "snap store location", key, location)
        })
    }

    fn location(&self, id: &str) -> Result<SnapStoreLocation> {
        self.read(|t| get(&t.locations, "snap store location", id))
    }

    fn location_by_path(&self, path: &Path) -> Result<Option<SnapStoreLocation>> {
        Ok(self.read(|t| t.locations.values().find(|l| l.path == path).cloned()))
    }

    fn list_locations(&self) -> Result<Vec<SnapStoreLocation>> {
        Ok(self.read(|t| t.locations.values().cloned().collect()))
    }

    fn delete_location(&self, id: &str) -> Result<()> {
        self.mutate(|t| remove(&mut t.locations, "snap store location", id))
    }

    fn create_mapping(&self, mapping: SnapStoreMapping) -> Result<()> {
        self.mutate(|t| {
            if t
                .mappings
                .values()
                .any(|m| m.tracked_disk_id == mapping.tracked_disk_id)
            {
                return Err(Error::Conflict(format!(
                    "tracked disk {} is already mapped",
                    mapping.tracked_disk_id
                )));
            }
            let key = mapping.tracking_id.clone();
            insert(&mut t.mappings, "snap store mapping", key, mapping)
        })
    }

    fn mapping(&self, id: &str) -> Result<SnapStoreMapping> {
        self.read(|t| get(&t.mappings, "snap store mapping", id))
    }

    fn mapping_for_disk(&self, disk_id: &str) -> Result<Option<SnapStoreMapping>> {
        Ok(self.read(|t| {
            t.mappings
                .values()
                .find(|m| m.tracked_disk_id == disk_id)
                .cloned()
        }))
    }

    fn list_mappings(&self) -> Result<Vec<SnapStoreMapping>> {
        Ok(self.read(|t| t.mappings.values().cloned().collect()))
    }

    fn delete_mapping(&self, id: &str) -> Result<()> {
        self.mutate(|t| remove(&mut t.mappings, "snap store mapping", id))
    }

    fn create_snap_store(&self, store: SnapStore) -> Result<()> {
        self.mutate(|t| insert(&mut t.snap_stores, "snap store", store.id, store))
    }

    fn snap_store(&self, id: SnapStoreId) -> Result<SnapStore> {
        self.read(|t| get(&t.snap_stores, "snap store", &id))
    }

    fn snap_store_for_disk(&self, disk_id: &str) -> Result<Option<SnapStore>> {
        Ok(self.read(|t| {
            t.snap_stores
                .values()
                .find(|s| s.tracked_disk_id == disk_id)
                .cloned()
        }))
    }

    fn list_snap_stores(&self) -> Result<Vec<SnapStore>> {
        Ok(self.read(|t| t.snap_stores.values().cloned().collect()))
    }

    fn update_snap_store(&self, store: SnapStore) -> Result<()> {
        self.mutate(|t| {
            let key = store.id;
            replace(&mut t.snap_stores, "snap store", &key, store)
        })
    }

    fn delete_snap_store(&self, id: SnapStoreId) -> Result<()> {
        self.mutate(|t| remove(&mut t.snap_stores, "snap store", &id))
    }

    fn create_snap_store_file(&self, file: SnapStoreFile) -> Result<()> {
        self.mutate(|t| {
            let key = file.tracking_id.clone();
            insert(&mut t.snap_store_files, "snap store file", key, file)
        })
    }

    fn record_snap_store_file(&self, file: SnapStoreFile) -> Result<SnapStore> {
        self.mutate(|t| {
            let store = t
                .snap_stores
                .get_mut(&file.snap_store_id)
                .ok_or_else(|| Error::NotFound(format!("snap store {}", file.snap_store_id)))?;
            if t.snap_store_files.contains_key(&file.tracking_id) {
                return Err(Error::Conflict(format!(
                    "snap store file {} already exists",
                    file.tracking_id
                )));
            }
            store.total_allocated_size += file.size;
            let updated = store.clone();
            t.snap_store_files.insert(file.tracking_id.clone(), file);
            Ok(updated)
        })
    }

    fn files_for_store(&self, store_id: SnapStoreId) -> Result<Vec<SnapStoreFile>> {
        Ok(self.read(|t| {
            t.snap_store_files
                .values()
                .filter(|f| f.snap_store_id == store_id)
                .cloned()
                .collect()
        }))
    }

    fn files_for_location(&self, location_id: &str) -> Result<Vec<SnapStoreFile>> {
        Ok(self.read(|t| {
            t.snap_store_files
                .values()
                .filter(|f| f.location_id == location_id)
                .cloned()
                .collect()
        }))
    }

    fn delete_snap_store_file(&self, id: &str) -> Result<()> {
        self.mutate(|t| remove(&mut t.snap_store_files, "snap store file", id))
    }

    fn delete_snap_store_with_files(&self, id: SnapStoreId) -> Result<()> {
        self.mutate(|t| {
            remove(&mut t.snap_stores, "snap store", &id)?;
            t.snap_store_files.retain(|_, file| file.snap_store_id != id);
            Ok(())
        })
    }

    fn create_snapshot_image(&self, image: SnapshotImage) -> Result<()> {
        self.mutate(|t| {
            let key = image.tracking_id.clone();
            insert(&mut t.snapshot_images, "snapshot image", key, image)
        })
    }

    fn snapshot_image(&self, id: &str) -> Result<SnapshotImage> {
        self.read(|t| get(&t.snapshot_images, "snapshot image", id))
    }

    fn delete_snapshot_image(&self, id: &str) -> Result<()> {
        self.mutate(|t| remove(&mut t.snapshot_images, "snapshot image", id))
    }

    fn create_volume_snapshot(&self, volume: VolumeSnapshot) -> Result<()> {
        self.mutate(|t| {
            let key = volume.tracking_id.clone();
            insert(&mut t.volume_snapshots, "volume snapshot", key, volume)
        })
    }

    fn volume_snapshot(&self, id: &str) -> Result<VolumeSnapshot> {
        self.read(|t| get(&t.volume_snapshots, "volume snapshot", id))
    }

    fn volume_snapshots_for_store(&self, store_id: SnapStoreId) -> Result<Vec<VolumeSnapshot>> {
        Ok(self.read(|t| {
            t.volume_snapshots
                .values()
                .filter(|v| v.snap_store_id == store_id)
                .cloned()
                .collect()
        }))
    }

    fn update_volume_snapshot(&self, volume: VolumeSnapshot) -> Result<()> {
        self.mutate(|t| {
            let key = volume.tracking_id.clone();
            replace(&mut t.volume_snapshots, "volume snapshot", &key, volume)
        })
    }

    fn delete_volume_snapshot(&self, id: &str) -> Result<()> {
        self.mutate(|t| remove(&mut t.volume_snapshots, "volume snapshot", id))
    }

    fn create_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.mutate(|t| {
            let key = snapshot.id.clone();
            insert(&mut t.snapshots, "snapshot", key, snapshot)
        })
    }

    fn snapshot(&self, id: &str) -> Result<Snapshot> {
        self.read(|t| get(&t.snapshots, "snapshot", id))
    }

    fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        Ok(self.read(|t| t.snapshots.values().cloned().collect()))
    }

    fn snapshots_for_disk(&self, disk_id: &str) -> Result<Vec<Snapshot>> {
        Ok(self.read(|t| {
            t.snapshots
                .values()
                .filter(|snapshot| {
                    snapshot.volume_snapshot_ids.iter().any(|id| {
                        t.volume_snapshots
                            .get(id)
                            .map_or(false, |v| v.tracked_disk_id == disk_id)
                    })
                })
                .cloned()
                .collect()
        }))
    }

    fn delete_snapshot(&self, id: &str) -> Result<()> {
        self.mutate(|t| remove(&mut t.snapshots, "snapshot", id))
    }

    fn delete_snapshot_with_volumes(&self, id: &str) -> Result<()> {
        self.mutate(|t| {
            let snapshot = t
                .snapshots
                .remove(id)
                .ok_or_else(|| Error::NotFound(format!("snapshot {}", id)))?;
            for volume_id in &snapshot.volume_snapshot_ids {
                if let Some(volume) = t.volume_snapshots.remove(volume_id) {
                    t.snapshot_images.remove(&volume.snapshot_image_id);
                }
            }
            Ok(())
        })
    }
}
