//! Scripted device directory for tests
//!
//! [`StaticDirectory`] answers device questions from tables filled in by
//! the test, while extent files are still created on the real filesystem
//! so their lifecycle (creation, cleanup on terminate) can be observed.

use parking_lot::Mutex;
use snapagent_core::{
    BlockDeviceInfo, DeviceDirectory, DeviceId, Error, ExtentRange, FileExtents,
    FilesystemInfo, Result,
};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

const FIRST_PHYSICAL_OFFSET: u64 = 1 << 20;

#[derive(Default)]
struct Tables {
    devices: HashMap<DeviceId, BlockDeviceInfo>,
    dynamic_majors: HashMap<u32, String>,
    mounts: Vec<(PathBuf, DeviceId, FilesystemInfo)>,
    extents: HashMap<PathBuf, ExtentRange>,
    next_physical: u64,
    pending_node_polls: u32,
    extent_device_override: Option<DeviceId>,
}

impl Tables {
    fn mount_for(&self, path: &Path) -> Option<&(PathBuf, DeviceId, FilesystemInfo)> {
        self.mounts
            .iter()
            .filter(|(dir, _, _)| path.starts_with(dir))
            .max_by_key(|(dir, _, _)| dir.components().count())
    }

    fn lookup(&self, device: DeviceId) -> Option<BlockDeviceInfo> {
        if let Some(info) = self.devices.get(&device) {
            return Some(info.clone());
        }
        self.dynamic_majors.get(&device.major).map(|prefix| BlockDeviceInfo {
            path: PathBuf::from(format!("/dev/{}{}", prefix, device.minor)),
            device,
            size_bytes: 0,
            logical_sector_size: 512,
        })
    }
}

/// Device directory driven by test tables
pub struct StaticDirectory {
    tables: Mutex<Tables>,
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticDirectory {
    /// Empty directory
    pub fn new() -> Self {
        StaticDirectory {
            tables: Mutex::new(Tables {
                next_physical: FIRST_PHYSICAL_OFFSET,
                ..Tables::default()
            }),
        }
    }

    /// Register a block device
    pub fn add_device(
        &self,
        device: DeviceId,
        path: impl AsRef<Path>,
        size_bytes: u64,
        logical_sector_size: u32,
    ) {
        self.tables.lock().devices.insert(
            device,
            BlockDeviceInfo {
                path: path.as_ref().to_path_buf(),
                device,
                size_bytes,
                logical_sector_size,
            },
        );
    }

    /// Name every device with `major` as `/dev/<prefix><minor>`
    ///
    /// Stands in for udev creating nodes for devices the kernel adds later,
    /// such as snapshot images.
    pub fn add_dynamic_major(&self, major: u32, prefix: &str) {
        self.tables
            .lock()
            .dynamic_majors
            .insert(major, prefix.to_string());
    }

    /// Declare that files under `dir` live on `device`
    pub fn add_mount(&self, dir: impl AsRef<Path>, device: DeviceId, fs: FilesystemInfo) {
        self.tables
            .lock()
            .mounts
            .push((dir.as_ref().to_path_buf(), device, fs));
    }

    /// Make the next `polls` node lookups come back empty
    pub fn delay_device_nodes(&self, polls: u32) {
        self.tables.lock().pending_node_polls = polls;
    }

    /// Report extents on `device` regardless of where the file lives
    pub fn report_extents_on(&self, device: Option<DeviceId>) {
        self.tables.lock().extent_device_override = device;
    }
}

impl DeviceDirectory for StaticDirectory {
    fn device_path(&self, device: DeviceId) -> Result<Option<PathBuf>> {
        Ok(self.tables.lock().lookup(device).map(|info| info.path))
    }

    fn device_id(&self, path: &Path) -> Result<DeviceId> {
        let tables = self.tables.lock();
        tables
            .devices
            .values()
            .find(|info| info.path == path)
            .map(|info| info.device)
            .ok_or_else(|| Error::NotFound(format!("device {}", path.display())))
    }

    fn device_info(&self, device: DeviceId) -> Result<BlockDeviceInfo> {
        self.tables
            .lock()
            .lookup(device)
            .ok_or_else(|| Error::NotFound(format!("block device {device}")))
    }

    fn backing_device(&self, path: &Path) -> Result<BlockDeviceInfo> {
        let tables = self.tables.lock();
        let (_, device, _) = tables
            .mount_for(path)
            .ok_or_else(|| Error::NotFound(format!("no mount holds {}", path.display())))?;
        tables
            .lookup(*device)
            .ok_or_else(|| Error::NotFound(format!("block device {device}")))
    }

    fn filesystem_info(&self, path: &Path) -> Result<FilesystemInfo> {
        self.tables
            .lock()
            .mount_for(path)
            .map(|(_, _, fs)| *fs)
            .ok_or_else(|| Error::NotFound(format!("no mount holds {}", path.display())))
    }

    fn file_extents(&self, path: &Path) -> Result<FileExtents> {
        let len = std::fs::metadata(path)
            .map_err(|e| Error::io(format!("stat {}", path.display()), e))?
            .len();
        let mut tables = self.tables.lock();
        let device = match tables.extent_device_override {
            Some(device) => device,
            None => {
                tables
                    .mount_for(path)
                    .ok_or_else(|| Error::NotFound(format!("no mount holds {}", path.display())))?
                    .1
            }
        };
        let range = match tables.extents.get(path) {
            Some(range) => *range,
            None => {
                let range = ExtentRange::from_offset_len(tables.next_physical, len.max(1))
                    .ok_or_else(|| Error::Device(format!("{} is empty", path.display())))?;
                tables.next_physical = range.right + 1;
                tables.extents.insert(path.to_path_buf(), range);
                range
            }
        };
        Ok(FileExtents {
            device,
            ranges: vec![range],
        })
    }

    fn create_extent_file(&self, path: &Path, size: u64) -> Result<u64> {
        let context = || format!("creating extent file {}", path.display());
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::io(context(), e))?;
        file.set_len(size).map_err(|e| Error::io(context(), e))?;
        Ok(size)
    }

    fn resolve_device_node(&self, device: DeviceId) -> Result<Option<PathBuf>> {
        let mut tables = self.tables.lock();
        if tables.pending_node_polls > 0 {
            tables.pending_node_polls -= 1;
            return Ok(None);
        }
        Ok(tables.lookup(device).map(|info| info.path))
    }
}
