//! Device directory backed by sysfs, stat, statvfs and FIEMAP

use byteorder::{ByteOrder, NativeEndian};
use fs2::FileExt;
use snapagent_core::{
    BlockDeviceInfo, DeviceDirectory, DeviceId, Error, ExtentRange, FileExtents,
    FilesystemInfo, Result,
};
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// `_IOWR('f', 11, struct fiemap)`
const FS_IOC_FIEMAP: u32 = 0xC020_660B;
const FIEMAP_FLAG_SYNC: u32 = 0x1;
const FIEMAP_EXTENT_LAST: u32 = 0x1;
const FIEMAP_HEADER_SIZE: usize = 32;
const FIEMAP_EXTENT_SIZE: usize = 56;
const FIEMAP_BATCH: usize = 64;

/// sysfs reports device sizes in 512-byte units regardless of sector size
const SYSFS_SECTOR: u64 = 512;
const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Split a kernel `dev_t` the way glibc's `major()`/`minor()` do
pub fn split_dev(dev: u64) -> DeviceId {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    DeviceId::new(major as u32, minor as u32)
}

/// Device directory reading the live system
#[derive(Debug, Clone)]
pub struct SysfsDirectory {
    sys_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for SysfsDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsDirectory {
    /// Directory on `/sys` and `/dev`
    pub fn new() -> Self {
        Self::with_roots("/sys", "/dev")
    }

    /// Directory on alternative roots
    pub fn with_roots(sys_root: impl AsRef<Path>, dev_root: impl AsRef<Path>) -> Self {
        SysfsDirectory {
            sys_root: sys_root.as_ref().to_path_buf(),
            dev_root: dev_root.as_ref().to_path_buf(),
        }
    }

    fn block_dir(&self, device: DeviceId) -> PathBuf {
        self.sys_root.join("dev/block").join(device.to_string())
    }

    fn logical_sector_size(&self, device: DeviceId) -> u32 {
        let dir = self.block_dir(device);
        // partitions have no queue directory of their own
        [
            dir.join("queue/logical_block_size"),
            dir.join("../queue/logical_block_size"),
        ]
        .iter()
        .find_map(|path| read_number(path).ok())
        .map(|size| size as u32)
        .unwrap_or(DEFAULT_SECTOR_SIZE)
    }
}

fn read_number(path: &Path) -> io::Result<u64> {
    let text = fs::read_to_string(path)?;
    text.trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::BadRequest(format!("path {} contains NUL", path.display())))
}

fn not_found_or_io(context: String, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::NotFound(context)
    } else {
        Error::io(context, err)
    }
}

/// Walk a file's extents with repeated `FS_IOC_FIEMAP` calls
fn fiemap(file: &File) -> io::Result<Vec<ExtentRange>> {
    let mut ranges = Vec::new();
    let mut start = 0u64;
    let mut buf = vec![0u8; FIEMAP_HEADER_SIZE + FIEMAP_BATCH * FIEMAP_EXTENT_SIZE];

    loop {
        buf.iter_mut().for_each(|b| *b = 0);
        NativeEndian::write_u64(&mut buf[0..8], start);
        NativeEndian::write_u64(&mut buf[8..16], u64::MAX - start);
        NativeEndian::write_u32(&mut buf[16..20], FIEMAP_FLAG_SYNC);
        NativeEndian::write_u32(&mut buf[24..28], FIEMAP_BATCH as u32);

        // SAFETY: `buf` holds a fiemap header followed by room for the
        // number of extents announced in fm_extent_count.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_FIEMAP as _, buf.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mapped = NativeEndian::read_u32(&buf[20..24]) as usize;
        if mapped == 0 {
            return Ok(ranges);
        }
        for i in 0..mapped.min(FIEMAP_BATCH) {
            let at = FIEMAP_HEADER_SIZE + i * FIEMAP_EXTENT_SIZE;
            let extent = &buf[at..at + FIEMAP_EXTENT_SIZE];
            let logical = NativeEndian::read_u64(&extent[0..8]);
            let physical = NativeEndian::read_u64(&extent[8..16]);
            let length = NativeEndian::read_u64(&extent[16..24]);
            let flags = NativeEndian::read_u32(&extent[40..44]);

            ranges.extend(ExtentRange::from_offset_len(physical, length));
            start = logical + length;
            if flags & FIEMAP_EXTENT_LAST != 0 {
                return Ok(ranges);
            }
        }
    }
}

impl DeviceDirectory for SysfsDirectory {
    fn device_path(&self, device: DeviceId) -> Result<Option<PathBuf>> {
        let uevent = self.block_dir(device).join("uevent");
        let text = match fs::read_to_string(&uevent) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(format!("reading {}", uevent.display()), e)),
        };
        Ok(text
            .lines()
            .find_map(|line| line.strip_prefix("DEVNAME="))
            .map(|name| self.dev_root.join(name.trim())))
    }

    fn device_id(&self, path: &Path) -> Result<DeviceId> {
        let meta = fs::metadata(path)
            .map_err(|e| not_found_or_io(format!("device {}", path.display()), e))?;
        let device = split_dev(meta.rdev());
        if device.is_unset() {
            return Err(Error::Device(format!(
                "{} is not a device node",
                path.display()
            )));
        }
        Ok(device)
    }

    fn device_info(&self, device: DeviceId) -> Result<BlockDeviceInfo> {
        let path = self
            .device_path(device)?
            .ok_or_else(|| Error::NotFound(format!("block device {device}")))?;
        let sectors = read_number(&self.block_dir(device).join("size")).map_err(|e| {
            Error::Device(format!("cannot read size of block device {device}: {e}"))
        })?;
        Ok(BlockDeviceInfo {
            path,
            device,
            size_bytes: sectors * SYSFS_SECTOR,
            logical_sector_size: self.logical_sector_size(device),
        })
    }

    fn backing_device(&self, path: &Path) -> Result<BlockDeviceInfo> {
        let meta = fs::metadata(path)
            .map_err(|e| not_found_or_io(format!("path {}", path.display()), e))?;
        self.device_info(split_dev(meta.dev()))
    }

    fn filesystem_info(&self, path: &Path) -> Result<FilesystemInfo> {
        let c_path = c_path(path)?;
        // SAFETY: statvfs is plain old data and fully written on success.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: `c_path` is NUL terminated and `stat` is a valid out pointer.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(not_found_or_io(
                format!("statvfs {}", path.display()),
                io::Error::last_os_error(),
            ));
        }
        let frsize = stat.f_frsize as u64;
        Ok(FilesystemInfo {
            total_bytes: stat.f_blocks as u64 * frsize,
            available_bytes: stat.f_bavail as u64 * frsize,
            free_bytes: stat.f_bfree as u64 * frsize,
        })
    }

    fn file_extents(&self, path: &Path) -> Result<FileExtents> {
        let file = File::open(path)
            .map_err(|e| not_found_or_io(format!("extent file {}", path.display()), e))?;
        let meta = file
            .metadata()
            .map_err(|e| Error::io(format!("stat {}", path.display()), e))?;
        let ranges =
            fiemap(&file).map_err(|e| Error::io(format!("FIEMAP on {}", path.display()), e))?;
        debug!(target: "snapagent::devices", path = %path.display(), extents = ranges.len(), "resolved extents");
        Ok(FileExtents {
            device: split_dev(meta.dev()),
            ranges,
        })
    }

    fn create_extent_file(&self, path: &Path, size: u64) -> Result<u64> {
        let context = || format!("creating extent file {}", path.display());
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::io(context(), e))?;
        file.allocate(size).map_err(|e| Error::io(context(), e))?;
        file.sync_all().map_err(|e| Error::io(context(), e))?;
        let allocated = file
            .metadata()
            .map_err(|e| Error::io(context(), e))?
            .len();
        Ok(allocated)
    }
}
