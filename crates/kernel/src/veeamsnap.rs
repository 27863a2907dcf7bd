//! Channel backed by the real `/dev/veeamsnap` device node

use snapagent_core::{DeviceId, ExtentRange, SnapStoreId};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::channel::{
    CbtInfo, CleanupOutcome, ControlChannel, CreatedSnapshot, ImageInfo, StoreStream,
};
use crate::codes;
use crate::error::{KernelError, KernelResult};
use crate::layout::{self, CBT_INFO_SIZE, IMAGE_INFO_SIZE, MAX_COLLECT_ENTRIES};

/// Default control device node
pub const DEFAULT_DEVICE_NODE: &str = "/dev/veeamsnap";

/// How long a stream read waits before rechecking the closed flag
const POLL_INTERVAL_MS: libc::c_int = 100;

/// Control channel talking to the kernel module through ioctls
#[derive(Debug, Clone)]
pub struct VeeamsnapControl {
    device_node: PathBuf,
}

impl Default for VeeamsnapControl {
    fn default() -> Self {
        Self::new()
    }
}

impl VeeamsnapControl {
    /// Channel on [`DEFAULT_DEVICE_NODE`]
    pub fn new() -> Self {
        Self::with_device_node(DEFAULT_DEVICE_NODE)
    }

    /// Channel on a custom device node
    pub fn with_device_node(path: impl AsRef<Path>) -> Self {
        VeeamsnapControl {
            device_node: path.as_ref().to_path_buf(),
        }
    }

    /// Device node this channel opens
    pub fn device_node(&self) -> &Path {
        &self.device_node
    }

    fn open(&self) -> KernelResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device_node)
            .map_err(|source| KernelError::Open {
                path: self.device_node.clone(),
                source,
            })
    }

    /// Issue one request on a freshly opened handle
    ///
    /// `request` must be exactly the size encoded in `code`, and every
    /// address inside it must point at a buffer that outlives the call.
    fn ioctl(&self, op: &'static str, code: u32, request: &mut [u8]) -> KernelResult<libc::c_int> {
        let file = self.open()?;
        // SAFETY: `request` is a live, exclusively borrowed buffer of the size
        // the kernel expects for `code`; embedded pointers are owned by the
        // caller's stack frame for the duration of this call.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), code as _, request.as_mut_ptr()) };
        if rc < 0 {
            return Err(KernelError::Ioctl {
                op,
                source: io::Error::last_os_error(),
            });
        }
        trace!(target: "snapagent::kernel", op, rc, "control call");
        Ok(rc)
    }
}

impl ControlChannel for VeeamsnapControl {
    fn query_cbt_info(&self) -> KernelResult<Vec<CbtInfo>> {
        let mut entries = vec![0u8; MAX_COLLECT_ENTRIES * CBT_INFO_SIZE];
        let mut req =
            layout::tracking_collect(MAX_COLLECT_ENTRIES as u32, entries.as_mut_ptr() as u64);
        self.ioctl("TRACKING_COLLECT", codes::TRACKING_COLLECT, &mut req)?;

        let count = (layout::tracking_collect_count(&req) as usize).min(MAX_COLLECT_ENTRIES);
        Ok(entries
            .chunks_exact(CBT_INFO_SIZE)
            .take(count)
            .map(layout::cbt_info)
            .collect())
    }

    fn add_tracking(&self, device: DeviceId) -> KernelResult<()> {
        let mut req = layout::tracking_device(device);
        self.ioctl("TRACKING_ADD", codes::TRACKING_ADD, &mut req)?;
        debug!(target: "snapagent::kernel", device = %device, "tracking added");
        Ok(())
    }

    fn remove_tracking(&self, device: DeviceId) -> KernelResult<()> {
        let mut req = layout::tracking_device(device);
        self.ioctl("TRACKING_REMOVE", codes::TRACKING_REMOVE, &mut req)?;
        debug!(target: "snapagent::kernel", device = %device, "tracking removed");
        Ok(())
    }

    fn tracking_block_size(&self) -> KernelResult<u32> {
        let mut req = [0u8; 4];
        self.ioctl("TRACKING_BLOCK_SIZE", codes::TRACKING_BLOCK_SIZE, &mut req)?;
        Ok(u32::from_le_bytes(req))
    }

    fn read_cbt_bitmap(&self, device: DeviceId) -> KernelResult<Vec<u8>> {
        let info = self
            .query_cbt_info()?
            .into_iter()
            .find(|info| info.device == device)
            .ok_or(KernelError::NotTracked(device))?;

        let length = info.bitmap_size_bytes;
        let mut bitmap = vec![0u8; length as usize];
        let mut req = layout::read_cbt_bitmap(device, 0, length, bitmap.as_mut_ptr() as u64);
        let read = self.ioctl(
            "TRACKING_READ_CBT_BITMAP",
            codes::TRACKING_READ_CBT_BITMAP,
            &mut req,
        )?;
        if read as usize != bitmap.len() {
            return Err(KernelError::ShortTransfer {
                op: "TRACKING_READ_CBT_BITMAP",
                expected: bitmap.len(),
                actual: read as usize,
            });
        }
        Ok(bitmap)
    }

    fn create_snapshot(&self, devices: &[DeviceId]) -> KernelResult<CreatedSnapshot> {
        let mut list = layout::device_list(devices);
        let mut req = layout::snapshot_create(devices.len() as u32, list.as_mut_ptr() as u64);
        self.ioctl("SNAPSHOT_CREATE", codes::SNAPSHOT_CREATE, &mut req)?;
        let snapshot_id = layout::snapshot_create_id(&req);
        debug!(target: "snapagent::kernel", snapshot_id, devices = devices.len(), "snapshot created");
        Ok(CreatedSnapshot {
            snapshot_id,
            count: devices.len() as u32,
        })
    }

    fn delete_snapshot(&self, snapshot_id: u64) -> KernelResult<()> {
        let mut req = layout::snapshot_destroy(snapshot_id);
        self.ioctl("SNAPSHOT_DESTROY", codes::SNAPSHOT_DESTROY, &mut req)?;
        debug!(target: "snapagent::kernel", snapshot_id, "snapshot destroyed");
        Ok(())
    }

    fn create_snap_store(
        &self,
        id: &SnapStoreId,
        devices: &[DeviceId],
        snapshot_device: DeviceId,
    ) -> KernelResult<()> {
        let mut list = layout::device_list(devices);
        let mut req = layout::snapstore_create(
            id,
            snapshot_device,
            devices.len() as u32,
            list.as_mut_ptr() as u64,
        );
        self.ioctl("SNAPSTORE_CREATE", codes::SNAPSTORE_CREATE, &mut req)?;
        Ok(())
    }

    fn add_extents_to_snap_store(
        &self,
        id: &SnapStoreId,
        ranges: &[ExtentRange],
    ) -> KernelResult<()> {
        let mut list = layout::range_list(ranges);
        let mut req = layout::snapstore_file(id, ranges.len() as u32, list.as_mut_ptr() as u64);
        self.ioctl("SNAPSTORE_FILE", codes::SNAPSTORE_FILE, &mut req)?;
        Ok(())
    }

    fn cleanup_snap_store(&self, id: &SnapStoreId) -> KernelResult<CleanupOutcome> {
        let mut req = layout::snapstore_cleanup(id);
        self.ioctl("SNAPSTORE_CLEANUP", codes::SNAPSTORE_CLEANUP, &mut req)?;
        match layout::snapstore_cleanup_filled(&req) {
            layout::SNAP_STORE_NOT_FOUND => Ok(CleanupOutcome::NotFound),
            filled => Ok(CleanupOutcome::Filled(filled)),
        }
    }

    fn collect_snapshot_images(&self) -> KernelResult<Vec<ImageInfo>> {
        let mut entries = vec![0u8; MAX_COLLECT_ENTRIES * IMAGE_INFO_SIZE];
        let mut req =
            layout::collect_images(MAX_COLLECT_ENTRIES as u32, entries.as_mut_ptr() as u64);
        self.ioctl(
            "COLLECT_SNAPSHOT_IMAGES",
            codes::COLLECT_SNAPSHOT_IMAGES,
            &mut req,
        )?;

        let count = (layout::collect_images_count(&req) as usize).min(MAX_COLLECT_ENTRIES);
        Ok(entries
            .chunks_exact(IMAGE_INFO_SIZE)
            .take(count)
            .map(layout::image_info)
            .take_while(|image| !image.snapshot.is_unset())
            .collect())
    }

    fn open_stream(&self) -> KernelResult<Arc<dyn StoreStream>> {
        let file = self.open()?;
        Ok(Arc::new(VeeamsnapStream {
            file,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Stream handle on the control device
///
/// Reads poll with a short timeout so that `close` from another thread
/// wakes a blocked reader without pulling the descriptor out from under it.
struct VeeamsnapStream {
    file: File,
    closed: AtomicBool,
}

impl StoreStream for VeeamsnapStream {
    fn write(&self, message: &[u8]) -> KernelResult<()> {
        if self.is_closed() {
            return Err(KernelError::ChannelClosed);
        }
        (&self.file)
            .write_all(message)
            .map_err(|source| KernelError::Stream { op: "write", source })
    }

    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        loop {
            if self.is_closed() {
                return Err(KernelError::ChannelClosed);
            }
            let mut pollfd = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: `pollfd` is a valid single-element array for the call.
            let rc = unsafe { libc::poll(&mut pollfd, 1, POLL_INTERVAL_MS) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(KernelError::Stream {
                    op: "poll",
                    source: err,
                });
            }
            if rc == 0 {
                continue;
            }
            return (&self.file)
                .read(buf)
                .map_err(|source| KernelError::Stream { op: "read", source });
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
