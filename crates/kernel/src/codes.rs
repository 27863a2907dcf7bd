//! Request codes for `/dev/veeamsnap`
//!
//! Encoded the way the Linux `_IOW`/`_IOR` macros do:
//! `dir << 30 | size << 16 | type << 8 | nr`, with type `'V'`.

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const IOC_TYPE: u32 = b'V' as u32;

const fn ioc(dir: u32, nr: u32, size: u32) -> u32 {
    (dir << 30) | (size << 16) | (IOC_TYPE << 8) | nr
}

const fn iow(nr: u32, size: u32) -> u32 {
    ioc(IOC_WRITE, nr, size)
}

const fn ior(nr: u32, size: u32) -> u32 {
    ioc(IOC_READ, nr, size)
}

/// Start tracking a device
pub const TRACKING_ADD: u32 = iow(0x02, 8);
/// Stop tracking a device
pub const TRACKING_REMOVE: u32 = iow(0x03, 8);
/// Collect CBT info for every tracked device
pub const TRACKING_COLLECT: u32 = iow(0x04, 12);
/// Bytes covered by one CBT bitmap entry
pub const TRACKING_BLOCK_SIZE: u32 = iow(0x05, 4);
/// Read part of a device's CBT bitmap
pub const TRACKING_READ_CBT_BITMAP: u32 = ior(0x06, 24);

/// Create a snapshot of a device set
pub const SNAPSHOT_CREATE: u32 = iow(0x10, 20);
/// Destroy a snapshot
pub const SNAPSHOT_DESTROY: u32 = ior(0x11, 8);

/// Create a snap store
pub const SNAPSTORE_CREATE: u32 = ior(0x28, 36);
/// Hand file extents to a snap store
pub const SNAPSTORE_FILE: u32 = ior(0x29, 28);
/// Release a snap store, or report its fill level when in use
pub const SNAPSTORE_CLEANUP: u32 = iow(0x2B, 24);

/// Enumerate snapshot images
pub const COLLECT_SNAPSHOT_IMAGES: u32 = iow(0x30, 12);
