//! Fixed-layout request buffers
//!
//! Every control request is a packed little-endian struct. These functions
//! build and read those structs as plain byte arrays. Fields that the
//! kernel treats as user-space pointers are passed in as addresses; only
//! the channel that owns the pointed-to buffers fills them in.
//!
//! ```text
//! dev_id            major:i32 minor:i32                                  8
//! cbt_info          dev_id capacity:u64 map_size:u32 snap_number:u8 gen[16]  37
//! image_info        original:dev_id snapshot:dev_id                      16
//! range             left:u64 right:u64 (inclusive)                       16
//! ```

use byteorder::{ByteOrder, LittleEndian};
use snapagent_core::{DeviceId, ExtentRange, GenerationId, SnapStoreId};

use crate::channel::{CbtInfo, ImageInfo};

/// Size of a device id on the wire
pub const DEV_ID_SIZE: usize = 8;
/// Size of one CBT info record
pub const CBT_INFO_SIZE: usize = 37;
/// Size of one image info record
pub const IMAGE_INFO_SIZE: usize = 16;
/// Size of one range record
pub const RANGE_SIZE: usize = 16;
/// Entries in the collect buffers handed to the kernel
pub const MAX_COLLECT_ENTRIES: usize = 255;
/// Fill level the kernel reports for an unknown snap store
pub const SNAP_STORE_NOT_FOUND: u64 = u64::MAX;

fn put_dev(buf: &mut [u8], dev: DeviceId) {
    LittleEndian::write_u32(&mut buf[0..4], dev.major);
    LittleEndian::write_u32(&mut buf[4..8], dev.minor);
}

fn get_dev(buf: &[u8]) -> DeviceId {
    DeviceId::new(
        LittleEndian::read_u32(&buf[0..4]),
        LittleEndian::read_u32(&buf[4..8]),
    )
}

/// `TRACKING_ADD` / `TRACKING_REMOVE`
pub fn tracking_device(dev: DeviceId) -> [u8; 8] {
    let mut req = [0u8; 8];
    put_dev(&mut req, dev);
    req
}

/// `TRACKING_COLLECT`: capacity of the output array and its address
pub fn tracking_collect(count: u32, entries_addr: u64) -> [u8; 12] {
    let mut req = [0u8; 12];
    LittleEndian::write_u32(&mut req[0..4], count);
    LittleEndian::write_u64(&mut req[4..12], entries_addr);
    req
}

/// Populated entry count written back by `TRACKING_COLLECT`
pub fn tracking_collect_count(req: &[u8; 12]) -> u32 {
    LittleEndian::read_u32(&req[0..4])
}

/// Decode one CBT info record
pub fn cbt_info(entry: &[u8]) -> CbtInfo {
    let mut generation = [0u8; 16];
    generation.copy_from_slice(&entry[21..37]);
    CbtInfo {
        device: get_dev(&entry[0..8]),
        capacity_bytes: LittleEndian::read_u64(&entry[8..16]),
        bitmap_size_bytes: LittleEndian::read_u32(&entry[16..20]),
        snap_number: entry[20],
        generation_id: GenerationId::from_bytes(generation),
    }
}

/// `TRACKING_READ_CBT_BITMAP`
pub fn read_cbt_bitmap(dev: DeviceId, offset: u32, length: u32, buffer_addr: u64) -> [u8; 24] {
    let mut req = [0u8; 24];
    put_dev(&mut req[0..8], dev);
    LittleEndian::write_u32(&mut req[8..12], offset);
    LittleEndian::write_u32(&mut req[12..16], length);
    LittleEndian::write_u64(&mut req[16..24], buffer_addr);
    req
}

/// Packed array of device ids
pub fn device_list(devices: &[DeviceId]) -> Vec<u8> {
    let mut buf = vec![0u8; devices.len() * DEV_ID_SIZE];
    for (chunk, dev) in buf.chunks_exact_mut(DEV_ID_SIZE).zip(devices) {
        put_dev(chunk, *dev);
    }
    buf
}

/// `SNAPSHOT_CREATE`; the id field is written back by the kernel
pub fn snapshot_create(count: u32, devices_addr: u64) -> [u8; 20] {
    let mut req = [0u8; 20];
    LittleEndian::write_u32(&mut req[8..12], count);
    LittleEndian::write_u64(&mut req[12..20], devices_addr);
    req
}

/// Snapshot id written back by `SNAPSHOT_CREATE`
pub fn snapshot_create_id(req: &[u8; 20]) -> u64 {
    LittleEndian::read_u64(&req[0..8])
}

/// `SNAPSHOT_DESTROY`
pub fn snapshot_destroy(snapshot_id: u64) -> [u8; 8] {
    let mut req = [0u8; 8];
    LittleEndian::write_u64(&mut req, snapshot_id);
    req
}

/// `SNAPSTORE_CREATE`
pub fn snapstore_create(
    id: &SnapStoreId,
    snapshot_device: DeviceId,
    count: u32,
    devices_addr: u64,
) -> [u8; 36] {
    let mut req = [0u8; 36];
    req[0..16].copy_from_slice(id.as_bytes());
    put_dev(&mut req[16..24], snapshot_device);
    LittleEndian::write_u32(&mut req[24..28], count);
    LittleEndian::write_u64(&mut req[28..36], devices_addr);
    req
}

/// Packed array of inclusive ranges
pub fn range_list(ranges: &[ExtentRange]) -> Vec<u8> {
    let mut buf = vec![0u8; ranges.len() * RANGE_SIZE];
    for (chunk, range) in buf.chunks_exact_mut(RANGE_SIZE).zip(ranges) {
        LittleEndian::write_u64(&mut chunk[0..8], range.left);
        LittleEndian::write_u64(&mut chunk[8..16], range.right);
    }
    buf
}

/// `SNAPSTORE_FILE`
pub fn snapstore_file(id: &SnapStoreId, count: u32, ranges_addr: u64) -> [u8; 28] {
    let mut req = [0u8; 28];
    req[0..16].copy_from_slice(id.as_bytes());
    LittleEndian::write_u32(&mut req[16..20], count);
    LittleEndian::write_u64(&mut req[20..28], ranges_addr);
    req
}

/// `SNAPSTORE_CLEANUP`; the fill level is written back by the kernel
pub fn snapstore_cleanup(id: &SnapStoreId) -> [u8; 24] {
    let mut req = [0u8; 24];
    req[0..16].copy_from_slice(id.as_bytes());
    req
}

/// Fill level written back by `SNAPSTORE_CLEANUP`
pub fn snapstore_cleanup_filled(req: &[u8; 24]) -> u64 {
    LittleEndian::read_u64(&req[16..24])
}

/// `COLLECT_SNAPSHOT_IMAGES`
pub fn collect_images(count: u32, entries_addr: u64) -> [u8; 12] {
    let mut req = [0u8; 12];
    LittleEndian::write_u32(&mut req[0..4], count);
    LittleEndian::write_u64(&mut req[4..12], entries_addr);
    req
}

/// Populated entry count written back by `COLLECT_SNAPSHOT_IMAGES`
pub fn collect_images_count(req: &[u8; 12]) -> u32 {
    LittleEndian::read_u32(&req[0..4])
}

/// Decode one image info record
pub fn image_info(entry: &[u8]) -> ImageInfo {
    ImageInfo {
        original: get_dev(&entry[0..8]),
        snapshot: get_dev(&entry[8..16]),
    }
}
