//! In-process stand-in for the kernel module
//!
//! [`SimulatedKernel`] keeps devices, CBT bitmaps, snapshots, images and
//! snap stores in memory and speaks the stream protocol, so layers above
//! the channel can be exercised without the module loaded.
//!
//! # Example
//!
//! ```
//! use snapagent_core::DeviceId;
//! use snapagent_kernel::testing::SimulatedKernel;
//! use snapagent_kernel::ControlChannel;
//!
//! let kernel = SimulatedKernel::new();
//! let disk = DeviceId::new(252, 1);
//! kernel.add_device(disk, 1 << 20);
//! kernel.add_tracking(disk).unwrap();
//! kernel.write(disk, 0, 8192);
//! assert_eq!(kernel.read_cbt_bitmap(disk).unwrap()[0], 1);
//! ```

use parking_lot::{Condvar, Mutex};
use snapagent_core::{DeviceId, ExtentRange, GenerationId, SnapStoreId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::channel::{
    CbtInfo, CleanupOutcome, ControlChannel, CreatedSnapshot, ImageInfo, StoreStream,
};
use crate::error::{KernelError, KernelResult};
use crate::protocol::{InboundCommand, OutboundCommand};

/// Major number given to simulated snapshot image devices
pub const IMAGE_MAJOR: u32 = 251;

/// Default bytes per CBT bitmap entry
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

struct SimDevice {
    capacity: u64,
    tracked: bool,
    bitmap: Vec<u8>,
    snap_number: u8,
    generation: GenerationId,
}

struct SimSnapshot {
    images: Vec<ImageInfo>,
}

struct SimStore {
    devices: Vec<DeviceId>,
    snapshot_device: DeviceId,
    ranges: Vec<ExtentRange>,
    filled: u64,
    stream: Option<Weak<SimStream>>,
}

struct State {
    block_size: u32,
    devices: BTreeMap<DeviceId, SimDevice>,
    snapshots: BTreeMap<u64, SimSnapshot>,
    stores: HashMap<SnapStoreId, SimStore>,
    next_snapshot_id: u64,
    next_image_minor: u32,
    snapshot_step: u8,
    failures: HashMap<&'static str, i32>,
}

impl State {
    fn take_failure(&mut self, op: &'static str) -> KernelResult<()> {
        match self.failures.remove(op) {
            Some(errno) => Err(KernelError::errno(op, errno)),
            None => Ok(()),
        }
    }

    fn tracked_mut(&mut self, device: DeviceId) -> KernelResult<&mut SimDevice> {
        self.devices
            .get_mut(&device)
            .filter(|dev| dev.tracked)
            .ok_or(KernelError::NotTracked(device))
    }

    fn in_snapshot(&self, device: DeviceId) -> bool {
        self.snapshots
            .values()
            .any(|snap| snap.images.iter().any(|image| image.original == device))
    }

    fn store_for(&self, device: DeviceId) -> Option<SnapStoreId> {
        self.stores
            .iter()
            .find(|(_, store)| store.devices.contains(&device))
            .map(|(id, _)| *id)
    }

    fn notify(&self, id: &SnapStoreId, command: InboundCommand) {
        if let Some(stream) = self
            .stores
            .get(id)
            .and_then(|store| store.stream.as_ref())
            .and_then(Weak::upgrade)
        {
            stream.push(command);
        }
    }
}

struct Shared {
    state: Mutex<State>,
}

/// Simulated kernel module
///
/// Cloning yields another handle on the same simulated state.
#[derive(Clone)]
pub struct SimulatedKernel {
    shared: Arc<Shared>,
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedKernel {
    /// Kernel with [`DEFAULT_BLOCK_SIZE`]
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// Kernel with a custom CBT block size
    pub fn with_block_size(block_size: u32) -> Self {
        SimulatedKernel {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    block_size,
                    devices: BTreeMap::new(),
                    snapshots: BTreeMap::new(),
                    stores: HashMap::new(),
                    next_snapshot_id: 1,
                    next_image_minor: 0,
                    snapshot_step: 1,
                    failures: HashMap::new(),
                }),
            }),
        }
    }

    /// Make a block device known to the kernel
    pub fn add_device(&self, device: DeviceId, capacity_bytes: u64) {
        self.shared.state.lock().devices.insert(
            device,
            SimDevice {
                capacity: capacity_bytes,
                tracked: false,
                bitmap: Vec::new(),
                snap_number: 0,
                generation: GenerationId::new(),
            },
        );
    }

    /// Record a write of `len` bytes at `offset` in the CBT bitmap
    ///
    /// Blocks are stamped with the generation that is currently open, one
    /// past the last snapshot's number. Untracked devices are ignored.
    pub fn write(&self, device: DeviceId, offset: u64, len: u64) {
        let mut state = self.shared.state.lock();
        let block_size = u64::from(state.block_size);
        if let Ok(dev) = state.tracked_mut(device) {
            if len == 0 {
                return;
            }
            let stamp = dev.snap_number.wrapping_add(1);
            let first = (offset / block_size) as usize;
            let last = ((offset + len - 1) / block_size) as usize;
            let end = (last + 1).min(dev.bitmap.len());
            for entry in dev.bitmap.iter_mut().take(end).skip(first) {
                *entry = stamp;
            }
        }
    }

    /// Amount each snapshot advances the snap number (normally 1)
    ///
    /// Any other value imitates a snapshot taken behind the agent's back.
    pub fn set_snapshot_step(&self, step: u8) {
        self.shared.state.lock().snapshot_step = step;
    }

    /// Start a new CBT epoch for a device, clearing its bitmap
    pub fn reset_generation(&self, device: DeviceId) {
        let mut state = self.shared.state.lock();
        if let Some(dev) = state.devices.get_mut(&device) {
            dev.generation = GenerationId::new();
            dev.snap_number = 0;
            dev.bitmap.iter_mut().for_each(|entry| *entry = 0);
        }
    }

    /// Fail the next call of request `op` (e.g. `"SNAPSHOT_CREATE"`) with `errno`
    pub fn fail_next(&self, op: &'static str, errno: i32) {
        self.shared.state.lock().failures.insert(op, errno);
    }

    /// Set the fill level a store reports on cleanup
    pub fn set_filled(&self, id: &SnapStoreId, bytes: u64) {
        if let Some(store) = self.shared.state.lock().stores.get_mut(id) {
            store.filled = bytes;
        }
    }

    /// Send HALFFILL on the store's stream
    pub fn push_halffill(&self, id: &SnapStoreId, fill_level: u64) {
        let mut state = self.shared.state.lock();
        if let Some(store) = state.stores.get_mut(id) {
            store.filled = fill_level;
        }
        state.notify(id, InboundCommand::HalfFill { fill_level });
    }

    /// Send OVERFLOW on the store's stream
    pub fn push_overflow(&self, id: &SnapStoreId, error_code: u32, fill_level: u64) {
        let state = self.shared.state.lock();
        state.notify(
            id,
            InboundCommand::Overflow {
                error_code,
                fill_level,
            },
        );
    }

    /// Discard a store and send TERMINATE on its stream
    pub fn push_terminate(&self, id: &SnapStoreId) {
        let mut state = self.shared.state.lock();
        state.notify(id, InboundCommand::Terminate);
        state.stores.remove(id);
    }

    /// Whether the device is tracked
    pub fn is_tracked(&self, device: DeviceId) -> bool {
        self.shared
            .state
            .lock()
            .devices
            .get(&device)
            .map_or(false, |dev| dev.tracked)
    }

    /// Ids of live snapshots
    pub fn snapshot_ids(&self) -> Vec<u64> {
        self.shared.state.lock().snapshots.keys().copied().collect()
    }

    /// Ids of live snap stores
    pub fn snap_store_ids(&self) -> Vec<SnapStoreId> {
        self.shared.state.lock().stores.keys().copied().collect()
    }

    /// Extents handed to a store so far
    pub fn snap_store_extents(&self, id: &SnapStoreId) -> Vec<ExtentRange> {
        self.shared
            .state
            .lock()
            .stores
            .get(id)
            .map(|store| store.ranges.clone())
            .unwrap_or_default()
    }

    /// Device a store keeps its extents on
    pub fn snap_store_device(&self, id: &SnapStoreId) -> Option<DeviceId> {
        self.shared
            .state
            .lock()
            .stores
            .get(id)
            .map(|store| store.snapshot_device)
    }
}

impl ControlChannel for SimulatedKernel {
    fn query_cbt_info(&self) -> KernelResult<Vec<CbtInfo>> {
        let mut state = self.shared.state.lock();
        state.take_failure("TRACKING_COLLECT")?;
        Ok(state
            .devices
            .iter()
            .filter(|(_, dev)| dev.tracked)
            .map(|(device, dev)| CbtInfo {
                device: *device,
                capacity_bytes: dev.capacity,
                bitmap_size_bytes: dev.bitmap.len() as u32,
                snap_number: dev.snap_number,
                generation_id: dev.generation,
            })
            .collect())
    }

    fn add_tracking(&self, device: DeviceId) -> KernelResult<()> {
        let mut state = self.shared.state.lock();
        state.take_failure("TRACKING_ADD")?;
        let block_size = u64::from(state.block_size);
        let dev = state
            .devices
            .get_mut(&device)
            .ok_or_else(|| KernelError::errno("TRACKING_ADD", libc::ENODEV))?;
        if !dev.tracked {
            dev.tracked = true;
            dev.bitmap = vec![0; ((dev.capacity + block_size - 1) / block_size) as usize];
        }
        Ok(())
    }

    fn remove_tracking(&self, device: DeviceId) -> KernelResult<()> {
        let mut state = self.shared.state.lock();
        state.take_failure("TRACKING_REMOVE")?;
        if state.in_snapshot(device) {
            return Err(KernelError::errno("TRACKING_REMOVE", libc::EBUSY));
        }
        let dev = state
            .tracked_mut(device)
            .map_err(|_| KernelError::errno("TRACKING_REMOVE", libc::ENODEV))?;
        dev.tracked = false;
        dev.bitmap.clear();
        Ok(())
    }

    fn tracking_block_size(&self) -> KernelResult<u32> {
        let mut state = self.shared.state.lock();
        state.take_failure("TRACKING_BLOCK_SIZE")?;
        Ok(state.block_size)
    }

    fn read_cbt_bitmap(&self, device: DeviceId) -> KernelResult<Vec<u8>> {
        let mut state = self.shared.state.lock();
        state.take_failure("TRACKING_READ_CBT_BITMAP")?;
        Ok(state.tracked_mut(device)?.bitmap.clone())
    }

    fn create_snapshot(&self, devices: &[DeviceId]) -> KernelResult<CreatedSnapshot> {
        const OP: &str = "SNAPSHOT_CREATE";
        let mut state = self.shared.state.lock();
        state.take_failure(OP)?;
        if devices.is_empty() {
            return Err(KernelError::errno(OP, libc::EINVAL));
        }
        for device in devices {
            state.tracked_mut(*device)?;
            if state.store_for(*device).is_none() {
                return Err(KernelError::errno(OP, libc::ENODEV));
            }
            if state.in_snapshot(*device) {
                return Err(KernelError::errno(OP, libc::EBUSY));
            }
        }

        let step = state.snapshot_step;
        let mut images = Vec::with_capacity(devices.len());
        for device in devices {
            let minor = state.next_image_minor;
            state.next_image_minor += 1;
            if let Ok(dev) = state.tracked_mut(*device) {
                dev.snap_number = dev.snap_number.wrapping_add(step);
            }
            images.push(ImageInfo {
                original: *device,
                snapshot: DeviceId::new(IMAGE_MAJOR, minor),
            });
        }

        let snapshot_id = state.next_snapshot_id;
        state.next_snapshot_id += 1;
        state.snapshots.insert(snapshot_id, SimSnapshot { images });
        debug!(target: "snapagent::kernel::sim", snapshot_id, "snapshot created");
        Ok(CreatedSnapshot {
            snapshot_id,
            count: devices.len() as u32,
        })
    }

    fn delete_snapshot(&self, snapshot_id: u64) -> KernelResult<()> {
        let mut state = self.shared.state.lock();
        state.take_failure("SNAPSHOT_DESTROY")?;
        state
            .snapshots
            .remove(&snapshot_id)
            .map(|_| ())
            .ok_or_else(|| KernelError::errno("SNAPSHOT_DESTROY", libc::ENOENT))
    }

    fn create_snap_store(
        &self,
        id: &SnapStoreId,
        devices: &[DeviceId],
        snapshot_device: DeviceId,
    ) -> KernelResult<()> {
        let mut state = self.shared.state.lock();
        state.take_failure("SNAPSTORE_CREATE")?;
        if state.stores.contains_key(id) {
            return Err(KernelError::errno("SNAPSTORE_CREATE", libc::EEXIST));
        }
        state.stores.insert(
            *id,
            SimStore {
                devices: devices.to_vec(),
                snapshot_device,
                ranges: Vec::new(),
                filled: 0,
                stream: None,
            },
        );
        Ok(())
    }

    fn add_extents_to_snap_store(
        &self,
        id: &SnapStoreId,
        ranges: &[ExtentRange],
    ) -> KernelResult<()> {
        let mut state = self.shared.state.lock();
        state.take_failure("SNAPSTORE_FILE")?;
        let store = state
            .stores
            .get_mut(id)
            .ok_or_else(|| KernelError::errno("SNAPSTORE_FILE", libc::ENOENT))?;
        store.ranges.extend_from_slice(ranges);
        Ok(())
    }

    fn cleanup_snap_store(&self, id: &SnapStoreId) -> KernelResult<CleanupOutcome> {
        let mut state = self.shared.state.lock();
        state.take_failure("SNAPSTORE_CLEANUP")?;
        let (devices, filled) = match state.stores.get(id) {
            Some(store) => (store.devices.clone(), store.filled),
            None => return Ok(CleanupOutcome::NotFound),
        };
        if devices.iter().any(|device| state.in_snapshot(*device)) {
            return Ok(CleanupOutcome::Filled(filled));
        }
        state.notify(id, InboundCommand::Terminate);
        state.stores.remove(id);
        Ok(CleanupOutcome::Filled(0))
    }

    fn collect_snapshot_images(&self) -> KernelResult<Vec<ImageInfo>> {
        let mut state = self.shared.state.lock();
        state.take_failure("COLLECT_SNAPSHOT_IMAGES")?;
        Ok(state
            .snapshots
            .values()
            .flat_map(|snap| snap.images.iter().copied())
            .collect())
    }

    fn open_stream(&self) -> KernelResult<Arc<dyn StoreStream>> {
        self.shared.state.lock().take_failure("OPEN")?;
        let stream = Arc::new_cyclic(|me: &Weak<SimStream>| SimStream {
            me: me.clone(),
            shared: Arc::clone(&self.shared),
            inbox: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
            bound: Mutex::new(None),
        });
        Ok(stream)
    }
}

/// Simulated stream handle
struct SimStream {
    me: Weak<SimStream>,
    shared: Arc<Shared>,
    inbox: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    closed: AtomicBool,
    bound: Mutex<Option<SnapStoreId>>,
}

impl SimStream {
    fn push(&self, command: InboundCommand) {
        self.inbox.lock().push_back(command.encode());
        self.ready.notify_all();
    }

    fn acknowledge(&self, code: i32) {
        self.push(InboundCommand::Acknowledge { code: code as u32 });
    }
}

impl StoreStream for SimStream {
    fn write(&self, message: &[u8]) -> KernelResult<()> {
        if self.is_closed() {
            return Err(KernelError::ChannelClosed);
        }
        let command = match OutboundCommand::decode(message) {
            Ok(command) => command,
            Err(_) => {
                self.push(InboundCommand::Invalid);
                return Ok(());
            }
        };

        let mut state = self.shared.state.lock();
        match command {
            OutboundCommand::Initiate {
                store_id,
                snapshot_device,
                devices,
                ..
            } => {
                if state.stores.contains_key(&store_id) {
                    self.acknowledge(libc::EEXIST);
                    return Ok(());
                }
                state.stores.insert(
                    store_id,
                    SimStore {
                        devices,
                        snapshot_device,
                        ranges: Vec::new(),
                        filled: 0,
                        stream: Some(self.me.clone()),
                    },
                );
                *self.bound.lock() = Some(store_id);
                self.acknowledge(0);
            }
            OutboundCommand::NextPortion { store_id, ranges }
            | OutboundCommand::NextPortionMultidev {
                store_id, ranges, ..
            } => {
                if *self.bound.lock() != Some(store_id) {
                    self.acknowledge(libc::EINVAL);
                    return Ok(());
                }
                match state.stores.get_mut(&store_id) {
                    Some(store) => {
                        store.ranges.extend(ranges);
                        self.acknowledge(0);
                    }
                    None => self.acknowledge(libc::ENOENT),
                }
            }
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let mut inbox = self.inbox.lock();
        loop {
            if self.is_closed() {
                return Err(KernelError::ChannelClosed);
            }
            if let Some(message) = inbox.pop_front() {
                let len = message.len().min(buf.len());
                buf[..len].copy_from_slice(&message[..len]);
                return Ok(len);
            }
            self.ready.wait(&mut inbox);
        }
    }

    fn close(&self) {
        let _inbox = self.inbox.lock();
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
