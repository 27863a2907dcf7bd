//! Extent-growth watcher
//!
//! One watcher per live snap store. It owns an open stream on the kernel
//! channel, announces the store with INITIATE, and then a dedicated reader
//! thread services whatever the kernel asks for until the stream closes.
//!
//! ## States
//!
//! ```text
//! Created -> Running -> Stopped
//!               |          ^
//!               +-> Terminating (TERMINATE received, files being removed)
//! ```

use parking_lot::Mutex;
use snapagent_core::{DeviceDirectory, DeviceId, Error, Result, SnapStoreId};
use snapagent_kernel::{
    ControlChannel, InboundCommand, KernelError, OutboundCommand, StoreStream,
    INBOUND_BUFFER_SIZE,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::router::{EventSender, WatcherEvent};

/// Lifecycle of a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Stream open, INITIATE not yet sent
    Created,
    /// Reader thread servicing the store
    Running,
    /// Handling TERMINATE
    Terminating,
    /// Stream closed
    Stopped,
}

/// Everything needed to start a watcher
#[derive(Clone)]
pub struct WatcherParams {
    /// Store id
    pub store_id: SnapStoreId,
    /// Location id the files belong to
    pub location_id: String,
    /// Directory for this store's extent files
    pub base_dir: PathBuf,
    /// Device hosting `base_dir`; every extent must live here
    pub snapshot_device: DeviceId,
    /// Devices whose copy-on-write data goes to this store
    pub devices: Vec<DeviceId>,
    /// Size of each reactive extent file, also the kernel's empty limit
    pub empty_limit: u64,
}

/// One extent file handed to the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedExtent {
    /// File path
    pub path: PathBuf,
    /// Bytes allocated
    pub size: u64,
}

struct Inner {
    params: WatcherParams,
    stream: Arc<dyn StoreStream>,
    directory: Arc<dyn DeviceDirectory>,
    events: EventSender,
    state: Mutex<WatcherState>,
    // serializes file creation and NEXT_PORTION writes
    alloc_lock: Mutex<()>,
}

/// Watcher for one snap store
pub struct SnapStoreWatcher {
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SnapStoreWatcher {
    /// Open a stream, send INITIATE and start the reader thread
    ///
    /// On failure the stream is closed and nothing is left running.
    pub fn start(
        params: WatcherParams,
        kernel: &dyn ControlChannel,
        directory: Arc<dyn DeviceDirectory>,
        events: EventSender,
    ) -> Result<Self> {
        let stream = kernel
            .open_stream()
            .map_err(|e| Error::kernel("opening snap store stream", e))?;
        let inner = Arc::new(Inner {
            params,
            stream,
            directory,
            events,
            state: Mutex::new(WatcherState::Created),
            alloc_lock: Mutex::new(()),
        });

        if let Err(e) = inner.initiate() {
            inner.stream.close();
            *inner.state.lock() = WatcherState::Stopped;
            return Err(e);
        }

        *inner.state.lock() = WatcherState::Running;
        let reader_inner = Arc::clone(&inner);
        let reader = thread::Builder::new()
            .name(format!("snapstore-{}", short_id(&inner.params.store_id)))
            .spawn(move || reader_inner.run())
            .map_err(|e| {
                inner.stream.close();
                *inner.state.lock() = WatcherState::Stopped;
                Error::io("spawning watcher thread", e)
            })?;

        info!(
            target: "snapagent::watcher",
            store_id = %inner.params.store_id,
            base_dir = %inner.params.base_dir.display(),
            "Watcher started"
        );

        Ok(SnapStoreWatcher {
            inner,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Store this watcher serves
    pub fn store_id(&self) -> SnapStoreId {
        self.inner.params.store_id
    }

    /// Directory holding the store's extent files
    pub fn base_dir(&self) -> &Path {
        &self.inner.params.base_dir
    }

    /// Current state
    pub fn state(&self) -> WatcherState {
        *self.inner.state.lock()
    }

    /// Whether the watcher still services the store
    pub fn is_running(&self) -> bool {
        self.state() == WatcherState::Running
    }

    /// Create one extent file of `size` bytes and hand it to the kernel
    pub fn allocate_storage(&self, size: u64) -> Result<AllocatedExtent> {
        self.inner.allocate_storage(size)
    }

    /// Close the stream without waiting for the reader thread
    ///
    /// The reader exits after its current message; [`stop`](Self::stop)
    /// waits for that.
    pub fn close(&self) {
        self.inner.stream.close();
    }

    /// Close the stream and wait for the reader thread to exit
    pub fn stop(&self) {
        self.inner.stream.close();
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        *self.inner.state.lock() = WatcherState::Stopped;
        debug!(target: "snapagent::watcher", store_id = %self.store_id(), "Watcher stopped");
    }
}

impl Drop for SnapStoreWatcher {
    fn drop(&mut self) {
        self.inner.stream.close();
    }
}

impl Inner {
    fn initiate(&self) -> Result<()> {
        let p = &self.params;
        fs::create_dir_all(&p.base_dir)
            .map_err(|e| Error::io(format!("creating {}", p.base_dir.display()), e))?;
        let message = OutboundCommand::Initiate {
            store_id: p.store_id,
            empty_limit: p.empty_limit,
            snapshot_device: p.snapshot_device,
            devices: p.devices.clone(),
        };
        self.stream
            .write(&message.encode())
            .map_err(|e| Error::kernel("sending INITIATE", e))
    }

    fn allocate_storage(&self, size: u64) -> Result<AllocatedExtent> {
        let _guard = self.alloc_lock.lock();
        let p = &self.params;
        if *self.state.lock() != WatcherState::Running {
            return Err(Error::Conflict(format!(
                "watcher for snap store {} is not running",
                p.store_id
            )));
        }

        let fs_info = self.directory.filesystem_info(&p.base_dir)?;
        if fs_info.available_bytes < size {
            return Err(Error::Conflict(format!(
                "{} has {} bytes available, {} requested",
                p.base_dir.display(),
                fs_info.available_bytes,
                size
            )));
        }

        let path = p.base_dir.join(Uuid::new_v4().to_string());
        let allocated = self.directory.create_extent_file(&path, size)?;
        match self.hand_over(&path) {
            Ok(()) => {
                debug!(
                    target: "snapagent::watcher",
                    store_id = %p.store_id,
                    path = %path.display(),
                    size = allocated,
                    "Extent handed to kernel"
                );
                Ok(AllocatedExtent {
                    path,
                    size: allocated,
                })
            }
            Err(e) => {
                // extents were never handed over, so the file can go
                if let Err(rm) = fs::remove_file(&path) {
                    warn!(target: "snapagent::watcher", path = %path.display(), error = %rm, "Failed to remove unused extent file");
                }
                Err(e)
            }
        }
    }

    fn hand_over(&self, path: &Path) -> Result<()> {
        let p = &self.params;
        let extents = self.directory.file_extents(path)?;
        if extents.device != p.snapshot_device {
            return Err(Error::InvariantViolation(format!(
                "extent file {} is on device {}, snap store {} expects {}",
                path.display(),
                extents.device,
                p.store_id,
                p.snapshot_device
            )));
        }
        let message = OutboundCommand::NextPortion {
            store_id: p.store_id,
            ranges: extents.ranges,
        };
        self.stream
            .write(&message.encode())
            .map_err(|e| Error::kernel("sending NEXT_PORTION", e))
    }

    fn emit_error(&self, error: Error) {
        self.events.send(WatcherEvent::Error {
            store_id: self.params.store_id,
            error,
        });
    }

    fn run(&self) {
        let store_id = self.params.store_id;
        if let Err(e) = self.read_loop() {
            error!(target: "snapagent::watcher", store_id = %store_id, error = %e, "Watcher exited with error");
        }
        self.stream.close();
        *self.state.lock() = WatcherState::Stopped;
        debug!(target: "snapagent::watcher", store_id = %store_id, "Reader thread exited");
    }

    fn read_loop(&self) -> Result<()> {
        let store_id = self.params.store_id;
        let mut buf = [0u8; INBOUND_BUFFER_SIZE];
        loop {
            let n = match self.stream.read(&mut buf) {
                Ok(n) => n,
                Err(_) if self.stream.is_closed() => return Ok(()),
                Err(KernelError::ChannelClosed) => return Ok(()),
                Err(e) => {
                    let error = Error::kernel("reading snap store stream", e);
                    warn!(target: "snapagent::watcher", store_id = %store_id, error = %error, "Stream read failed");
                    self.emit_error(error);
                    return Ok(());
                }
            };
            if n < 4 {
                warn!(target: "snapagent::watcher", store_id = %store_id, len = n, "Ignoring short message");
                continue;
            }

            let command = match InboundCommand::decode(&buf[..n]) {
                Ok(command) => command,
                Err(e) => {
                    self.emit_error(Error::Protocol(e.to_string()));
                    continue;
                }
            };
            debug!(target: "snapagent::watcher", store_id = %store_id, ?command, "Received");

            match command {
                InboundCommand::Acknowledge { code: 0 } => {}
                InboundCommand::Acknowledge { code } => {
                    let error = Error::kernel(
                        "snap store request",
                        io::Error::from_raw_os_error(code as i32),
                    );
                    error!(target: "snapagent::watcher", store_id = %store_id, code, "Kernel rejected request");
                    self.emit_error(error);
                    return Ok(());
                }
                InboundCommand::HalfFill { fill_level } => {
                    info!(target: "snapagent::watcher", store_id = %store_id, fill_level, "Snap store half full");
                    match self.allocate_storage(self.params.empty_limit) {
                        Ok(extent) => {
                            self.events.send(WatcherEvent::ExtentAdded {
                                store_id,
                                location_id: self.params.location_id.clone(),
                                path: extent.path,
                                size: extent.size,
                            });
                        }
                        Err(e) => self.emit_error(e),
                    }
                }
                InboundCommand::Overflow {
                    error_code,
                    fill_level,
                } => {
                    // the store stays registered; TERMINATE still follows
                    error!(
                        target: "snapagent::watcher",
                        store_id = %store_id,
                        error_code,
                        fill_level,
                        "Snap store overflowed"
                    );
                    self.events.send(WatcherEvent::Overflow {
                        store_id,
                        error_code,
                        fill_level,
                    });
                }
                InboundCommand::Terminate => {
                    self.terminate();
                    return Ok(());
                }
                InboundCommand::Invalid => {
                    warn!(target: "snapagent::watcher", store_id = %store_id, "Kernel reported an invalid request");
                }
                InboundCommand::Unknown(tag) => {
                    warn!(target: "snapagent::watcher", store_id = %store_id, tag, "Ignoring unknown command");
                }
            }
        }
    }

    fn terminate(&self) {
        let p = &self.params;
        *self.state.lock() = WatcherState::Terminating;
        match fs::remove_dir_all(&p.base_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(target: "snapagent::watcher", store_id = %p.store_id, error = %e, "Failed to remove extent files");
            }
        }
        info!(target: "snapagent::watcher", store_id = %p.store_id, "Snap store terminated by kernel");
        self.events.send(WatcherEvent::StoreDeleted {
            store_id: p.store_id,
        });
    }
}

fn short_id(id: &SnapStoreId) -> String {
    id.to_string().chars().take(8).collect()
}
