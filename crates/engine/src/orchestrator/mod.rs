//! Snapshot orchestrator
//!
//! The orchestrator owns the catalog, the kernel channel and the device
//! directory, plus one watcher per live snap store. Lifecycle mutations
//! (snapshot create/delete, snap store creation, tracking changes) run
//! under a single lock because kernel-global snapshot state cannot be
//! interleaved safely. Watcher events are applied by one consumer thread.
//!
//! Operations are split by concern:
//! - `disks`: tracked disks, snap store locations, mappings
//! - `stores`: snap store creation, reports, capacity
//! - `snapshots`: create, delete, changed sectors
//! - `consumer`: the router consumer

mod builder;
mod consumer;
mod disks;
mod snapshots;
mod stores;

pub use builder::OrchestratorBuilder;
pub use disks::LocationReport;
pub use snapshots::SnapshotDetails;
pub use stores::SnapStoreReport;

use parking_lot::Mutex;
use snapagent_core::{
    Catalog, DeviceDirectory, Error, Result, SnapStore, SnapStoreFile, SnapStoreId,
    SnapStoreLocation, TrackedDisk,
};
use snapagent_kernel::ControlChannel;
use snapagent_watcher::{
    channel, AllocatedExtent, EventReceiver, EventSender, SnapStoreWatcher, WatcherParams,
};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;

/// How often the consumer re-checks the shutdown flag while idle
const CONSUMER_POLL: Duration = Duration::from_millis(100);

struct Shared {
    config: AgentConfig,
    catalog: Arc<dyn Catalog>,
    fresh_catalog: bool,
    kernel: Arc<dyn ControlChannel>,
    directory: Arc<dyn DeviceDirectory>,
    // serializes snapshot lifecycle mutations
    lifecycle: Mutex<()>,
    watchers: Mutex<HashMap<SnapStoreId, SnapStoreWatcher>>,
    events: EventSender,
    shutdown: AtomicBool,
}

/// The agent's top-level state machine
pub struct Orchestrator {
    shared: Arc<Shared>,
    receiver: Mutex<Option<EventReceiver>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Start configuring an orchestrator
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    fn assemble(
        config: AgentConfig,
        catalog: Arc<dyn Catalog>,
        fresh_catalog: bool,
        kernel: Arc<dyn ControlChannel>,
        directory: Arc<dyn DeviceDirectory>,
    ) -> Self {
        let (events, receiver) = channel(config.event_queue_capacity);
        Orchestrator {
            shared: Arc::new(Shared {
                config,
                catalog,
                fresh_catalog,
                kernel,
                directory,
                lifecycle: Mutex::new(()),
                watchers: Mutex::new(HashMap::new()),
                events,
                shutdown: AtomicBool::new(false),
            }),
            receiver: Mutex::new(Some(receiver)),
            consumer: Mutex::new(None),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    /// Catalog backing this orchestrator
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.shared.catalog
    }

    /// Bring catalog and kernel in line with the configuration
    ///
    /// On a freshly created catalog the CoW destinations are emptied first,
    /// since files left there belong to stores from a previous boot.
    /// Already registered locations and mappings are left alone. A watcher
    /// is restarted for every snap store the catalog remembers; failures
    /// there are logged, not returned.
    pub fn initialize(&self) -> Result<()> {
        let config = &self.shared.config;
        for dir in &config.cow_destinations {
            if self.shared.fresh_catalog {
                clear_directory(dir)?;
            } else {
                fs::create_dir_all(dir)
                    .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;
            }
            match self.add_snap_store_location(dir) {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    debug!(target: "snapagent::engine", path = %dir.display(), "Location already registered");
                }
                Err(e) => return Err(e),
            }
        }

        for device in &config.tracked_devices {
            self.add_tracked_disk(device)?;
        }

        for mapping in &config.snap_store_mappings {
            let device = self.shared.directory.device_id(&mapping.device)?;
            let disk = self
                .shared
                .catalog
                .tracked_disk_by_device(device)?
                .ok_or_else(|| {
                    Error::NotFound(format!("tracked disk {}", mapping.device.display()))
                })?;
            let location = self
                .shared
                .catalog
                .location_by_path(&mapping.location)?
                .ok_or_else(|| {
                    Error::NotFound(format!("snap store location {}", mapping.location.display()))
                })?;
            match self.create_snap_store_mapping(&disk.tracking_id, &location.tracking_id) {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }

        for store in self.shared.catalog.list_snap_stores()? {
            if let Err(e) = self.restart_watcher(&store) {
                warn!(target: "snapagent::engine", store_id = %store.id, error = %e, "Failed to restart watcher");
            }
        }

        info!(
            target: "snapagent::engine",
            fresh_catalog = self.shared.fresh_catalog,
            watchers = self.shared.watchers.lock().len(),
            "Agent initialized"
        );
        Ok(())
    }

    /// Start the router consumer
    ///
    /// Calling `start` again is a no-op.
    pub fn start(&self) -> Result<()> {
        let receiver = match self.receiver.lock().take() {
            Some(receiver) => receiver,
            None => return Ok(()),
        };
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("snapagent-events".to_string())
            .spawn(move || consumer::run(&shared, receiver))
            .map_err(|e| Error::io("spawning event consumer", e))?;
        *self.consumer.lock() = Some(handle);
        info!(target: "snapagent::engine", "Event consumer started");
        Ok(())
    }

    /// Signal shutdown and stop every watcher
    ///
    /// Idempotent. Snap stores stay in the kernel and the catalog.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        // never started: apply what is queued, then drop the queue so
        // watchers cannot block on it
        self.drain_pending();
        drop(self.receiver.lock().take());
        let watchers: Vec<SnapStoreWatcher> = self
            .shared
            .watchers
            .lock()
            .drain()
            .map(|(_, watcher)| watcher)
            .collect();
        for watcher in &watchers {
            watcher.stop();
        }
        if !watchers.is_empty() {
            info!(target: "snapagent::engine", count = watchers.len(), "Watchers stopped");
        }
    }

    /// Wait for the consumer to exit after [`stop`](Self::stop)
    ///
    /// Returns false if it is still running after the configured shutdown
    /// timeout.
    pub fn wait(&self) -> bool {
        let handle = match self.consumer.lock().take() {
            Some(handle) => handle,
            None => return true,
        };
        let deadline = Instant::now() + self.shared.config.shutdown_timeout();
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(target: "snapagent::engine", "Event consumer did not stop in time");
                *self.consumer.lock() = Some(handle);
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = handle.join();
        true
    }

    /// Ids of stores with a live watcher
    pub fn running_watchers(&self) -> Vec<SnapStoreId> {
        self.shared
            .watchers
            .lock()
            .iter()
            .filter(|(_, watcher)| watcher.is_running())
            .map(|(id, _)| *id)
            .collect()
    }

    fn watcher_params(
        &self,
        store: &SnapStore,
        location: &SnapStoreLocation,
        disk: &TrackedDisk,
    ) -> WatcherParams {
        WatcherParams {
            store_id: store.id,
            location_id: location.tracking_id.clone(),
            base_dir: store.path(location),
            snapshot_device: location.device,
            devices: vec![disk.device],
            empty_limit: self.shared.config.snap_store_file_size,
        }
    }

    fn restart_watcher(&self, store: &SnapStore) -> Result<()> {
        let location = self.shared.catalog.location(&store.location_id)?;
        let disk = self.shared.catalog.tracked_disk(&store.tracked_disk_id)?;
        let watcher = SnapStoreWatcher::start(
            self.watcher_params(store, &location, &disk),
            self.shared.kernel.as_ref(),
            Arc::clone(&self.shared.directory),
            self.shared.events.clone(),
        )?;
        self.shared.watchers.lock().insert(store.id, watcher);
        Ok(())
    }

    /// Stop a store's watcher and forget it
    ///
    /// Before `start`, events the reader thread has queued are applied here
    /// so a reader blocked on a full queue can finish.
    fn retire_watcher(&self, store_id: SnapStoreId) {
        let watcher = self.shared.watchers.lock().remove(&store_id);
        if let Some(watcher) = watcher {
            watcher.close();
            self.drain_pending();
            watcher.stop();
        }
    }

    /// Apply queued events while no consumer thread runs
    fn drain_pending(&self) {
        let receiver = self.receiver.lock();
        if let Some(receiver) = receiver.as_ref() {
            while let Some(event) = receiver.try_recv() {
                if let Err(e) = consumer::apply(&self.shared, event) {
                    warn!(target: "snapagent::engine", error = %e, "Failed to apply queued watcher event");
                }
            }
        }
    }
}

impl Shared {
    /// Record an extent handed to the kernel
    ///
    /// An extent for a store that has already been released is ignored;
    /// its file went away with the store's directory.
    fn record_extent(
        &self,
        store_id: SnapStoreId,
        location_id: &str,
        extent: &AllocatedExtent,
    ) -> Result<()> {
        let tracking_id = extent
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "extent file {} has no file name",
                    extent.path.display()
                ))
            })?;
        let recorded = self.catalog.record_snap_store_file(SnapStoreFile {
            tracking_id,
            snap_store_id: store_id,
            location_id: location_id.to_string(),
            path: extent.path.clone(),
            size: extent.size,
        });
        match recorded {
            Ok(store) => {
                debug!(target: "snapagent::engine", store_id = %store_id, total = store.total_allocated_size, "Extent recorded");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(target: "snapagent::engine", store_id = %store_id, path = %extent.path.display(), "Ignoring extent of released snap store");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a store row together with its file rows
    fn forget_snap_store(&self, store_id: SnapStoreId) -> Result<()> {
        ignore_not_found(self.catalog.delete_snap_store_with_files(store_id))
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Create `dir` if needed and remove everything inside it
fn clear_directory(dir: &Path) -> Result<()> {
    let context = || format!("clearing {}", dir.display());
    fs::create_dir_all(dir).map_err(|e| Error::io(context(), e))?;
    let entries = fs::read_dir(dir).map_err(|e| Error::io(context(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(context(), e))?;
        let path = entry.path();
        let removed = match entry.file_type() {
            Ok(kind) if kind.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(context(), e)),
        }
    }
    debug!(target: "snapagent::engine", path = %dir.display(), "CoW destination cleared");
    Ok(())
}
