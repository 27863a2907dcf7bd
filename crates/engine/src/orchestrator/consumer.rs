//! Router consumer
//!
//! Applies watcher events to the catalog. Runs on its own thread until the
//! shutdown flag is set and the queue has gone quiet.

use snapagent_core::{Result, SnapStoreId, VolumeStatus};
use snapagent_watcher::{AllocatedExtent, EventReceiver, Received, WatcherEvent};
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

use super::{Shared, CONSUMER_POLL};

pub(super) fn run(shared: &Shared, receiver: EventReceiver) {
    loop {
        match receiver.recv_timeout(CONSUMER_POLL) {
            Received::Event(event) => {
                if let Err(e) = apply(shared, event) {
                    error!(target: "snapagent::engine::events", error = %e, "Failed to apply watcher event");
                }
            }
            Received::Timeout => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
            Received::Closed => break,
        }
    }
    debug!(target: "snapagent::engine::events", "Event consumer exited");
}

pub(super) fn apply(shared: &Shared, event: WatcherEvent) -> Result<()> {
    match event {
        WatcherEvent::ExtentAdded {
            store_id,
            location_id,
            path,
            size,
        } => {
            debug!(target: "snapagent::engine::events", store_id = %store_id, path = %path.display(), size, "Extent added");
            shared.record_extent(store_id, &location_id, &AllocatedExtent { path, size })
        }
        WatcherEvent::StoreDeleted { store_id } => {
            info!(target: "snapagent::engine::events", store_id = %store_id, "Snap store deleted by kernel");
            shared.forget_snap_store(store_id)?;
            // the reader thread has already exited; dropping closes its handle
            let watcher = shared.watchers.lock().remove(&store_id);
            drop(watcher);
            Ok(())
        }
        WatcherEvent::Overflow {
            store_id,
            error_code,
            fill_level,
        } => {
            error!(
                target: "snapagent::engine::events",
                store_id = %store_id,
                error_code,
                fill_level,
                "Snap store overflowed"
            );
            mark_overflowed(shared, store_id)
        }
        WatcherEvent::Error { store_id, error } => {
            warn!(target: "snapagent::engine::events", store_id = %store_id, error = %error, "Watcher reported an error");
            Ok(())
        }
    }
}

fn mark_overflowed(shared: &Shared, store_id: SnapStoreId) -> Result<()> {
    for mut volume in shared.catalog.volume_snapshots_for_store(store_id)? {
        if volume.status == VolumeStatus::Overflow {
            continue;
        }
        volume.status = VolumeStatus::Overflow;
        warn!(
            target: "snapagent::engine::events",
            snapshot_id = %volume.snapshot_id,
            disk = %volume.tracked_disk_id,
            "Volume snapshot marked as overflowed"
        );
        shared.catalog.update_volume_snapshot(volume)?;
    }
    Ok(())
}
