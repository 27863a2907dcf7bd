//! Notification router
//!
//! One bounded queue, many watcher producers, one consumer. A full queue
//! blocks the producer; events are never dropped.

use snapagent_core::{Error, SnapStoreId};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;
use tracing::warn;

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

/// Something a watcher observed
#[derive(Debug)]
pub enum WatcherEvent {
    /// A new extent file was handed to the kernel
    ExtentAdded {
        /// Store that grew
        store_id: SnapStoreId,
        /// Location holding the file
        location_id: String,
        /// File path
        path: PathBuf,
        /// File size in bytes
        size: u64,
    },
    /// The kernel discarded the store and its files were removed
    StoreDeleted {
        /// Store that is gone
        store_id: SnapStoreId,
    },
    /// The store ran out of space
    Overflow {
        /// Store that overflowed
        store_id: SnapStoreId,
        /// Kernel error code
        error_code: u32,
        /// Bytes filled
        fill_level: u64,
    },
    /// Anything else that went wrong in a watcher
    Error {
        /// Store the watcher serves
        store_id: SnapStoreId,
        /// What happened
        error: Error,
    },
}

impl WatcherEvent {
    /// Store the event concerns
    pub fn store_id(&self) -> SnapStoreId {
        match self {
            WatcherEvent::ExtentAdded { store_id, .. }
            | WatcherEvent::StoreDeleted { store_id }
            | WatcherEvent::Overflow { store_id, .. }
            | WatcherEvent::Error { store_id, .. } => *store_id,
        }
    }
}

/// Producer half, cloned into every watcher
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: SyncSender<WatcherEvent>,
}

impl EventSender {
    /// Queue an event, blocking while the queue is full
    ///
    /// Returns false when the consumer is gone.
    pub fn send(&self, event: WatcherEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::SendError(event)) => {
                warn!(
                    target: "snapagent::router",
                    store_id = %event.store_id(),
                    "Event consumer gone, dropping event"
                );
                false
            }
        }
    }
}

/// Consumer half, owned by the orchestrator
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<WatcherEvent>,
}

/// Outcome of waiting for an event
#[derive(Debug)]
pub enum Received {
    /// An event arrived
    Event(WatcherEvent),
    /// Nothing arrived in time
    Timeout,
    /// Every sender has been dropped
    Closed,
}

impl EventReceiver {
    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Received {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Received::Event(event),
            Err(RecvTimeoutError::Timeout) => Received::Timeout,
            Err(RecvTimeoutError::Disconnected) => Received::Closed,
        }
    }

    /// Take an event if one is queued
    pub fn try_recv(&self) -> Option<WatcherEvent> {
        self.rx.try_recv().ok()
    }
}

/// Create a router with room for `capacity` queued events
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (EventSender { tx }, EventReceiver { rx })
}
