//! Snap store watchers and their notification router
//!
//! - `watcher`: one thread per snap store speaking the stream protocol
//! - `router`: the bounded queue carrying watcher events to the orchestrator

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod router;
pub mod watcher;

pub use router::{channel, EventReceiver, EventSender, Received, WatcherEvent, DEFAULT_QUEUE_CAPACITY};
pub use watcher::{AllocatedExtent, SnapStoreWatcher, WatcherParams, WatcherState};
