//! snapagent - host agent for kernel change-block tracking and snapshots
//!
//! The agent bridges a machine's block devices to the veeamsnap kernel
//! module: it tracks disks, takes multi-disk point-in-time snapshots,
//! grows copy-on-write snap stores on demand and reports which byte ranges
//! changed between backups.
//!
//! # Quick Start
//!
//! ```ignore
//! use snapagent::{AgentConfig, Orchestrator};
//!
//! let agent = Orchestrator::builder()
//!     .config(AgentConfig::from_file("/etc/snapagent/snapagent.toml".as_ref())?)
//!     .build()?;
//! agent.initialize()?;
//! agent.start()?;
//!
//! let snapshot = agent.create_snapshot(&["sdb1"])?;
//! let changed = agent.get_changed_sectors(&snapshot.snapshot.id, "sdb1", "", 0)?;
//! agent.delete_snapshot(&snapshot.snapshot.id)?;
//! ```
//!
//! # Architecture
//!
//! All lifecycle operations go through the [`Orchestrator`]. Lower layers
//! (kernel channel, device directory, catalog, watchers) are reachable
//! through their own modules for tests and embedding.

pub use snapagent_core::{
    BlockDeviceInfo, Catalog, DeviceDirectory, DeviceId, Error, FilesystemInfo, GenerationId,
    Result, Snapshot, SnapshotImage, SnapStore, SnapStoreFile, SnapStoreId, SnapStoreLocation,
    SnapStoreMapping, TrackedDisk, VolumeSnapshot, VolumeStatus,
};
pub use snapagent_engine::*;

/// Kernel control channel
pub mod kernel {
    pub use snapagent_kernel::*;
}

/// Device directory implementations
pub mod devices {
    pub use snapagent_devices::*;
}

/// Catalog persistence
pub mod storage {
    pub use snapagent_storage::*;
}

/// Snap store watchers and the event router
pub mod watcher {
    pub use snapagent_watcher::*;
}
