//! Snapshot orchestration for the host agent
//!
//! This crate ties the lower layers together:
//! - Orchestrator: snapshot lifecycle, snap stores, tracked disks, locations
//! - Config: `snapagent.toml`
//! - Increments: changed-range computation from CBT bitmaps
//!
//! The orchestrator is the only component that mutates kernel snapshot
//! state and the catalog's lifecycle rows; watchers report back to it
//! through the event router.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod increments;
pub mod orchestrator;

pub use config::{AgentConfig, MappingConfig, CONFIG_FILE_NAME};
pub use increments::{fetch_increments, BackupType, ChangedSectors, DiskRange};
pub use orchestrator::{
    LocationReport, Orchestrator, OrchestratorBuilder, SnapStoreReport, SnapshotDetails,
};
