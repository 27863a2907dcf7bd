//! Core types and traits for the snapshot agent
//!
//! This crate defines the vocabulary shared by every layer:
//! - DeviceId, SnapStoreId, GenerationId, ExtentRange: identities and geometry
//! - Model: catalog entities (tracked disks, locations, snap stores, snapshots)
//! - Error: the error taxonomy returned by every public operation
//! - Traits: the `Catalog` and `DeviceDirectory` collaborators

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod model;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use model::{
    tracking_id_for, Snapshot, SnapshotImage, SnapStore, SnapStoreFile, SnapStoreLocation,
    SnapStoreMapping, TrackedDisk, VolumeSnapshot, VolumeStatus,
};
pub use traits::{Catalog, DeviceDirectory};
pub use types::{
    BlockDeviceInfo, DeviceId, ExtentRange, FileExtents, FilesystemInfo, GenerationId,
    ParseDeviceIdError, SnapStoreId,
};
