//! Persistent catalog for the snapshot agent
//!
//! - `CatalogStore`: tables behind a lock, optionally backed by one file
//! - `persist`: the atomically replaced catalog file format

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod persist;

pub use catalog::CatalogStore;
pub use persist::{load_catalog, write_catalog, CATALOG_MAGIC, CATALOG_VERSION};
