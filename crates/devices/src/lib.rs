//! Device directory implementations
//!
//! - `SysfsDirectory`: the live system (sysfs, stat, statvfs, FIEMAP)
//! - `testing::StaticDirectory`: tables filled in by tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod sysfs;
pub mod testing;

pub use sysfs::{split_dev, SysfsDirectory};
