//! End-to-end tests
//!
//! Full agent stack against a simulated host:
//! - backup_cycle: snapshot, changed sectors, delete, repeat
//! - failures: rollback when the kernel misbehaves
//! - restart: agent restarts over a persistent catalog

#[path = "../common/mod.rs"]
mod common;

mod backup_cycle;
mod failures;
mod restart;
