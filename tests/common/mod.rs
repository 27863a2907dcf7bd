//! Shared fixtures for the end-to-end suites
//!
//! A `TestHost` is one simulated machine: two tracked-disk candidates, a
//! separate device holding the CoW directory, a simulated kernel module and
//! a static device directory standing in for sysfs and udev.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub use snapagent::devices::testing::StaticDirectory;
pub use snapagent::kernel::testing::{SimulatedKernel, IMAGE_MAJOR};
pub use snapagent::kernel::ControlChannel;
pub use snapagent::{
    AgentConfig, BackupType, DeviceId, DiskRange, Error, FilesystemInfo, MappingConfig,
    Orchestrator, SnapshotDetails, VolumeStatus,
};

pub const D1: DeviceId = DeviceId::new(252, 1);
pub const D2: DeviceId = DeviceId::new(252, 2);
pub const COW_DEVICE: DeviceId = DeviceId::new(8, 2);
pub const BLOCK: u64 = 4096;
pub const DISK_SIZE: u64 = 128 * BLOCK;

// ============================================================================
// TestHost
// ============================================================================

pub struct TestHost {
    pub kernel: SimulatedKernel,
    pub directory: Arc<StaticDirectory>,
    pub cow: PathBuf,
    pub dir: TempDir,
}

impl TestHost {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let cow = dir.path().join("cow");
        fs::create_dir_all(&cow).unwrap();

        let kernel = SimulatedKernel::new();
        kernel.add_device(D1, DISK_SIZE);
        kernel.add_device(D2, DISK_SIZE);

        let directory = Arc::new(StaticDirectory::new());
        directory.add_device(D1, "/dev/sdb1", DISK_SIZE, 512);
        directory.add_device(D2, "/dev/sdc", DISK_SIZE, 4096);
        directory.add_device(COW_DEVICE, "/dev/sda2", 1 << 30, 512);
        directory.add_dynamic_major(IMAGE_MAJOR, "veeamimage");
        directory.add_mount(
            dir.path(),
            COW_DEVICE,
            FilesystemInfo {
                total_bytes: 1 << 30,
                available_bytes: 1 << 29,
                free_bytes: 1 << 29,
            },
        );

        TestHost {
            kernel,
            directory,
            cow,
            dir,
        }
    }

    /// Config that tracks both disks and maps them to the CoW directory
    pub fn config(&self) -> AgentConfig {
        let mappings = ["/dev/sdb1", "/dev/sdc"]
            .iter()
            .map(|device| MappingConfig {
                device: PathBuf::from(device),
                location: self.cow.clone(),
            })
            .collect();
        AgentConfig {
            snap_store_file_size: 64 * 1024,
            device_node_attempts: 3,
            device_node_interval_ms: 1,
            shutdown_timeout_ms: 5_000,
            cow_destinations: vec![self.cow.clone()],
            tracked_devices: vec![PathBuf::from("/dev/sdb1"), PathBuf::from("/dev/sdc")],
            snap_store_mappings: mappings,
            ..AgentConfig::default()
        }
    }

    /// Same as `config` with a file-backed catalog
    pub fn persistent_config(&self) -> AgentConfig {
        AgentConfig {
            catalog_path: Some(self.dir.path().join("state").join("catalog.db")),
            ..self.config()
        }
    }

    /// Build, initialize and start an agent on this host
    pub fn agent(&self, config: AgentConfig) -> Orchestrator {
        let agent = Orchestrator::builder()
            .config(config)
            .kernel(Arc::new(self.kernel.clone()))
            .directory(self.directory.clone())
            .build()
            .unwrap();
        agent.initialize().unwrap();
        agent.start().unwrap();
        agent
    }

    pub fn write(&self, device: DeviceId, first_block: u64, blocks: u64) {
        self.kernel.write(device, first_block * BLOCK, blocks * BLOCK);
    }

    pub fn cow_entries(&self) -> usize {
        fs::read_dir(&self.cow).unwrap().count()
    }
}

pub fn shut_down(agent: Orchestrator) {
    agent.stop();
    assert!(agent.wait());
}

pub fn total_length(ranges: &[DiskRange]) -> u64 {
    ranges.iter().map(|range| range.length).sum()
}

pub fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}
