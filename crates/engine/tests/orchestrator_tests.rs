//! Orchestrator tests against the simulated kernel and a static directory

use snapagent_core::{DeviceId, Error, FilesystemInfo, GenerationId, VolumeStatus};
use snapagent_devices::testing::StaticDirectory;
use snapagent_engine::{AgentConfig, BackupType, DiskRange, MappingConfig, Orchestrator};
use snapagent_kernel::testing::{SimulatedKernel, IMAGE_MAJOR};
use snapagent_kernel::ControlChannel;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const D1: DeviceId = DeviceId::new(252, 1);
const COW_DEVICE: DeviceId = DeviceId::new(8, 2);
const BLOCK: u64 = 4096;
const DISK_SIZE: u64 = 64 * BLOCK;
const FILE_SIZE: u64 = 64 * 1024;

struct Fixture {
    agent: Orchestrator,
    kernel: SimulatedKernel,
    directory: Arc<StaticDirectory>,
    cow: PathBuf,
    tmp: TempDir,
}

fn test_config() -> AgentConfig {
    AgentConfig {
        snap_store_file_size: FILE_SIZE,
        device_node_attempts: 3,
        device_node_interval_ms: 1,
        shutdown_timeout_ms: 5_000,
        ..AgentConfig::default()
    }
}

fn fs_info() -> FilesystemInfo {
    FilesystemInfo {
        total_bytes: 1 << 30,
        available_bytes: 1 << 29,
        free_bytes: 1 << 29,
    }
}

/// Everything wired up, but no event consumer running
fn idle_fixture_with(config: AgentConfig) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let cow = tmp.path().join("cow");
    fs::create_dir_all(&cow).unwrap();

    let kernel = SimulatedKernel::new();
    kernel.add_device(D1, DISK_SIZE);

    let directory = Arc::new(StaticDirectory::new());
    directory.add_device(D1, "/dev/sdb1", DISK_SIZE, 512);
    directory.add_device(COW_DEVICE, "/dev/sda2", 1 << 30, 512);
    directory.add_dynamic_major(IMAGE_MAJOR, "veeamimage");
    directory.add_mount(tmp.path(), COW_DEVICE, fs_info());

    let agent = Orchestrator::builder()
        .config(config)
        .kernel(Arc::new(kernel.clone()))
        .directory(directory.clone())
        .build()
        .unwrap();

    Fixture {
        agent,
        kernel,
        directory,
        cow,
        tmp,
    }
}

fn fixture_with(config: AgentConfig) -> Fixture {
    let f = idle_fixture_with(config);
    f.agent.start().unwrap();
    f
}

fn fixture() -> Fixture {
    fixture_with(test_config())
}

/// Disk sdb1 tracked and mapped to the `cow` directory
fn mapped_fixture() -> Fixture {
    map_cow(fixture())
}

fn map_cow(f: Fixture) -> Fixture {
    f.agent.add_tracked_disk("/dev/sdb1").unwrap();
    let location = f.agent.add_snap_store_location(&f.cow).unwrap();
    f.agent
        .create_snap_store_mapping("sdb1", &location.tracking_id)
        .unwrap();
    f
}

/// Id of the location registered for the `cow` directory
fn cow_id(f: &Fixture) -> String {
    f.agent
        .catalog()
        .location_by_path(&f.cow)
        .unwrap()
        .expect("cow is registered")
        .tracking_id
}

fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

fn assert_nothing_left(f: &Fixture) {
    let catalog = f.agent.catalog();
    assert!(catalog.list_snapshots().unwrap().is_empty());
    assert!(catalog.list_snap_stores().unwrap().is_empty());
    for location in catalog.list_locations().unwrap() {
        assert!(catalog
            .files_for_location(&location.tracking_id)
            .unwrap()
            .is_empty());
    }
    assert!(f.kernel.snapshot_ids().is_empty());
    assert!(f.kernel.snap_store_ids().is_empty());
}

// ============================================================================
// Tracked disks
// ============================================================================

mod tracked_disks {
    use super::*;

    #[test]
    fn test_add_tracked_disk_tracks_in_kernel() {
        let f = fixture();
        let disk = f.agent.add_tracked_disk("/dev/sdb1").unwrap();
        assert_eq!(disk.tracking_id, "sdb1");
        assert_eq!(disk.device, D1);
        assert_eq!(disk.sector_size, 512);
        assert!(f.kernel.is_tracked(D1));
    }

    #[test]
    fn test_add_tracked_disk_is_idempotent() {
        let f = fixture();
        let first = f.agent.add_tracked_disk("/dev/sdb1").unwrap();
        let second = f.agent.add_tracked_disk("/dev/sdb1").unwrap();
        assert_eq!(first, second);
        assert_eq!(f.agent.list_tracked_disks().unwrap().len(), 1);
    }

    #[test]
    fn test_disk_already_tracked_by_kernel_is_not_added_again() {
        let f = fixture();
        f.kernel.add_tracking(D1).unwrap();
        f.kernel.fail_next("TRACKING_ADD", 5);
        f.agent.add_tracked_disk("/dev/sdb1").unwrap();
        assert!(f.kernel.is_tracked(D1));
    }

    #[test]
    fn test_kernel_refusal_leaves_no_row() {
        let f = fixture();
        f.kernel.fail_next("TRACKING_ADD", 5);
        let err = f.agent.add_tracked_disk("/dev/sdb1").unwrap_err();
        assert!(matches!(err, Error::Kernel { .. }));
        assert!(f.agent.list_tracked_disks().unwrap().is_empty());
    }

    #[test]
    fn test_get_tracked_disk() {
        let f = fixture();
        f.agent.add_tracked_disk("/dev/sdb1").unwrap();
        assert_eq!(f.agent.get_tracked_disk("sdb1").unwrap().device, D1);
        assert!(matches!(
            f.agent.get_tracked_disk("").unwrap_err(),
            Error::BadRequest(_)
        ));
        assert!(f.agent.get_tracked_disk("sdz").unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_tracked_disk_refused_while_mapped() {
        let f = mapped_fixture();
        assert!(f.agent.remove_tracked_disk("sdb1").unwrap_err().is_conflict());

        f.agent.delete_snap_store_mapping("sdb1").unwrap();
        f.agent.remove_tracked_disk("sdb1").unwrap();
        assert!(!f.kernel.is_tracked(D1));
        assert!(f.agent.list_tracked_disks().unwrap().is_empty());
    }

    #[test]
    fn test_remove_tracked_disk_refused_while_snapshotted() {
        let f = mapped_fixture();
        f.agent.create_snapshot(&["sdb1"]).unwrap();
        assert!(f.agent.remove_tracked_disk("sdb1").unwrap_err().is_conflict());
    }

    #[test]
    fn test_device_hosting_location_cannot_be_tracked() {
        let f = fixture();
        f.agent.add_snap_store_location(&f.cow).unwrap();
        assert!(f
            .agent
            .add_tracked_disk("/dev/sda2")
            .unwrap_err()
            .is_conflict());
    }
}

// ============================================================================
// Locations and mappings
// ============================================================================

mod locations {
    use super::*;

    #[test]
    fn test_add_location_records_backing_device() {
        let f = fixture();
        let location = f.agent.add_snap_store_location(&f.cow).unwrap();
        assert_eq!(location.path, f.cow);
        assert_eq!(cow_id(&f), location.tracking_id);
        assert_eq!(location.device, COW_DEVICE);
        assert_eq!(location.device_path, PathBuf::from("/dev/sda2"));
        assert_eq!(location.total_capacity, 1 << 30);
        assert!(location.enabled);
    }

    #[test]
    fn test_duplicate_location_conflicts() {
        let f = fixture();
        f.agent.add_snap_store_location(&f.cow).unwrap();
        assert!(f
            .agent
            .add_snap_store_location(&f.cow)
            .unwrap_err()
            .is_conflict());
    }

    #[test]
    fn test_locations_sharing_a_directory_name_are_distinct() {
        let f = fixture();
        let first = f.tmp.path().join("a").join("snapstore");
        let second = f.tmp.path().join("b").join("snapstore");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();

        let a = f.agent.add_snap_store_location(&first).unwrap();
        let b = f.agent.add_snap_store_location(&second).unwrap();
        assert_ne!(a.tracking_id, b.tracking_id);
        let report = f.agent.get_snap_store_location(&a.tracking_id).unwrap();
        assert_eq!(report.location.path, first);
        let report = f.agent.get_snap_store_location(&b.tracking_id).unwrap();
        assert_eq!(report.location.path, second);
        assert_eq!(f.agent.list_snap_store_locations().unwrap().len(), 2);

        f.agent.add_tracked_disk("/dev/sdb1").unwrap();
        let mapping = f
            .agent
            .create_snap_store_mapping("sdb1", &b.tracking_id)
            .unwrap();
        assert_eq!(mapping.location_id, b.tracking_id);
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let store_id = created.volumes[0].snap_store_id;
        assert!(second.join(store_id.to_string()).is_dir());
        assert!(!first.join(store_id.to_string()).exists());
    }

    #[test]
    fn test_location_on_tracked_disk_conflicts() {
        let f = fixture();
        f.agent.add_tracked_disk("/dev/sdb1").unwrap();
        let on_disk = f.tmp.path().join("on-sdb1");
        f.directory.add_mount(&on_disk, D1, fs_info());
        assert!(f
            .agent
            .add_snap_store_location(&on_disk)
            .unwrap_err()
            .is_conflict());
    }

    #[test]
    fn test_location_report_counts_extent_files() {
        let f = mapped_fixture();
        let cow = cow_id(&f);
        let before = f.agent.get_snap_store_location(&cow).unwrap();
        assert_eq!(before.allocated_bytes, 0);
        assert_eq!(before.available_bytes, 1 << 29);

        f.agent.create_snapshot(&["sdb1"]).unwrap();
        let after = f.agent.get_snap_store_location(&cow).unwrap();
        assert_eq!(after.allocated_bytes, DISK_SIZE / 100 * 20);
        assert_eq!(f.agent.list_snap_store_locations().unwrap(), vec![after]);
    }

    #[test]
    fn test_delete_location_refused_while_mapped() {
        let f = mapped_fixture();
        let cow = cow_id(&f);
        assert!(f
            .agent
            .delete_snap_store_location(&cow)
            .unwrap_err()
            .is_conflict());
        f.agent.delete_snap_store_mapping("sdb1").unwrap();
        f.agent.delete_snap_store_location(&cow).unwrap();
        assert!(f
            .agent
            .get_snap_store_location(&cow)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_mapping_rules() {
        let f = fixture();
        f.agent.add_tracked_disk("/dev/sdb1").unwrap();
        let cow = f.agent.add_snap_store_location(&f.cow).unwrap().tracking_id;

        assert!(f
            .agent
            .create_snap_store_mapping("sdz", &cow)
            .unwrap_err()
            .is_not_found());
        assert!(f
            .agent
            .create_snap_store_mapping("sdb1", "nowhere")
            .unwrap_err()
            .is_not_found());

        let mapping = f.agent.create_snap_store_mapping("sdb1", &cow).unwrap();
        assert_eq!(mapping.tracked_disk_id, "sdb1");
        assert!(f
            .agent
            .create_snap_store_mapping("sdb1", &cow)
            .unwrap_err()
            .is_conflict());
        assert_eq!(f.agent.list_snap_store_mappings().unwrap(), vec![mapping]);
    }

    #[test]
    fn test_mapping_delete_refused_while_store_exists() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        assert!(f
            .agent
            .delete_snap_store_mapping("sdb1")
            .unwrap_err()
            .is_conflict());

        f.agent.delete_snapshot(&created.snapshot.id).unwrap();
        f.agent.delete_snap_store_mapping("sdb1").unwrap();
    }
}

// ============================================================================
// Snapshot lifecycle
// ============================================================================

mod snapshots {
    use super::*;

    #[test]
    fn test_create_snapshot_persists_all_rows() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();

        assert_eq!(created.volumes.len(), 1);
        let volume = &created.volumes[0];
        assert_eq!(volume.snapshot_number, 1);
        assert_eq!(volume.tracked_disk_id, "sdb1");
        assert_eq!(volume.status, VolumeStatus::Healthy);
        assert_eq!(volume.bitmap.len(), 64);

        let catalog = f.agent.catalog();
        let image = catalog.snapshot_image(&volume.snapshot_image_id).unwrap();
        assert_eq!(image.device, DeviceId::new(IMAGE_MAJOR, 0));
        assert_eq!(image.device_path, PathBuf::from("/dev/veeamimage0"));

        let store = catalog.snap_store(volume.snap_store_id).unwrap();
        assert_eq!(store.total_allocated_size, DISK_SIZE / 100 * 20);
        assert_eq!(f.kernel.snap_store_device(&store.id), Some(COW_DEVICE));
        assert_eq!(f.kernel.snap_store_extents(&store.id).len(), 1);
        assert_eq!(f.agent.running_watchers(), vec![store.id]);

        assert_eq!(f.agent.get_snapshot(&created.snapshot.id).unwrap(), created);
        assert_eq!(f.agent.list_snapshots().unwrap(), vec![created.snapshot.clone()]);
    }

    #[test]
    fn test_second_snapshot_of_same_disk_conflicts() {
        let f = mapped_fixture();
        f.agent.create_snapshot(&["sdb1"]).unwrap();
        assert!(f.agent.create_snapshot(&["sdb1"]).unwrap_err().is_conflict());
        assert_eq!(f.kernel.snapshot_ids().len(), 1);
    }

    #[test]
    fn test_concurrent_creates_admit_one() {
        let f = Arc::new(mapped_fixture());
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let f = Arc::clone(&f);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    f.agent.create_snapshot(&["sdb1"])
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.is_conflict()));
    }

    #[test]
    fn test_create_snapshot_input_validation() {
        let f = mapped_fixture();
        let none: [&str; 0] = [];
        assert!(matches!(
            f.agent.create_snapshot(&none).unwrap_err(),
            Error::BadRequest(_)
        ));
        assert!(matches!(
            f.agent.create_snapshot(&["sdb1", "sdb1"]).unwrap_err(),
            Error::BadRequest(_)
        ));
        assert!(f.agent.create_snapshot(&["sdz"]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_unmapped_disk_cannot_be_snapshotted() {
        let f = fixture();
        f.agent.add_tracked_disk("/dev/sdb1").unwrap();
        assert!(f.agent.create_snapshot(&["sdb1"]).unwrap_err().is_not_found());
        assert_nothing_left(&f);
    }

    #[test]
    fn test_delete_snapshot_releases_everything() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let store_id = created.volumes[0].snap_store_id;
        let base_dir = f.cow.join(store_id.to_string());
        assert!(base_dir.is_dir());

        f.agent.delete_snapshot(&created.snapshot.id).unwrap();

        assert_nothing_left(&f);
        let catalog = f.agent.catalog();
        assert!(catalog
            .volume_snapshot(&created.volumes[0].tracking_id)
            .unwrap_err()
            .is_not_found());
        assert!(catalog
            .snapshot_image(&created.volumes[0].snapshot_image_id)
            .unwrap_err()
            .is_not_found());
        assert!(!base_dir.exists());
        assert!(f.agent.running_watchers().is_empty());
    }

    #[test]
    fn test_delete_snapshot_is_idempotent() {
        let f = mapped_fixture();
        f.agent.delete_snapshot("12345").unwrap();

        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        f.agent.delete_snapshot(&created.snapshot.id).unwrap();
        f.agent.delete_snapshot(&created.snapshot.id).unwrap();
    }

    #[test]
    fn test_delete_tolerates_kernel_snapshot_already_gone() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        f.kernel
            .delete_snapshot(created.snapshot.kernel_snapshot_id)
            .unwrap();
        f.agent.delete_snapshot(&created.snapshot.id).unwrap();
        assert_nothing_left(&f);
    }

    #[test]
    fn test_failed_kernel_destroy_can_be_retried() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        f.kernel.fail_next("SNAPSHOT_DESTROY", 16);
        assert!(matches!(
            f.agent.delete_snapshot(&created.snapshot.id).unwrap_err(),
            Error::Kernel { .. }
        ));
        assert_eq!(f.agent.list_snapshots().unwrap().len(), 1);

        f.agent.delete_snapshot(&created.snapshot.id).unwrap();
        assert_nothing_left(&f);
    }

    #[test]
    fn test_failed_store_release_keeps_snapshot_whole() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        f.kernel.fail_next("SNAPSTORE_CLEANUP", 16);
        assert!(matches!(
            f.agent.delete_snapshot(&created.snapshot.id).unwrap_err(),
            Error::Kernel { .. }
        ));

        let details = f.agent.get_snapshot(&created.snapshot.id).unwrap();
        assert_eq!(details.volumes, created.volumes);
        let catalog = f.agent.catalog();
        assert!(catalog
            .snapshot_image(&created.volumes[0].snapshot_image_id)
            .is_ok());

        f.agent.delete_snapshot(&created.snapshot.id).unwrap();
        assert_nothing_left(&f);
        assert!(catalog
            .volume_snapshot(&created.volumes[0].tracking_id)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_find_volume_snapshot() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let id = &created.snapshot.id;
        assert_eq!(
            f.agent.find_volume_snapshot(id, "sdb1").unwrap(),
            created.volumes[0]
        );
        assert!(f
            .agent
            .find_volume_snapshot(id, "sdz")
            .unwrap_err()
            .is_not_found());
        assert!(f
            .agent
            .find_volume_snapshot("999", "sdb1")
            .unwrap_err()
            .is_not_found());
    }
}

// ============================================================================
// Compensation
// ============================================================================

mod compensation {
    use super::*;

    fn assert_rolled_back(f: &Fixture, err: &Error) {
        assert!(err.is_invariant_violation(), "unexpected error: {}", err);
        assert_nothing_left(f);
        assert!(f.agent.running_watchers().is_empty());
    }

    #[test]
    fn test_snap_number_not_advanced_rolls_back() {
        let f = mapped_fixture();
        f.kernel.set_snapshot_step(0);
        let err = f.agent.create_snapshot(&["sdb1"]).unwrap_err();
        assert_rolled_back(&f, &err);
    }

    #[test]
    fn test_snap_number_advanced_twice_rolls_back() {
        let f = mapped_fixture();
        f.kernel.set_snapshot_step(2);
        let err = f.agent.create_snapshot(&["sdb1"]).unwrap_err();
        assert_rolled_back(&f, &err);
    }

    #[test]
    fn test_agent_recovers_after_racing_snapshot() {
        let f = mapped_fixture();
        f.kernel.set_snapshot_step(2);
        f.agent.create_snapshot(&["sdb1"]).unwrap_err();

        f.kernel.set_snapshot_step(1);
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        assert_eq!(created.volumes[0].snapshot_number, 3);
    }

    #[test]
    fn test_missing_device_node_rolls_back() {
        let f = mapped_fixture();
        f.directory.delay_device_nodes(10);
        let err = f.agent.create_snapshot(&["sdb1"]).unwrap_err();
        assert!(matches!(err, Error::Device(_)));
        assert_nothing_left(&f);
    }

    #[test]
    fn test_device_node_appearing_late_is_found() {
        let f = mapped_fixture();
        f.directory.delay_device_nodes(2);
        f.agent.create_snapshot(&["sdb1"]).unwrap();
    }

    #[test]
    fn test_kernel_create_failure_releases_new_store() {
        let f = mapped_fixture();
        f.kernel.fail_next("SNAPSHOT_CREATE", 16);
        let err = f.agent.create_snapshot(&["sdb1"]).unwrap_err();
        assert!(matches!(err, Error::Kernel { .. }));
        assert_nothing_left(&f);
    }

    #[test]
    fn test_bitmap_read_failure_rolls_back() {
        let f = mapped_fixture();
        f.kernel.fail_next("TRACKING_READ_CBT_BITMAP", 5);
        let err = f.agent.create_snapshot(&["sdb1"]).unwrap_err();
        assert!(matches!(err, Error::Kernel { .. }));
        assert_nothing_left(&f);
    }

    #[test]
    fn test_extent_on_wrong_device_aborts_store_creation() {
        let f = mapped_fixture();
        f.directory.report_extents_on(Some(DeviceId::new(9, 9)));
        let err = f.agent.create_snapshot(&["sdb1"]).unwrap_err();
        assert!(err.is_invariant_violation());
        assert_nothing_left(&f);
        assert_eq!(fs::read_dir(&f.cow).unwrap().count(), 0);
    }

    #[test]
    fn test_location_without_block_device_is_rejected() {
        let f = fixture();
        f.agent.add_tracked_disk("/dev/sdb1").unwrap();
        let ram = f.tmp.path().join("ram");
        f.directory.add_mount(&ram, DeviceId::unset(), fs_info());
        assert!(matches!(
            f.agent.add_snap_store_location(&ram).unwrap_err(),
            Error::BadRequest(_) | Error::NotFound(_)
        ));
    }
}

// ============================================================================
// Changed sectors
// ============================================================================

mod changed_sectors {
    use super::*;

    #[test]
    fn test_first_backup_is_full() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let changed = f
            .agent
            .get_changed_sectors(&created.snapshot.id, "sdb1", "", 0)
            .unwrap();
        assert_eq!(changed.backup_type, BackupType::Full);
        assert_eq!(changed.block_size, BLOCK as u32);
        assert_eq!(
            changed.ranges,
            vec![DiskRange {
                offset: 0,
                length: DISK_SIZE
            }]
        );
        assert_eq!(changed.disk_id, "sdb1");
        assert_eq!(changed.snapshot_id, created.snapshot.id);
    }

    #[test]
    fn test_next_backup_is_incremental() {
        let f = mapped_fixture();
        f.kernel.write(D1, 0, 2 * BLOCK);
        let first = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let previous = first.volumes[0].clone();
        f.agent.delete_snapshot(&first.snapshot.id).unwrap();

        f.kernel.write(D1, 10 * BLOCK, BLOCK);
        f.kernel.write(D1, 20 * BLOCK, 3 * BLOCK);
        let second = f.agent.create_snapshot(&["sdb1"]).unwrap();
        assert_eq!(second.volumes[0].snapshot_number, previous.snapshot_number + 1);

        let changed = f
            .agent
            .get_changed_sectors(
                &second.snapshot.id,
                "sdb1",
                &previous.generation_id.to_string(),
                previous.snapshot_number,
            )
            .unwrap();
        assert_eq!(changed.backup_type, BackupType::Incremental);
        assert_eq!(
            changed.ranges,
            vec![
                DiskRange {
                    offset: 10 * BLOCK,
                    length: BLOCK
                },
                DiskRange {
                    offset: 20 * BLOCK,
                    length: 3 * BLOCK
                },
            ]
        );
    }

    #[test]
    fn test_changed_generation_forces_full() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let changed = f
            .agent
            .get_changed_sectors(&created.snapshot.id, "sdb1", &GenerationId::new().to_string(), 1)
            .unwrap();
        assert_eq!(changed.backup_type, BackupType::Full);
        assert_eq!(changed.ranges.len(), 1);
    }

    #[test]
    fn test_malformed_generation_is_bad_request() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        assert!(matches!(
            f.agent
                .get_changed_sectors(&created.snapshot.id, "sdb1", "not-a-uuid", 1)
                .unwrap_err(),
            Error::BadRequest(_)
        ));
    }

    #[test]
    fn test_unknown_snapshot_or_disk_is_not_found() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        assert!(f
            .agent
            .get_changed_sectors("777", "sdb1", "", 0)
            .unwrap_err()
            .is_not_found());
        assert!(f
            .agent
            .get_changed_sectors(&created.snapshot.id, "sdz", "", 0)
            .unwrap_err()
            .is_not_found());
    }
}

// ============================================================================
// Watcher events
// ============================================================================

mod events {
    use super::*;

    #[test]
    fn test_halffill_adds_an_extent() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let store_id = created.volumes[0].snap_store_id;
        let initial = DISK_SIZE / 100 * 20;

        f.kernel.push_halffill(&store_id, initial / 2);
        let catalog = Arc::clone(f.agent.catalog());
        eventually("second extent file", || {
            catalog.files_for_store(store_id).unwrap().len() == 2
        });
        eventually("store size updated", || {
            catalog.snap_store(store_id).unwrap().total_allocated_size == initial + FILE_SIZE
        });
        assert_eq!(f.kernel.snap_store_extents(&store_id).len(), 2);
    }

    #[test]
    fn test_overflow_marks_volume_snapshots() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let volume_id = created.volumes[0].tracking_id.clone();
        let store_id = created.volumes[0].snap_store_id;

        f.kernel.push_overflow(&store_id, 28, 1 << 20);
        let catalog = Arc::clone(f.agent.catalog());
        eventually("volume marked overflowed", || {
            catalog.volume_snapshot(&volume_id).unwrap().status == VolumeStatus::Overflow
        });

        let err = f
            .agent
            .get_changed_sectors(&created.snapshot.id, "sdb1", "", 0)
            .unwrap_err();
        assert!(err.is_overflow());

        // an overflowed snapshot can still be deleted
        f.agent.delete_snapshot(&created.snapshot.id).unwrap();
        assert_nothing_left(&f);
    }

    #[test]
    fn test_extent_queued_before_release_leaves_no_rows() {
        let f = map_cow(idle_fixture_with(test_config()));
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let store_id = created.volumes[0].snap_store_id;

        f.kernel.push_halffill(&store_id, FILE_SIZE);
        eventually("second extent handed over", || {
            f.kernel.snap_store_extents(&store_id).len() == 2
        });
        f.agent.delete_snapshot(&created.snapshot.id).unwrap();
        f.agent.start().unwrap();

        let catalog = f.agent.catalog();
        assert!(catalog.snap_store(store_id).unwrap_err().is_not_found());
        assert!(catalog.files_for_store(store_id).unwrap().is_empty());
        assert_nothing_left(&f);
    }

    #[test]
    fn test_release_with_full_queue_and_no_consumer() {
        let config = AgentConfig {
            event_queue_capacity: 1,
            ..test_config()
        };
        let f = Arc::new(map_cow(idle_fixture_with(config)));
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let store_id = created.volumes[0].snap_store_id;

        // the first extent fills the queue, the second blocks the reader
        f.kernel.push_halffill(&store_id, FILE_SIZE);
        f.kernel.push_halffill(&store_id, 2 * FILE_SIZE);
        eventually("both extents handed over", || {
            f.kernel.snap_store_extents(&store_id).len() == 3
        });

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let agent = Arc::clone(&f);
        let id = created.snapshot.id.clone();
        thread::spawn(move || {
            let _ = done_tx.send(agent.agent.delete_snapshot(&id));
        });
        let result = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("delete_snapshot finished");
        result.unwrap();

        assert!(f.agent.running_watchers().is_empty());
        assert_nothing_left(&f);
    }

    #[test]
    fn test_terminate_forgets_store() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let store_id = created.volumes[0].snap_store_id;
        let base_dir = f.cow.join(store_id.to_string());

        f.kernel.push_terminate(&store_id);
        let catalog = Arc::clone(f.agent.catalog());
        eventually("store row removed", || {
            catalog.snap_store(store_id).unwrap_err().is_not_found()
        });
        assert!(catalog.files_for_store(store_id).unwrap().is_empty());
        eventually("watcher gone", || f.agent.running_watchers().is_empty());
        assert!(!base_dir.exists());
    }
}

// ============================================================================
// Snap store reports and capacity
// ============================================================================

mod snap_stores {
    use super::*;

    #[test]
    fn test_report_sizes() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let store_id = created.volumes[0].snap_store_id;
        f.kernel.set_filled(&store_id, 3 * BLOCK);

        let report = f.agent.get_snap_store(store_id).unwrap();
        assert_eq!(report.allocated_bytes, DISK_SIZE / 100 * 20);
        assert_eq!(report.used_bytes, 3 * BLOCK);
        assert!(report.watcher_running);
        assert_eq!(f.agent.list_snap_stores().unwrap(), vec![report]);

        // reading the fill level must not release a store in use
        assert_eq!(f.kernel.snap_store_ids(), vec![store_id]);
    }

    #[test]
    fn test_add_capacity() {
        let f = mapped_fixture();
        let created = f.agent.create_snapshot(&["sdb1"]).unwrap();
        let store_id = created.volumes[0].snap_store_id;

        assert!(matches!(
            f.agent.add_snap_store_capacity(store_id, 0).unwrap_err(),
            Error::BadRequest(_)
        ));
        assert!(f
            .agent
            .add_snap_store_capacity(store_id, 1 << 40)
            .unwrap_err()
            .is_conflict());

        let extent = f.agent.add_snap_store_capacity(store_id, 8 * BLOCK).unwrap();
        assert_eq!(extent.size, 8 * BLOCK);
        assert!(extent.path.starts_with(f.cow.join(store_id.to_string())));
        let report = f.agent.get_snap_store(store_id).unwrap();
        assert_eq!(report.allocated_bytes, DISK_SIZE / 100 * 20 + 8 * BLOCK);
    }

    #[test]
    fn test_unknown_store_is_not_found() {
        let f = mapped_fixture();
        let id = snapagent_core::SnapStoreId::new();
        assert!(f.agent.get_snap_store(id).unwrap_err().is_not_found());
        assert!(f
            .agent
            .add_snap_store_capacity(id, BLOCK)
            .unwrap_err()
            .is_not_found());
    }
}

// ============================================================================
// Start-up and shutdown
// ============================================================================

mod lifecycle {
    use super::*;

    fn configured(cow: &Path) -> AgentConfig {
        AgentConfig {
            cow_destinations: vec![cow.to_path_buf()],
            tracked_devices: vec![PathBuf::from("/dev/sdb1")],
            snap_store_mappings: vec![MappingConfig {
                device: PathBuf::from("/dev/sdb1"),
                location: cow.to_path_buf(),
            }],
            ..test_config()
        }
    }

    #[test]
    fn test_initialize_applies_config() {
        let f = fixture();
        let config = configured(&f.cow);
        fs::write(f.cow.join("stale-extent"), b"old").unwrap();

        let agent = Orchestrator::builder()
            .config(config)
            .kernel(Arc::new(f.kernel.clone()))
            .directory(f.directory.clone())
            .build()
            .unwrap();
        agent.initialize().unwrap();

        assert!(!f.cow.join("stale-extent").exists());
        assert_eq!(agent.list_tracked_disks().unwrap().len(), 1);
        assert!(f.kernel.is_tracked(D1));
        assert_eq!(agent.list_snap_store_locations().unwrap().len(), 1);
        assert_eq!(agent.list_snap_store_mappings().unwrap().len(), 1);

        // a second pass finds everything in place
        agent.initialize().unwrap();
        assert_eq!(agent.list_snap_store_mappings().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected_by_builder() {
        let config = AgentConfig {
            snap_store_file_size: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(
            Orchestrator::builder().config(config).build(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_stop_and_wait() {
        let f = mapped_fixture();
        f.agent.create_snapshot(&["sdb1"]).unwrap();
        assert_eq!(f.agent.running_watchers().len(), 1);

        f.agent.stop();
        assert!(f.agent.running_watchers().is_empty());
        assert!(f.agent.wait());
        // both are idempotent
        f.agent.stop();
        assert!(f.agent.wait());
    }
}
