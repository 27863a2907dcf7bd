//! Snapshot, back up, release, repeat

use crate::common::*;

// ============================================================================
// Single disk
// ============================================================================

#[test]
fn full_then_incremental_backup() {
    let host = TestHost::new();
    let agent = host.agent(host.config());
    let prior = host.kernel.query_cbt_info().unwrap()[0].snap_number;

    host.write(D1, 0, 4);
    let first = agent.create_snapshot(&["sdb1"]).unwrap();
    assert_eq!(first.volumes.len(), 1);
    let first_volume = first.volumes[0].clone();
    assert_eq!(first_volume.snapshot_number, u32::from(prior) + 1);

    let full = agent
        .get_changed_sectors(&first.snapshot.id, "sdb1", "", 0)
        .unwrap();
    assert_eq!(full.backup_type, BackupType::Full);
    assert_eq!(
        full.ranges,
        vec![DiskRange {
            offset: 0,
            length: DISK_SIZE
        }]
    );
    agent.delete_snapshot(&first.snapshot.id).unwrap();

    host.write(D1, 8, 2);
    host.write(D1, 100, 1);
    let second = agent.create_snapshot(&["sdb1"]).unwrap();
    let second_volume = &second.volumes[0];
    assert_eq!(second_volume.generation_id, first_volume.generation_id);
    assert_eq!(second_volume.snapshot_number, first_volume.snapshot_number + 1);

    let incremental = agent
        .get_changed_sectors(
            &second.snapshot.id,
            "sdb1",
            &first_volume.generation_id.to_string(),
            first_volume.snapshot_number,
        )
        .unwrap();
    assert_eq!(incremental.backup_type, BackupType::Incremental);
    assert_eq!(
        incremental.ranges,
        vec![
            DiskRange {
                offset: 8 * BLOCK,
                length: 2 * BLOCK
            },
            DiskRange {
                offset: 100 * BLOCK,
                length: BLOCK
            },
        ]
    );
    assert!(total_length(&incremental.ranges) < DISK_SIZE);

    agent.delete_snapshot(&second.snapshot.id).unwrap();
    shut_down(agent);
}

#[test]
fn untouched_disk_has_empty_increment() {
    let host = TestHost::new();
    let agent = host.agent(host.config());

    let first = agent.create_snapshot(&["sdb1"]).unwrap();
    let previous = first.volumes[0].clone();
    agent.delete_snapshot(&first.snapshot.id).unwrap();

    let second = agent.create_snapshot(&["sdb1"]).unwrap();
    let changed = agent
        .get_changed_sectors(
            &second.snapshot.id,
            "sdb1",
            &previous.generation_id.to_string(),
            previous.snapshot_number,
        )
        .unwrap();
    assert_eq!(changed.backup_type, BackupType::Incremental);
    assert!(changed.ranges.is_empty());
}

#[test]
fn new_cbt_epoch_forces_full_backup() {
    let host = TestHost::new();
    let agent = host.agent(host.config());

    let first = agent.create_snapshot(&["sdb1"]).unwrap();
    let previous = first.volumes[0].clone();
    agent.delete_snapshot(&first.snapshot.id).unwrap();

    host.kernel.reset_generation(D1);
    host.write(D1, 3, 1);
    let second = agent.create_snapshot(&["sdb1"]).unwrap();
    assert_ne!(second.volumes[0].generation_id, previous.generation_id);

    let changed = agent
        .get_changed_sectors(
            &second.snapshot.id,
            "sdb1",
            &previous.generation_id.to_string(),
            previous.snapshot_number,
        )
        .unwrap();
    assert_eq!(changed.backup_type, BackupType::Full);
    assert_eq!(total_length(&changed.ranges), DISK_SIZE);
}

// ============================================================================
// Multiple disks
// ============================================================================

#[test]
fn disks_snapshotted_together_share_one_kernel_snapshot() {
    let host = TestHost::new();
    let agent = host.agent(host.config());

    let created = agent.create_snapshot(&["sdb1", "sdc"]).unwrap();
    assert_eq!(created.volumes.len(), 2);
    assert_eq!(host.kernel.snapshot_ids(), vec![created.snapshot.kernel_snapshot_id]);

    let stores: Vec<_> = created.volumes.iter().map(|v| v.snap_store_id).collect();
    assert_ne!(stores[0], stores[1]);
    let mut kernel_stores = host.kernel.snap_store_ids();
    kernel_stores.sort_by_key(|id| id.to_string());
    let mut expected = stores.clone();
    expected.sort_by_key(|id| id.to_string());
    assert_eq!(kernel_stores, expected);

    for (volume, disk) in created.volumes.iter().zip(["sdb1", "sdc"]) {
        assert_eq!(volume.tracked_disk_id, disk);
        assert_eq!(
            agent.find_volume_snapshot(&created.snapshot.id, disk).unwrap(),
            *volume
        );
    }

    agent.delete_snapshot(&created.snapshot.id).unwrap();
    assert!(host.kernel.snapshot_ids().is_empty());
    assert!(host.kernel.snap_store_ids().is_empty());
    assert!(agent.list_snap_stores().unwrap().is_empty());
    assert_eq!(host.cow_entries(), 0);
}

#[test]
fn one_snapshot_per_disk_at_a_time() {
    let host = TestHost::new();
    let agent = host.agent(host.config());

    let first = agent.create_snapshot(&["sdb1"]).unwrap();
    let err = agent.create_snapshot(&["sdc", "sdb1"]).unwrap_err();
    assert!(err.is_conflict());
    // the conflict is found before anything is created for sdc
    assert_eq!(host.kernel.snap_store_ids().len(), 1);
    assert_eq!(agent.list_snap_stores().unwrap().len(), 1);

    agent.create_snapshot(&["sdc"]).unwrap();
    agent.delete_snapshot(&first.snapshot.id).unwrap();
    agent.create_snapshot(&["sdb1"]).unwrap();
    assert_eq!(agent.list_snapshots().unwrap().len(), 2);
}

#[test]
fn snap_store_grows_while_snapshot_is_held() {
    let host = TestHost::new();
    let agent = host.agent(host.config());

    let created = agent.create_snapshot(&["sdb1"]).unwrap();
    let store_id = created.volumes[0].snap_store_id;
    let before = agent.get_snap_store(store_id).unwrap().allocated_bytes;

    host.kernel.push_halffill(&store_id, before / 2);
    host.kernel.push_halffill(&store_id, before);
    eventually("two extents added", || {
        agent.catalog().files_for_store(store_id).unwrap().len() == 3
    });
    eventually("allocation recorded", || {
        agent.get_snap_store(store_id).unwrap().allocated_bytes == before + 2 * 64 * 1024
    });
    assert_eq!(host.kernel.snap_store_extents(&store_id).len(), 3);

    agent.delete_snapshot(&created.snapshot.id).unwrap();
    assert!(agent.catalog().files_for_store(store_id).unwrap().is_empty());
}
