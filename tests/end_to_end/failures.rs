//! Rollback of partially created snapshots

use crate::common::*;

fn assert_clean(host: &TestHost, agent: &Orchestrator) {
    assert!(agent.list_snapshots().unwrap().is_empty());
    assert!(agent.list_snap_stores().unwrap().is_empty());
    for report in agent.list_snap_store_locations().unwrap() {
        assert_eq!(report.allocated_bytes, 0);
    }
    assert!(host.kernel.snapshot_ids().is_empty());
    assert!(host.kernel.snap_store_ids().is_empty());
    assert_eq!(host.cow_entries(), 0);
}

#[test]
fn racing_snapshot_is_detected_and_undone() {
    for step in [0u8, 2] {
        let host = TestHost::new();
        let agent = host.agent(host.config());
        host.kernel.set_snapshot_step(step);

        let err = agent.create_snapshot(&["sdb1", "sdc"]).unwrap_err();
        assert!(err.is_invariant_violation(), "step {}: {}", step, err);
        assert_clean(&host, &agent);
    }
}

#[test]
fn unmapped_second_disk_releases_store_of_first() {
    let host = TestHost::new();
    let config = AgentConfig {
        snap_store_mappings: vec![MappingConfig {
            device: "/dev/sdb1".into(),
            location: host.cow.clone(),
        }],
        ..host.config()
    };
    let agent = host.agent(config);

    let err = agent.create_snapshot(&["sdb1", "sdc"]).unwrap_err();
    assert!(err.is_not_found());
    assert_clean(&host, &agent);
}

#[test]
fn bitmap_read_failure_destroys_kernel_snapshot() {
    let host = TestHost::new();
    let agent = host.agent(host.config());

    // bitmaps are read after the kernel snapshot exists
    host.kernel.fail_next("TRACKING_READ_CBT_BITMAP", 5);
    let err = agent.create_snapshot(&["sdb1"]).unwrap_err();
    assert!(matches!(err, Error::Kernel { .. }));
    assert_clean(&host, &agent);

    let created = agent.create_snapshot(&["sdb1", "sdc"]).unwrap();
    assert_eq!(created.volumes.len(), 2);
}

#[test]
fn image_node_that_never_appears_is_a_failure() {
    let host = TestHost::new();
    let agent = host.agent(host.config());
    host.directory.delay_device_nodes(100);

    let err = agent.create_snapshot(&["sdb1"]).unwrap_err();
    assert!(matches!(err, Error::Device(_)));
    assert_clean(&host, &agent);
}

#[test]
fn kernel_refusal_releases_new_store() {
    let host = TestHost::new();
    let agent = host.agent(host.config());

    host.kernel.fail_next("SNAPSHOT_CREATE", 16);
    let err = agent.create_snapshot(&["sdb1", "sdc"]).unwrap_err();
    assert!(matches!(err, Error::Kernel { .. }));
    assert_clean(&host, &agent);
}

#[test]
fn overflowed_snapshot_can_be_deleted() {
    let host = TestHost::new();
    let agent = host.agent(host.config());

    let created = agent.create_snapshot(&["sdb1"]).unwrap();
    let store_id = created.volumes[0].snap_store_id;
    let volume_id = created.volumes[0].tracking_id.clone();
    host.kernel.push_overflow(&store_id, 28, 1 << 20);
    eventually("overflow recorded", || {
        agent.catalog().volume_snapshot(&volume_id).unwrap().status == VolumeStatus::Overflow
    });
    assert!(agent
        .get_changed_sectors(&created.snapshot.id, "sdb1", "", 0)
        .unwrap_err()
        .is_overflow());

    agent.delete_snapshot(&created.snapshot.id).unwrap();
    assert_clean(&host, &agent);
}
