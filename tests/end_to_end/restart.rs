//! Agent restarts over a persistent catalog

use crate::common::*;
use std::fs;

#[test]
fn snapshot_survives_agent_restart() {
    let host = TestHost::new();
    let config = host.persistent_config();

    let agent = host.agent(config.clone());
    host.write(D1, 5, 1);
    let created = agent.create_snapshot(&["sdb1"]).unwrap();
    let store_id = created.volumes[0].snap_store_id;
    shut_down(agent);

    let agent = host.agent(config);
    assert_eq!(agent.list_tracked_disks().unwrap().len(), 2);
    assert_eq!(agent.list_snap_store_mappings().unwrap().len(), 2);
    assert_eq!(agent.get_snapshot(&created.snapshot.id).unwrap(), created);
    assert!(host.cow.join(store_id.to_string()).is_dir());

    let changed = agent
        .get_changed_sectors(&created.snapshot.id, "sdb1", "", 0)
        .unwrap();
    assert_eq!(changed.backup_type, BackupType::Full);

    agent.delete_snapshot(&created.snapshot.id).unwrap();
    assert!(agent.list_snap_stores().unwrap().is_empty());
    assert!(host.kernel.snap_store_ids().is_empty());
    shut_down(agent);
}

#[test]
fn fresh_catalog_clears_cow_destination() {
    let host = TestHost::new();
    fs::write(host.cow.join("left-over"), b"previous boot").unwrap();

    let agent = host.agent(host.persistent_config());
    assert_eq!(host.cow_entries(), 0);
    shut_down(agent);

    fs::write(host.cow.join("kept"), b"current boot").unwrap();
    let agent = host.agent(host.persistent_config());
    assert!(host.cow.join("kept").exists());
    shut_down(agent);
}

#[test]
fn second_agent_cannot_share_catalog() {
    let host = TestHost::new();
    let agent = host.agent(host.persistent_config());

    let err = Orchestrator::builder()
        .config(host.persistent_config())
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, Error::Catalog(_)));
    shut_down(agent);
}
