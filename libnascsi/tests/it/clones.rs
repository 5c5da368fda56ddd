//! Volumes restored from snapshots.

use std::time::Duration;

use libnascsi::appliance::{ApplianceError, DatasetSpec, NfsShareSpec, Op};
use libnascsi::handle::{Attachment, SnapshotHandle};
use libnascsi::params::Protocol;
use libnascsi::{
    ApplianceClient, Code, CreateSnapshotRequest, CreateVolumeRequest, CsiController,
    ListSnapshotsRequest, Snapshot, SnapshotId, SnapshotRegistry, Volume, VolumeContentSource,
};

use crate::common::{Harness, POOL, SERVER, params, snapshot_handle, volume_handle};

async fn restore(
    h: &Harness,
    name: &str,
    snapshot: &Snapshot,
    pairs: &[(&str, &str)],
) -> Result<Volume, libnascsi::CsiError> {
    h.backend
        .create_volume(CreateVolumeRequest {
            name: name.to_owned(),
            capacity_bytes: 1 << 30,
            parameters: params(pairs),
            content_source: Some(VolumeContentSource::Snapshot(
                snapshot.snapshot_id.clone(),
            )),
        })
        .await
}

#[tokio::test]
async fn restore_from_detached_snapshot_after_source_is_gone() {
    let h = Harness::new().await;
    let a = h.nfs_volume("a").await;
    let snapshot = h
        .snapshot("s1", &a, &[("detachedSnapshots", "true")])
        .await
        .unwrap();
    h.backend.delete_volume(&a.volume_id).await.unwrap();
    h.mock.clear_calls();

    let restored = restore(
        &h,
        "a-restore",
        &snapshot,
        &[("pool", POOL), ("detachedVolumesFromSnapshots", "true")],
    )
    .await
    .unwrap();

    let temp = "tank/snaps/tank_-a/s1@csi-restore-a-restore";
    let mutations = h.mock.mutations();
    assert_eq!(mutations[0], (Op::CreateSnapshot, temp.to_owned()));
    assert_eq!(mutations[1], (Op::ReplicateSnapshot, "tank/a-restore".to_owned()));
    assert!(mutations.contains(&(Op::DeleteSnapshot, temp.to_owned())));
    assert!(!h.mock.has_snapshot(temp));

    let handle = volume_handle(&restored);
    assert_eq!(handle.dataset_name, "tank/a-restore");
    assert_eq!(handle.protocol(), Protocol::Nfs);
    // The source handle still decodes, so its server is inherited.
    assert_eq!(handle.attachment.server(), Some(SERVER));
    assert!(h.mock.dataset("tank/a-restore").unwrap().origin.is_none());
    assert_eq!(
        restored.content_source,
        Some(VolumeContentSource::Snapshot(snapshot.snapshot_id.clone()))
    );

    // The snapshot does not depend on the restored volume.
    h.backend
        .delete_snapshot(&snapshot.snapshot_id)
        .await
        .unwrap();
    assert!(!h.mock.has_dataset("tank/snaps/tank_-a/s1"));
}

#[tokio::test]
async fn copy_on_write_restore_of_detached_snapshot_lands_beside_its_source() {
    let h = Harness::new().await;
    let a = h.nfs_volume("a").await;
    let snapshot = h
        .snapshot("s1", &a, &[("detachedSnapshots", "true")])
        .await
        .unwrap();

    let restored = restore(&h, "a-restore", &snapshot, &[]).await.unwrap();

    let clone = h.mock.dataset("tank/a-restore").unwrap();
    assert_eq!(
        clone.origin.as_deref(),
        Some("tank/snaps/tank_-a/s1@csi-restore-a-restore")
    );
    assert_eq!(volume_handle(&restored).dataset_name, clone.name);

    // The clone pins the detached copy until it is gone.
    let err = h
        .backend
        .delete_snapshot(&snapshot.snapshot_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    h.backend.delete_volume(&restored.volume_id).await.unwrap();
    h.backend
        .delete_snapshot(&snapshot.snapshot_id)
        .await
        .unwrap();
    assert!(!h.mock.has_dataset("tank/snaps/tank_-a"));
}

#[tokio::test]
async fn restore_inside_a_snapshot_container_is_not_a_snapshot() {
    let h = Harness::new().await;
    let a = h.nfs_volume("a").await;
    let snapshot = h
        .snapshot("s1", &a, &[("detachedSnapshots", "true")])
        .await
        .unwrap();

    let restored = restore(
        &h,
        "r",
        &snapshot,
        &[("parentDataset", "tank/snaps/tank_-a")],
    )
    .await
    .unwrap();
    let restored_dataset = volume_handle(&restored).dataset_name;
    assert_eq!(restored_dataset, "tank/snaps/tank_-a/r");

    for req in [
        ListSnapshotsRequest {
            source_volume_id: Some(a.volume_id.clone()),
            ..Default::default()
        },
        ListSnapshotsRequest::default(),
    ] {
        let listed = h.backend.list_snapshots(req).await.unwrap();
        let names: Vec<String> = listed
            .entries
            .iter()
            .map(|s| snapshot_handle(s).snapshot_name)
            .collect();
        assert_eq!(names, ["tank/snaps/tank_-a/s1"]);
    }

    let restarted = h.restarted();
    assert_eq!(restarted.backend.recover().await.unwrap(), 1);
    assert_eq!(restarted.registry.lookup("r"), None);

    // A handle pointing at the live volume must not destroy it.
    let forged = SnapshotHandle {
        snapshot_name: restored_dataset.clone(),
        detached: true,
        ..snapshot_handle(&snapshot)
    };
    let err = h
        .backend
        .delete_snapshot(&SnapshotId(forged.encode().unwrap()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(h.mock.has_dataset(&restored_dataset));

    h.backend.delete_volume(&restored.volume_id).await.unwrap();
    h.backend
        .delete_snapshot(&snapshot.snapshot_id)
        .await
        .unwrap();
    assert!(!h.mock.has_dataset("tank/snaps/tank_-a"));
    assert!(h.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelled_replicated_restore_leaves_nothing_to_undo() {
    let h = Harness::new().await;
    let a = h.nfs_volume("a").await;
    let snapshot = h.snapshot("s1", &a, &[]).await.unwrap();
    h.mock.set_replication_delay(Duration::from_secs(600));
    h.mock.clear_calls();

    let cancelled = tokio::time::timeout(
        Duration::from_secs(5),
        restore(
            &h,
            "copy",
            &snapshot,
            &[("detachedVolumesFromSnapshots", "true")],
        ),
    )
    .await;
    assert!(cancelled.is_err());
    assert!(h.mock.mutations().iter().all(|(op, _)| !op.is_delete()));
    assert!(h.mock.has_snapshot("tank/a@s1"));

    h.mock.set_replication_delay(Duration::ZERO);
    restore(
        &h,
        "copy",
        &snapshot,
        &[("detachedVolumesFromSnapshots", "true")],
    )
    .await
    .unwrap();
    assert!(h.mock.dataset("tank/copy").unwrap().origin.is_none());
    assert_eq!(h.mock.shares().len(), 2);
}

#[tokio::test]
async fn native_clone_inherits_protocol_and_target() {
    let h = Harness::new().await;
    let b = h
        .create_volume(
            "b",
            &[
                ("pool", POOL),
                ("protocol", "nvmeof"),
                ("server", SERVER),
                ("subsystemNQN", "nqn.2024-01.io.example"),
                ("port", "4421"),
            ],
        )
        .await
        .unwrap();
    let snapshot = h.snapshot("s1", &b, &[]).await.unwrap();

    let clone = restore(&h, "b-clone", &snapshot, &[]).await.unwrap();

    let handle = volume_handle(&clone);
    assert_eq!(handle.dataset_name, "tank/b-clone");
    assert_eq!(
        h.mock.dataset("tank/b-clone").unwrap().origin.as_deref(),
        Some("tank/b@s1")
    );
    match handle.attachment {
        Attachment::Nvmeof {
            subsystem_nqn,
            server,
            ..
        } => {
            assert_eq!(subsystem_nqn, "nqn.2024-01.io.example:b-clone");
            assert_eq!(server.as_deref(), Some(SERVER));
        }
        other => panic!("unexpected attachment {other:?}"),
    }
    assert_eq!(clone.capacity_bytes, 1 << 30);
    assert_eq!(h.mock.namespaces().len(), 2);
}

#[tokio::test]
async fn detached_clone_of_native_snapshot_is_independent() {
    let h = Harness::new().await;
    let a = h.nfs_volume("a").await;
    let snapshot = h.snapshot("s1", &a, &[]).await.unwrap();

    restore(
        &h,
        "copy",
        &snapshot,
        &[("detachedVolumesFromSnapshots", "true")],
    )
    .await
    .unwrap();

    let copy = h.mock.dataset("tank/copy").unwrap();
    assert!(copy.origin.is_none());
    assert!(!h.mock.has_snapshot("tank/copy@s1"));

    h.backend
        .delete_snapshot(&snapshot.snapshot_id)
        .await
        .unwrap();
    h.backend.delete_volume(&a.volume_id).await.unwrap();
    assert!(h.mock.has_dataset("tank/copy"));
}

#[tokio::test]
async fn retried_restore_converges() {
    let h = Harness::new().await;
    let a = h.nfs_volume("a").await;
    let snapshot = h.snapshot("s1", &a, &[]).await.unwrap();

    let first = restore(&h, "r", &snapshot, &[]).await.unwrap();
    let second = restore(&h, "r", &snapshot, &[]).await.unwrap();
    assert_eq!(first.volume_id, second.volume_id);
    assert_eq!(h.mock.shares().len(), 2);
}

#[tokio::test]
async fn bad_snapshot_reference_is_not_found() {
    let h = Harness::new().await;
    let fake = Snapshot {
        snapshot_id: SnapshotId::from("garbage"),
        source_volume_id: "x".into(),
        creation_time: 0,
        size_bytes: 0,
        ready_to_use: true,
    };
    let err = restore(&h, "r", &fake, &[("pool", POOL)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert!(h.mock.calls().is_empty());
}

#[tokio::test]
async fn deleted_snapshot_is_not_found() {
    let h = Harness::new().await;
    let a = h.nfs_volume("a").await;
    let snapshot = h.snapshot("s1", &a, &[]).await.unwrap();
    h.backend
        .delete_snapshot(&snapshot.snapshot_id)
        .await
        .unwrap();

    let err = restore(&h, "r", &snapshot, &[]).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert!(!h.mock.has_dataset("tank/r"));
}

#[tokio::test]
async fn protocol_mismatch_is_rejected() {
    let h = Harness::new().await;
    let a = h.nfs_volume("a").await;
    let snapshot = h.snapshot("s1", &a, &[]).await.unwrap();
    h.mock.clear_calls();

    let err = restore(&h, "r", &snapshot, &[("protocol", "nvmeof")])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(h.mock.mutations().is_empty());
}

#[tokio::test]
async fn unresolvable_attachment_rolls_back_the_clone() {
    let h = Harness::new().await;
    // A volume created outside this driver, referenced by its bare name.
    h.mock
        .create_dataset(&DatasetSpec::filesystem("tank/pvc-legacy", None))
        .await
        .unwrap();
    h.mock
        .create_nfs_share(&NfsShareSpec {
            path: "/mnt/tank/pvc-legacy".into(),
            comment: String::new(),
        })
        .await
        .unwrap();
    let snapshot = h
        .backend
        .create_snapshot(CreateSnapshotRequest {
            name: "s1".into(),
            source_volume_id: "pvc-legacy".into(),
            parameters: Default::default(),
        })
        .await
        .unwrap();
    assert_eq!(snapshot_handle(&snapshot).dataset_name, "tank/pvc-legacy");

    let err = restore(&h, "r", &snapshot, &[]).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(!h.mock.has_dataset("tank/r"));

    let volume = restore(&h, "r", &snapshot, &[("server", SERVER)])
        .await
        .unwrap();
    assert_eq!(volume.volume_context["server"], SERVER);
}

#[tokio::test]
async fn export_failure_deletes_the_clone() {
    let h = Harness::new().await;
    let a = h.nfs_volume("a").await;
    let snapshot = h.snapshot("s1", &a, &[]).await.unwrap();
    h.mock
        .fail_next(Op::CreateNfsShare, ApplianceError::Request("busy".into()));

    let err = restore(&h, "r", &snapshot, &[]).await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(!h.mock.has_dataset("tank/r"));
    assert!(h.mock.has_snapshot("tank/a@s1"));
}
