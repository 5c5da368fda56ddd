//! Volume create / delete against the mock appliance.

use libnascsi::appliance::{ApplianceError, Op};
use libnascsi::handle::Attachment;
use libnascsi::params::Protocol;
use libnascsi::{
    Code, CreateVolumeRequest, CsiController, CsiError, VolumeContentSource, VolumeId,
};

use crate::common::{Harness, POOL, SERVER, params, volume_handle};

#[tokio::test]
async fn nfs_volume_is_a_dataset_and_a_share() {
    let h = Harness::new().await;
    let volume = h
        .create_volume("a", &[("protocol", "nfs"), ("pool", POOL), ("server", SERVER)])
        .await
        .unwrap();

    let handle = volume_handle(&volume);
    assert_eq!(handle.name, "a");
    assert_eq!(handle.protocol(), Protocol::Nfs);
    assert_eq!(handle.dataset_name, "tank/a");
    let shares = h.mock.shares();
    assert_eq!(shares.len(), 1);
    assert_eq!(shares[0].path, "/mnt/tank/a");
    match handle.attachment {
        Attachment::Nfs { share_id, .. } => assert_eq!(share_id, shares[0].id),
        other => panic!("unexpected attachment {other:?}"),
    }
    assert_eq!(volume.volume_context["server"], SERVER);
    assert_eq!(volume.volume_context["share"], "/mnt/tank/a");
}

#[tokio::test]
async fn nvmeof_volume_defaults_to_one_gib() {
    let h = Harness::new().await;
    let volume = h
        .backend
        .create_volume(CreateVolumeRequest {
            name: "b".into(),
            capacity_bytes: 0,
            parameters: params(&[("protocol", "nvmeof"), ("pool", POOL)]),
            content_source: None,
        })
        .await
        .unwrap();

    assert_eq!(volume.capacity_bytes, 1 << 30);
    assert_eq!(h.mock.dataset("tank/b").unwrap().volsize, Some(1 << 30));
    let subsystems = h.mock.subsystems();
    assert_eq!(subsystems.len(), 1);
    assert_eq!(subsystems[0].name, "b");
    let namespaces = h.mock.namespaces();
    assert_eq!(namespaces.len(), 1);
    assert_eq!(namespaces[0].nsid, 1);
    assert_eq!(namespaces[0].device_path, "zvol/tank/b");
    assert_eq!(namespaces[0].subsystem_id, subsystems[0].id);
    assert_eq!(
        h.mock
            .mutations()
            .into_iter()
            .map(|(op, _)| op)
            .collect::<Vec<_>>(),
        [Op::CreateDataset, Op::CreateSubsystem, Op::CreateNamespace]
    );
}

#[tokio::test]
async fn parent_dataset_places_the_volume() {
    let h = Harness::new().await;
    h.create_volume("k8s", &[("pool", POOL)]).await.unwrap();
    let volume = h
        .create_volume("c", &[("parentDataset", "tank/k8s")])
        .await
        .unwrap();
    assert_eq!(volume_handle(&volume).dataset_name, "tank/k8s/c");
}

#[tokio::test]
async fn rollback_undoes_exactly_the_completed_steps() {
    let failing = [Op::CreateDataset, Op::CreateSubsystem, Op::CreateNamespace];
    let undo = [Op::DeleteNamespace, Op::DeleteSubsystem, Op::DeleteDataset];

    for (step, op) in failing.into_iter().enumerate() {
        let h = Harness::new().await;
        h.mock.fail_next(op, ApplianceError::Request("injected".into()));

        let err = h
            .create_volume("b", &[("protocol", "nvmeof"), ("pool", POOL)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        let deletes: Vec<Op> = h
            .mock
            .mutations()
            .into_iter()
            .map(|(op, _)| op)
            .filter(|op| op.is_delete())
            .collect();
        assert_eq!(deletes, undo[undo.len() - step..], "failure at step {}", step + 1);
        assert!(!h.mock.has_dataset("tank/b"));
        assert!(h.mock.subsystems().is_empty());
    }
}

#[tokio::test]
async fn retry_after_rollback_converges() {
    let h = Harness::new().await;
    h.mock
        .fail_next(Op::CreateNfsShare, ApplianceError::Request("busy".into()));
    // The compensating delete fails too, leaving the dataset behind.
    h.mock
        .fail_next(Op::DeleteDataset, ApplianceError::Request("busy".into()));

    h.create_volume("a", &[("pool", POOL)]).await.unwrap_err();
    assert!(h.mock.has_dataset("tank/a"));

    let volume = h.create_volume("a", &[("pool", POOL)]).await.unwrap();
    assert_eq!(volume_handle(&volume).dataset_name, "tank/a");
    assert_eq!(h.mock.shares().len(), 1);
}

#[tokio::test]
async fn repeated_create_returns_the_same_volume() {
    let h = Harness::new().await;
    let first = h.nvmeof_volume("b").await;
    let second = h.nvmeof_volume("b").await;
    assert_eq!(first.volume_id, second.volume_id);
    assert_eq!(h.mock.subsystems().len(), 1);
    assert_eq!(h.mock.namespaces().len(), 1);
}

#[tokio::test]
async fn invalid_requests_make_no_remote_calls() {
    let h = Harness::new().await;

    let cases = [
        ("a", vec![("protocol", "nfs")], Code::InvalidArgument),
        ("a", vec![("pool", POOL), ("protocol", "smb")], Code::InvalidArgument),
        ("a", vec![("pool", POOL), ("protocol", "iscsi")], Code::Unimplemented),
        ("", vec![("pool", POOL)], Code::InvalidArgument),
        ("a/b", vec![("pool", POOL)], Code::InvalidArgument),
    ];
    for (name, pairs, code) in cases {
        let err = h.create_volume(name, &pairs).await.unwrap_err();
        assert_eq!(err.code(), code, "{name} {pairs:?}");
    }

    let err = h
        .backend
        .create_volume(CreateVolumeRequest {
            name: "a".into(),
            parameters: params(&[("pool", POOL)]),
            content_source: Some(VolumeContentSource::Volume(VolumeId::from("vh1.x"))),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CsiError::Unimplemented(_)));

    assert!(h.mock.calls().is_empty());
}

#[tokio::test]
async fn delete_is_idempotent() {
    let h = Harness::new().await;
    for garbage in ["", "garbage", "pvc-1234", "vh1.!!!"] {
        h.backend
            .delete_volume(&VolumeId::from(garbage))
            .await
            .unwrap();
    }
    assert!(h.mock.calls().is_empty());

    let volume = h.nvmeof_volume("b").await;
    h.backend.delete_volume(&volume.volume_id).await.unwrap();
    assert!(!h.mock.has_dataset("tank/b"));
    assert!(h.mock.subsystems().is_empty());
    assert!(h.mock.namespaces().is_empty());

    // Every child now reports not-found.
    h.backend.delete_volume(&volume.volume_id).await.unwrap();
}

#[tokio::test]
async fn delete_continues_past_failures() {
    let h = Harness::new().await;
    let volume = h.nvmeof_volume("b").await;
    h.mock
        .fail_next(Op::DeleteNamespace, ApplianceError::Request("busy".into()));

    h.backend.delete_volume(&volume.volume_id).await.unwrap();

    let attempted: Vec<Op> = h
        .mock
        .mutations()
        .into_iter()
        .map(|(op, _)| op)
        .filter(|op| op.is_delete())
        .collect();
    assert_eq!(
        attempted,
        [Op::DeleteNamespace, Op::DeleteSubsystem, Op::DeleteDataset]
    );
    // The surviving namespace keeps its subsystem alive.
    assert_eq!(h.mock.namespaces().len(), 1);
    assert_eq!(h.mock.subsystems().len(), 1);
    assert!(!h.mock.has_dataset("tank/b"));
}
