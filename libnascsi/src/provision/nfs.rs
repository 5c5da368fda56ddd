//! File-export pipeline: filesystem dataset, then an NFS share of its mount
//! path.

use std::collections::HashMap;

use tracing::{debug, info, instrument};

use crate::appliance::{ApplianceClient, Dataset, DatasetKind, DatasetSpec, NfsShareSpec};
use crate::error::CsiError;
use crate::handle::{Attachment, VolumeHandle};
use crate::params::{NfsParams, Protocol};
use crate::saga::Rollback;

use super::{
    CTX_DATASET, CTX_PROTOCOL, CTX_SERVER, CTX_SHARE, Provisioned, ensure_dataset,
    ensure_nfs_share, undo_dataset,
};

/// Create `dataset_path` with a `capacity` byte quota and export it.
#[instrument(skip(client, params))]
pub async fn provision_nfs(
    client: &dyn ApplianceClient,
    name: &str,
    dataset_path: &str,
    capacity: u64,
    params: &NfsParams,
) -> Result<Provisioned, CsiError> {
    let mut rollback = Rollback::new();

    let dataset = ensure_dataset(
        client,
        &DatasetSpec::filesystem(dataset_path, Some(capacity)),
    )
    .await?;
    if dataset.created {
        undo_dataset(&mut rollback, client, &dataset.value.name);
    }

    let provisioned = export_nfs(client, name, &dataset.value, params, &mut rollback).await?;
    rollback.commit();
    info!(dataset = %dataset_path, "nfs volume provisioned");
    Ok(provisioned)
}

/// Share an existing filesystem dataset over NFS.
///
/// On failure every action on `rollback` is unwound, including the ones the
/// caller pushed before.
pub async fn export_nfs<'a>(
    client: &'a dyn ApplianceClient,
    name: &str,
    dataset: &Dataset,
    params: &NfsParams,
    rollback: &mut Rollback<'a>,
) -> Result<Provisioned, CsiError> {
    let mountpoint = match (&dataset.kind, &dataset.mountpoint) {
        (DatasetKind::Filesystem, Some(mountpoint)) => mountpoint.clone(),
        _ => {
            rollback.unwind().await;
            return Err(CsiError::InvalidArgument(format!(
                "dataset {} is not a mounted filesystem and cannot be shared over nfs",
                dataset.name
            )));
        }
    };

    let spec = NfsShareSpec {
        path: mountpoint.clone(),
        comment: format!("csi volume {name}"),
    };
    let share = rollback.attempt(ensure_nfs_share(client, &spec)).await?;
    if share.created {
        let id = share.value.id;
        rollback.push(format!("delete nfs share {id}"), async move {
            client.delete_nfs_share(id).await
        });
    }
    debug!(path = %mountpoint, share_id = share.value.id, "nfs share ready");

    let handle = VolumeHandle {
        name: name.to_owned(),
        dataset_id: dataset.id.clone(),
        dataset_name: dataset.name.clone(),
        attachment: Attachment::Nfs {
            share_id: share.value.id,
            share_path: mountpoint.clone(),
            server: params.server.clone(),
        },
    };

    let mut context = HashMap::from([
        (CTX_PROTOCOL.to_owned(), Protocol::Nfs.to_string()),
        (CTX_SHARE.to_owned(), mountpoint),
        (CTX_DATASET.to_owned(), dataset.name.clone()),
    ]);
    if let Some(server) = &params.server {
        context.insert(CTX_SERVER.to_owned(), server.clone());
    }

    Ok(Provisioned { handle, context })
}
