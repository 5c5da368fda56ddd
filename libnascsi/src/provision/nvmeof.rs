//! Block-over-fabric pipeline: zvol, then a subsystem named after the volume,
//! then namespace 1 backed by the zvol.
//!
//! Every volume gets its own subsystem; subsystems are never shared.

use std::collections::HashMap;

use tracing::{debug, info, instrument};

use crate::appliance::{
    ApplianceClient, Dataset, DatasetKind, DatasetSpec, NvmeNamespaceSpec, NvmeSubsystemSpec,
};
use crate::config::ZVOL_BLOCK_SIZE;
use crate::error::CsiError;
use crate::handle::{Attachment, VolumeHandle};
use crate::params::{NvmeofParams, Protocol};
use crate::saga::Rollback;

use super::{
    CTX_DATASET, CTX_NQN, CTX_NSID, CTX_PORT, CTX_PROTOCOL, CTX_SERVER, CTX_TRANSPORT,
    Provisioned, ensure_dataset, ensure_namespace, ensure_subsystem, undo_dataset,
};

/// Namespace id of the single namespace in a volume's subsystem.
pub const NAMESPACE_ID: u32 = 1;

/// Create a `capacity` byte zvol at `dataset_path` and expose it.
#[instrument(skip(client, params))]
pub async fn provision_nvmeof(
    client: &dyn ApplianceClient,
    name: &str,
    dataset_path: &str,
    capacity: u64,
    params: &NvmeofParams,
) -> Result<Provisioned, CsiError> {
    let mut rollback = Rollback::new();

    let dataset = ensure_dataset(
        client,
        &DatasetSpec::volume(dataset_path, capacity, ZVOL_BLOCK_SIZE),
    )
    .await?;
    if dataset.created {
        undo_dataset(&mut rollback, client, &dataset.value.name);
    }

    let provisioned = export_nvmeof(client, name, &dataset.value, params, &mut rollback).await?;
    rollback.commit();
    info!(dataset = %dataset_path, "nvmeof volume provisioned");
    Ok(provisioned)
}

/// Expose an existing zvol through a new subsystem.
///
/// On failure every action on `rollback` is unwound, including the ones the
/// caller pushed before.
pub async fn export_nvmeof<'a>(
    client: &'a dyn ApplianceClient,
    name: &str,
    dataset: &Dataset,
    params: &NvmeofParams,
    rollback: &mut Rollback<'a>,
) -> Result<Provisioned, CsiError> {
    if dataset.kind != DatasetKind::Volume {
        rollback.unwind().await;
        return Err(CsiError::InvalidArgument(format!(
            "dataset {} is not a zvol and cannot be exported over nvmeof",
            dataset.name
        )));
    }

    let subsystem_spec = NvmeSubsystemSpec {
        name: name.to_owned(),
        subnqn: params
            .subsystem_nqn
            .as_ref()
            .map(|base| format!("{base}:{name}")),
        allow_any_host: true,
    };
    let subsystem = rollback
        .attempt(ensure_subsystem(client, &subsystem_spec))
        .await?;
    let subsystem_id = subsystem.value.id;
    if subsystem.created {
        rollback.push(format!("delete subsystem {subsystem_id}"), async move {
            client.delete_subsystem(subsystem_id).await
        });
    }

    let namespace_spec = NvmeNamespaceSpec {
        subsystem_id,
        nsid: NAMESPACE_ID,
        device_path: dataset.device_path(),
    };
    let namespace = rollback
        .attempt(ensure_namespace(client, &namespace_spec))
        .await?;
    if namespace.created {
        let id = namespace.value.id;
        rollback.push(format!("delete namespace {id}"), async move {
            client.delete_namespace(id).await
        });
    }
    debug!(
        nqn = %subsystem.value.subnqn,
        device = %namespace_spec.device_path,
        "nvmeof namespace ready"
    );

    let handle = VolumeHandle {
        name: name.to_owned(),
        dataset_id: dataset.id.clone(),
        dataset_name: dataset.name.clone(),
        attachment: Attachment::Nvmeof {
            subsystem_id,
            namespace_id: namespace.value.id,
            subsystem_nqn: subsystem.value.subnqn.clone(),
            server: params.server.clone(),
            transport: params.transport.clone(),
            port: params.port,
        },
    };

    let mut context = HashMap::from([
        (CTX_PROTOCOL.to_owned(), Protocol::Nvmeof.to_string()),
        (CTX_NQN.to_owned(), subsystem.value.subnqn),
        (CTX_NSID.to_owned(), NAMESPACE_ID.to_string()),
        (CTX_TRANSPORT.to_owned(), params.transport.clone()),
        (CTX_PORT.to_owned(), params.port.to_string()),
        (CTX_DATASET.to_owned(), dataset.name.clone()),
    ]);
    if let Some(server) = &params.server {
        context.insert(CTX_SERVER.to_owned(), server.clone());
    }

    Ok(Provisioned { handle, context })
}
