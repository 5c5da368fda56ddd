//! Protocol provisioning pipelines.
//!
//! A pipeline builds a volume's resource topology with ordered remote calls:
//!
//! | Protocol | Steps |
//! |---|---|
//! | NFS | filesystem dataset → NFS share |
//! | NVMe-oF | zvol → subsystem → namespace 1 |
//!
//! Each step that creates something pushes its undo action onto a
//! [`Rollback`]; a failing step unwinds the stack.  Each step also tolerates
//! "already exists with the same shape", so a retried create converges on
//! the resources left behind by an earlier attempt.  Resources found that
//! way were not created by this call and are never rolled back by it.
//!
//! The `export_*` halves take an existing backing dataset and are reused by
//! the clone path.

use std::collections::HashMap;

use tracing::debug;

use crate::appliance::{
    ApplianceClient, ApplianceError, Dataset, DatasetSpec, NfsShare, NfsShareSpec, NvmeNamespace,
    NvmeNamespaceSpec, NvmeSubsystem, NvmeSubsystemSpec,
};
use crate::config::DEFAULT_CAPACITY_BYTES;
use crate::error::CsiError;
use crate::handle::VolumeHandle;
use crate::saga::Rollback;

mod nfs;
mod nvmeof;

pub use nfs::{export_nfs, provision_nfs};
pub use nvmeof::{NAMESPACE_ID, export_nvmeof, provision_nvmeof};

// Keys of the volume context handed to Node operations.
pub const CTX_PROTOCOL: &str = "protocol";
pub const CTX_SERVER: &str = "server";
pub const CTX_DATASET: &str = "datasetName";
pub const CTX_SHARE: &str = "share";
pub const CTX_NQN: &str = "nqn";
pub const CTX_NSID: &str = "nsid";
pub const CTX_TRANSPORT: &str = "transport";
pub const CTX_PORT: &str = "port";

/// Outcome of a successful pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub handle: VolumeHandle,
    /// Attachment parameters, opaque to the controller.
    pub context: HashMap<String, String>,
}

/// Requested capacity with the zero-means-default rule applied.
pub fn effective_capacity(requested: u64) -> u64 {
    if requested == 0 {
        DEFAULT_CAPACITY_BYTES
    } else {
        requested
    }
}

/// A resource returned by an idempotent create step.
#[derive(Debug, Clone)]
pub(crate) struct Ensured<T> {
    pub value: T,
    /// `false` when a matching resource already existed.
    pub created: bool,
}

impl<T> Ensured<T> {
    fn created(value: T) -> Self {
        Self {
            value,
            created: true,
        }
    }

    fn existing(value: T) -> Self {
        Self {
            value,
            created: false,
        }
    }
}

pub(crate) async fn ensure_dataset(
    client: &dyn ApplianceClient,
    spec: &DatasetSpec,
) -> Result<Ensured<Dataset>, CsiError> {
    match client.create_dataset(spec).await {
        Ok(dataset) => Ok(Ensured::created(dataset)),
        Err(ApplianceError::AlreadyExists(_)) => {
            let existing = client
                .get_dataset(&spec.name)
                .await
                .map_err(|e| CsiError::upstream("look up existing dataset", e))?;
            if !spec.matches(&existing) {
                return Err(CsiError::AlreadyExists(format!(
                    "dataset {} with a different shape",
                    spec.name
                )));
            }
            debug!(dataset = %spec.name, "reusing existing dataset");
            Ok(Ensured::existing(existing))
        }
        Err(e) => Err(CsiError::upstream("create dataset", e)),
    }
}

pub(crate) async fn ensure_nfs_share(
    client: &dyn ApplianceClient,
    spec: &NfsShareSpec,
) -> Result<Ensured<NfsShare>, CsiError> {
    match client.create_nfs_share(spec).await {
        Ok(share) => Ok(Ensured::created(share)),
        Err(ApplianceError::AlreadyExists(_)) => {
            let existing = client
                .query_nfs_shares(&spec.path)
                .await
                .map_err(|e| CsiError::upstream("look up existing nfs share", e))?
                .into_iter()
                .find(|s| s.path == spec.path)
                .ok_or_else(|| {
                    CsiError::AlreadyExists(format!("nfs share for {} (not queryable)", spec.path))
                })?;
            debug!(path = %spec.path, id = existing.id, "reusing existing nfs share");
            Ok(Ensured::existing(existing))
        }
        Err(e) => Err(CsiError::upstream("create nfs share", e)),
    }
}

pub(crate) async fn ensure_subsystem(
    client: &dyn ApplianceClient,
    spec: &NvmeSubsystemSpec,
) -> Result<Ensured<NvmeSubsystem>, CsiError> {
    match client.create_subsystem(spec).await {
        Ok(subsystem) => Ok(Ensured::created(subsystem)),
        Err(ApplianceError::AlreadyExists(_)) => {
            let existing = client
                .query_subsystems()
                .await
                .map_err(|e| CsiError::upstream("look up existing subsystem", e))?
                .into_iter()
                .find(|s| s.name == spec.name)
                .ok_or_else(|| {
                    CsiError::AlreadyExists(format!("subsystem {} (not queryable)", spec.name))
                })?;
            if spec.subnqn.as_ref().is_some_and(|nqn| *nqn != existing.subnqn) {
                return Err(CsiError::AlreadyExists(format!(
                    "subsystem {} with NQN {}",
                    spec.name, existing.subnqn
                )));
            }
            debug!(name = %spec.name, id = existing.id, "reusing existing subsystem");
            Ok(Ensured::existing(existing))
        }
        Err(e) => Err(CsiError::upstream("create subsystem", e)),
    }
}

pub(crate) async fn ensure_namespace(
    client: &dyn ApplianceClient,
    spec: &NvmeNamespaceSpec,
) -> Result<Ensured<NvmeNamespace>, CsiError> {
    match client.create_namespace(spec).await {
        Ok(namespace) => Ok(Ensured::created(namespace)),
        Err(ApplianceError::AlreadyExists(_)) => {
            let existing = client
                .query_namespaces()
                .await
                .map_err(|e| CsiError::upstream("look up existing namespace", e))?
                .into_iter()
                .find(|n| n.subsystem_id == spec.subsystem_id && n.nsid == spec.nsid)
                .ok_or_else(|| {
                    CsiError::AlreadyExists(format!(
                        "namespace {} of subsystem {} (not queryable)",
                        spec.nsid, spec.subsystem_id
                    ))
                })?;
            if existing.device_path != spec.device_path {
                return Err(CsiError::AlreadyExists(format!(
                    "namespace {} of subsystem {} points at {}",
                    spec.nsid, spec.subsystem_id, existing.device_path
                )));
            }
            debug!(device = %spec.device_path, id = existing.id, "reusing existing namespace");
            Ok(Ensured::existing(existing))
        }
        Err(e) => Err(CsiError::upstream("create namespace", e)),
    }
}

/// Push the undo action of a dataset this call created.
pub(crate) fn undo_dataset<'a>(
    rollback: &mut Rollback<'a>,
    client: &'a dyn ApplianceClient,
    name: &str,
) {
    let name = name.to_owned();
    rollback.push(format!("delete dataset {name}"), async move {
        client.delete_dataset(&name, true).await
    });
}
