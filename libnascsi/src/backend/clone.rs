//! Create a volume from a snapshot.
//!
//! The new dataset is either a copy-on-write clone or, with
//! `detachedVolumesFromSnapshots`, a full replicated copy.  A detached
//! snapshot is an ordinary dataset, so it is first snapshotted under a
//! temporary `csi-restore-<volume>` label and restored from that.  Once the
//! dataset exists the protocol's export half of the provisioning pipeline
//! runs on it; any failure from there on deletes the new dataset.

use tracing::{debug, info, warn};

use crate::appliance::{ApplianceError, Dataset};
use crate::error::CsiError;
use crate::handle::{Attachment, SnapshotHandle, VolumeHandle};
use crate::params::{KEY_PROTOCOL, Placement, ProtocolParams, VolumeParams};
use crate::provision::{effective_capacity, export_nfs, export_nvmeof, undo_dataset};
use crate::saga::Rollback;
use crate::types::{CreateVolumeRequest, SnapshotId, Volume, VolumeContentSource};

use super::snapshot::TEMP_RESTORE_PREFIX;
use super::volume::into_volume;
use super::{NasBackend, found};

/// How the new dataset is derived from its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloneMethod {
    CopyOnWrite,
    Replicate,
}

impl NasBackend {
    pub(super) async fn restore_snapshot(
        &self,
        req: &CreateVolumeRequest,
        snapshot_id: &SnapshotId,
        params: VolumeParams,
    ) -> Result<Volume, CsiError> {
        let snapshot = SnapshotHandle::decode(&snapshot_id.0)
            .map_err(|e| CsiError::NotFound(format!("snapshot {snapshot_id} ({e})")))?;

        let mut params = if params.protocol_explicit {
            if params.protocol.protocol() != snapshot.protocol {
                return Err(CsiError::InvalidArgument(format!(
                    "protocol {} does not match snapshot protocol {}",
                    params.protocol.protocol(),
                    snapshot.protocol
                )));
            }
            params
        } else {
            let mut inherited = req.parameters.clone();
            inherited.insert(KEY_PROTOCOL.to_owned(), snapshot.protocol.to_string());
            VolumeParams::parse(&inherited)?
        };

        // Restores land beside the source volume, never inside a snapshot
        // root.
        let placement = match params.placement.take() {
            Some(placement) => placement,
            None => Placement::beside(&snapshot.dataset_name)?,
        };
        let target = placement.dataset_path(&req.name);
        let method = if params.detached_clone {
            CloneMethod::Replicate
        } else {
            CloneMethod::CopyOnWrite
        };

        let origin = if snapshot.detached {
            let temp_label = format!("{TEMP_RESTORE_PREFIX}{}", req.name);
            self.ensure_temp_snapshot(&snapshot.snapshot_name, &temp_label)
                .await?
                .id
        } else {
            snapshot.snapshot_name.clone()
        };

        let cloned = self.clone_dataset(&origin, &target, method).await;
        if snapshot.detached {
            match (&cloned, method) {
                (Err(CsiError::DeadlineExceeded(_)), _) => {}
                // The clone's origin; it goes away with the detached dataset.
                (Ok(_), CloneMethod::CopyOnWrite) => {
                    debug!(snapshot = %origin, "keeping origin of copy-on-write clone");
                }
                _ => self.drop_temp_snapshot(&origin).await,
            }
        }
        let (dataset, created) = cloned?;

        let mut rollback = Rollback::new();
        if created {
            undo_dataset(&mut rollback, self.client(), &dataset.name);
        }

        if let Err(e) = self.inherit_attachment(&mut params.protocol, &snapshot) {
            rollback.unwind().await;
            return Err(e);
        }

        let provisioned = match &params.protocol {
            ProtocolParams::Nfs(nfs) => {
                export_nfs(self.client(), &req.name, &dataset, nfs, &mut rollback).await?
            }
            ProtocolParams::Nvmeof(nvme) => {
                export_nvmeof(self.client(), &req.name, &dataset, nvme, &mut rollback).await?
            }
        };
        rollback.commit();

        let capacity = dataset
            .volsize
            .unwrap_or_else(|| effective_capacity(req.capacity_bytes));
        let volume = into_volume(
            provisioned,
            capacity,
            Some(VolumeContentSource::Snapshot(snapshot_id.clone())),
        )?;
        info!(
            volume_id = %volume.volume_id,
            dataset = %dataset.name,
            snapshot = %snapshot.snapshot_name,
            "volume restored from snapshot"
        );
        Ok(volume)
    }

    /// Clone or replicate `origin` to `target`.
    ///
    /// Returns the dataset and whether this call created it.  A dataset
    /// left at `target` by an earlier attempt is reused when it derives from
    /// the same snapshot.
    async fn clone_dataset(
        &self,
        origin: &str,
        target: &str,
        method: CloneMethod,
    ) -> Result<(Dataset, bool), CsiError> {
        let result = match method {
            CloneMethod::CopyOnWrite => self.client().clone_snapshot(origin, target).await,
            CloneMethod::Replicate => {
                self.client()
                    .replicate_snapshot(origin, target, self.config.replication_timeout)
                    .await
            }
        };

        match result {
            Ok(dataset) => {
                if method == CloneMethod::Replicate {
                    self.drop_received_snapshot(origin, target).await;
                }
                Ok((dataset, true))
            }
            Err(ApplianceError::AlreadyExists(_)) => {
                let existing = self
                    .client()
                    .get_dataset(target)
                    .await
                    .map_err(|e| CsiError::upstream("look up existing clone", e))?;
                let same_origin = match method {
                    CloneMethod::CopyOnWrite => existing.origin.as_deref() == Some(origin),
                    CloneMethod::Replicate => existing.origin.is_none(),
                };
                if !same_origin {
                    return Err(CsiError::AlreadyExists(format!(
                        "dataset {target} does not derive from {origin}"
                    )));
                }
                debug!(%target, "reusing existing clone");
                Ok((existing, false))
            }
            Err(ApplianceError::NotFound(what)) => {
                Err(CsiError::NotFound(format!("{what} (restoring {origin})")))
            }
            Err(ApplianceError::Timeout(after)) => Err(CsiError::DeadlineExceeded(format!(
                "replicating {origin} to {target} did not finish within {after:?}"
            ))),
            Err(e) => Err(CsiError::upstream("clone snapshot", e)),
        }
    }

    /// A replicated copy arrives with the snapshot it was sent from; the
    /// restored volume does not need it.
    async fn drop_received_snapshot(&self, origin: &str, target: &str) {
        let Some((_, label)) = origin.rsplit_once('@') else {
            return;
        };
        let received = format!("{target}@{label}");
        match found(self.client().delete_snapshot(&received).await) {
            Ok(_) => debug!(snapshot = %received, "received snapshot dropped"),
            Err(e) => warn!(snapshot = %received, error = %e, "failed to drop received snapshot"),
        }
    }

    /// Fill in attachment parameters the request left out from the source
    /// volume's handle.
    fn inherit_attachment(
        &self,
        protocol: &mut ProtocolParams,
        snapshot: &SnapshotHandle,
    ) -> Result<(), CsiError> {
        let source = VolumeHandle::decode(&snapshot.source_volume).ok();

        if protocol.server().is_none() {
            let Some(source) = &source else {
                return Err(CsiError::InvalidArgument(format!(
                    "server is required: source volume {} of the snapshot is unknown",
                    snapshot.source_volume
                )));
            };
            let server = source.attachment.server().map(str::to_owned);
            match protocol {
                ProtocolParams::Nfs(nfs) => nfs.server = server,
                ProtocolParams::Nvmeof(nvme) => nvme.server = server,
            }
        }

        if let ProtocolParams::Nvmeof(nvme) = protocol
            && nvme.subsystem_nqn.is_none()
            && let Some(VolumeHandle {
                attachment: Attachment::Nvmeof { subsystem_nqn, .. },
                ..
            }) = &source
        {
            nvme.subsystem_nqn = subsystem_nqn
                .rsplit_once(':')
                .map(|(base, _)| base.to_owned());
        }
        Ok(())
    }
}
