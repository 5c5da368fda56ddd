//! Volume create and delete.

use tracing::{debug, info};

use crate::deprovision::deprovision;
use crate::error::CsiError;
use crate::handle::VolumeHandle;
use crate::params::{ProtocolParams, VolumeParams};
use crate::provision::{Provisioned, effective_capacity, provision_nfs, provision_nvmeof};
use crate::types::{CreateVolumeRequest, Volume, VolumeContentSource, VolumeId};

use super::NasBackend;

/// Volume and snapshot names become dataset path segments.
pub(super) fn validate_name(kind: &str, name: &str) -> Result<(), CsiError> {
    if name.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{kind} name is required")));
    }
    if name.contains(['/', '@', ' ']) {
        return Err(CsiError::InvalidArgument(format!(
            "{kind} name {name:?} contains '/', '@' or a space"
        )));
    }
    Ok(())
}

impl NasBackend {
    pub(super) async fn create_volume_inner(
        &self,
        req: CreateVolumeRequest,
    ) -> Result<Volume, CsiError> {
        validate_name("volume", &req.name)?;
        let params = VolumeParams::parse(&req.parameters)?;

        match &req.content_source {
            Some(VolumeContentSource::Snapshot(snapshot_id)) => {
                return self.restore_snapshot(&req, snapshot_id, params).await;
            }
            Some(VolumeContentSource::Volume(source)) => {
                return Err(CsiError::Unimplemented(format!(
                    "cloning from volume {source}"
                )));
            }
            None => {}
        }

        let placement = params.placement.ok_or_else(|| {
            CsiError::InvalidArgument("either pool or parentDataset is required".into())
        })?;
        let capacity = effective_capacity(req.capacity_bytes);
        let dataset = placement.dataset_path(&req.name);

        let provisioned = match &params.protocol {
            ProtocolParams::Nfs(nfs) => {
                provision_nfs(self.client(), &req.name, &dataset, capacity, nfs).await?
            }
            ProtocolParams::Nvmeof(nvme) => {
                provision_nvmeof(self.client(), &req.name, &dataset, capacity, nvme).await?
            }
        };

        let volume = into_volume(provisioned, capacity, None)?;
        info!(volume_id = %volume.volume_id, %dataset, "volume created");
        Ok(volume)
    }

    pub(super) async fn delete_volume_inner(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let handle = match VolumeHandle::decode(&volume_id.0) {
            Ok(handle) => handle,
            Err(e) => {
                debug!(%volume_id, error = %e, "unrecognized volume id, nothing to delete");
                return Ok(());
            }
        };

        let report = deprovision(self.client(), &handle).await;
        info!(dataset = %handle.dataset_name, %report, "volume deleted");
        Ok(())
    }
}

pub(super) fn into_volume(
    provisioned: Provisioned,
    capacity_bytes: u64,
    content_source: Option<VolumeContentSource>,
) -> Result<Volume, CsiError> {
    let volume_id = provisioned.handle.encode().map_err(CsiError::internal)?;
    Ok(Volume {
        volume_id: VolumeId(volume_id),
        capacity_bytes,
        volume_context: provisioned.context,
        content_source,
    })
}
