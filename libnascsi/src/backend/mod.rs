//! Appliance-backed controller.
//!
//! [`NasBackend`] implements [`CsiIdentity`] and [`CsiController`] on top of
//! an [`ApplianceClient`].  It keeps no state of its own apart from the
//! injected [`SnapshotRegistry`]: everything else is re-derived from handles
//! and fresh appliance queries.
//!
//! | Module | Operations |
//! |---|---|
//! | `volume` | create (empty), delete |
//! | `clone` | create from a snapshot |
//! | `snapshot` | create, delete, list; registry recovery |

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::appliance::{ApplianceClient, ApplianceError};
use crate::config::ControllerConfig;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::handle::VolumeHandle;
use crate::identity::CsiIdentity;
use crate::params::Protocol;
use crate::registry::SnapshotRegistry;
use crate::types::*;

mod clone;
mod snapshot;
mod volume;

pub use snapshot::{TEMP_DETACH_PREFIX, TEMP_RESTORE_PREFIX, is_temporary_label};

/// CSI controller backed by a ZFS NAS appliance.
///
/// # Thread safety
///
/// The backend is shared between concurrent requests.  The registry does its
/// own locking; the appliance client is required to be `Send + Sync`.
pub struct NasBackend {
    client: Arc<dyn ApplianceClient>,
    registry: Arc<dyn SnapshotRegistry>,
    config: ControllerConfig,
}

/// A volume resolved to its backing dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SourceVolume {
    /// Volume name; the dataset leaf for volumes this driver created.
    pub name: String,
    pub dataset: String,
    pub protocol: Protocol,
    /// Decoded handle, `None` for legacy ids.
    pub handle: Option<VolumeHandle>,
}

impl NasBackend {
    /// Create a new backend.
    ///
    /// Call [`Self::recover`] afterwards to rebuild the snapshot registry
    /// from the appliance inventory.
    pub fn new(
        client: Arc<dyn ApplianceClient>,
        registry: Arc<dyn SnapshotRegistry>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn SnapshotRegistry> {
        &self.registry
    }

    fn client(&self) -> &dyn ApplianceClient {
        self.client.as_ref()
    }

    /// Find the dataset behind a volume id.
    ///
    /// Ids that are not handles are matched against the share and namespace
    /// inventories: a share whose path ends in `/<id>`, or a namespace whose
    /// device path does.
    pub(crate) async fn resolve_source(&self, volume_id: &str) -> Result<SourceVolume, CsiError> {
        if volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("empty source volume id".into()));
        }
        match VolumeHandle::decode(volume_id) {
            Ok(handle) => {
                return Ok(SourceVolume {
                    name: handle.name.clone(),
                    dataset: handle.dataset_name.clone(),
                    protocol: handle.protocol(),
                    handle: Some(handle),
                });
            }
            Err(e) => debug!(%volume_id, error = %e, "not a volume handle, trying legacy lookup"),
        }

        let suffix = format!("/{volume_id}");
        let shares = self
            .client()
            .query_nfs_shares("")
            .await
            .map_err(|e| CsiError::upstream("query nfs shares", e))?;
        if let Some(share) = shares.iter().find(|s| s.path.ends_with(&suffix)) {
            let datasets = self
                .client()
                .query_datasets("")
                .await
                .map_err(|e| CsiError::upstream("query datasets", e))?;
            if let Some(dataset) = datasets
                .into_iter()
                .find(|d| d.mountpoint.as_deref() == Some(share.path.as_str()))
            {
                return Ok(SourceVolume {
                    name: volume_id.to_owned(),
                    dataset: dataset.name,
                    protocol: Protocol::Nfs,
                    handle: None,
                });
            }
        }

        let namespaces = self
            .client()
            .query_namespaces()
            .await
            .map_err(|e| CsiError::upstream("query namespaces", e))?;
        if let Some(dataset) = namespaces
            .iter()
            .filter(|n| n.device_path.ends_with(&suffix))
            .find_map(|n| n.device_path.strip_prefix("zvol/"))
        {
            return Ok(SourceVolume {
                name: volume_id.to_owned(),
                dataset: dataset.to_owned(),
                protocol: Protocol::Nvmeof,
                handle: None,
            });
        }

        Err(CsiError::NotFound(format!("volume {volume_id}")))
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for NasBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config.plugin_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        match self.client().ping().await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, "appliance did not answer probe");
                Ok(false)
            }
        }
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }

    async fn get_controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::CreateDeleteSnapshot,
            ControllerCapability::ListSnapshots,
            ControllerCapability::CloneVolume,
        ])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for NasBackend {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        self.create_volume_inner(req).await
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.delete_volume_inner(volume_id).await
    }

    #[instrument(skip(self, req), fields(name = %req.name, source = %req.source_volume_id))]
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        self.create_snapshot_inner(req).await
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        self.delete_snapshot_inner(snapshot_id).await
    }

    #[instrument(skip(self))]
    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, CsiError> {
        self.list_snapshots_inner(req).await
    }
}

/// Appliance `NotFound` as `Ok(None)`.
pub(crate) fn found<T>(result: Result<T, ApplianceError>) -> Result<Option<T>, ApplianceError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
