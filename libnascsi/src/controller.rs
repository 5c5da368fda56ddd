//! CSI Controller service trait.
//!
//! The Controller service manages the centralized volume lifecycle on the
//! appliance: volume creation (empty or from a snapshot), deletion, and the
//! snapshot operations.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    CreateSnapshotRequest, CreateVolumeRequest, ListSnapshotsRequest, ListSnapshotsResponse,
    Snapshot, SnapshotId, Volume, VolumeId,
};

/// Controller service: centralized volume and snapshot management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, or restore one from a snapshot when
    /// `req.content_source` names it.
    ///
    /// The returned [`Volume`] contains the assigned `volume_id` and
    /// `volume_context` that must be forwarded to subsequent Node operations.
    /// Retrying with the same request converges on the same volume.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.
    ///
    /// Unknown ids and volumes that are already gone succeed.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Take a snapshot of a volume.
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError>;

    /// Delete a snapshot.  Unknown ids succeed.
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError>;

    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, CsiError>;
}
