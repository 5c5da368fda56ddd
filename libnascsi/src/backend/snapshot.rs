//! Snapshot create, delete and list, plus registry recovery.
//!
//! Native snapshots live on the source dataset as `<dataset>@<label>`.
//! Detached snapshots are independent datasets laid out as
//!
//! ```text
//! <root>/
//!   <container>/    # the source dataset path, escaped; created on demand
//!     <label>       # replicated copy of <dataset>@csi-detach-<label>
//! ```
//!
//! The replicated copy keeps the received `@csi-detach-<label>` snapshot.
//! That snapshot is what marks the dataset as a detached snapshot, and its
//! creation time is the creation time of the detached snapshot.  Detached
//! snapshots are found by this marker wherever their root is.

use std::collections::HashMap;
use std::fmt::Write;

use tracing::{debug, info, warn};

use crate::appliance::{
    ApplianceError, Dataset, DatasetKind, DatasetSpec, SnapshotFilter, ZfsSnapshot,
};
use crate::error::CsiError;
use crate::handle::SnapshotHandle;
use crate::params::{Protocol, SnapshotParams};
use crate::provision::ensure_dataset;
use crate::registry::{Registration, RegistryConflict};
use crate::types::{
    CreateSnapshotRequest, ListSnapshotsRequest, ListSnapshotsResponse, Snapshot, SnapshotId,
    VolumeId,
};

use super::volume::validate_name;
use super::{NasBackend, SourceVolume, found};

/// Label prefix of the temporary snapshot a detached snapshot is replicated
/// from.
pub const TEMP_DETACH_PREFIX: &str = "csi-detach-";

/// Label prefix of the temporary snapshot a detached snapshot is restored
/// from.
pub const TEMP_RESTORE_PREFIX: &str = "csi-restore-";

/// Temporary snapshots are never listed nor registered.
pub fn is_temporary_label(label: &str) -> bool {
    label.starts_with(TEMP_DETACH_PREFIX) || label.starts_with(TEMP_RESTORE_PREFIX)
}

/// Dataset segment a source dataset's detached snapshots are grouped under.
///
/// `/` becomes `_-`, `_` becomes `__`, and any other character outside
/// `[A-Za-z0-9-.:]` becomes `_` and six hex digits, so distinct datasets
/// never share a container.
pub(super) fn container_name(dataset: &str) -> String {
    let mut container = String::with_capacity(dataset.len() + 8);
    for c in dataset.chars() {
        match c {
            '/' => container.push_str("_-"),
            '_' => container.push_str("__"),
            c if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':') => container.push(c),
            c => {
                let _ = write!(container, "_{:06x}", u32::from(c));
            }
        }
    }
    container
}

/// The source dataset a container was named after.
fn container_source(container: &str) -> Option<String> {
    let mut dataset = String::with_capacity(container.len());
    let mut chars = container.chars();
    while let Some(c) = chars.next() {
        if c != '_' {
            dataset.push(c);
            continue;
        }
        match chars.next()? {
            '-' => dataset.push('/'),
            '_' => dataset.push('_'),
            first => {
                let hex: String = std::iter::once(first).chain(chars.by_ref().take(5)).collect();
                if hex.len() != 6 {
                    return None;
                }
                dataset.push(char::from_u32(u32::from_str_radix(&hex, 16).ok()?)?);
            }
        }
    }
    Some(dataset)
}

/// A detached snapshot found in the appliance inventory.
struct DetachedCopy<'a> {
    dataset: &'a Dataset,
    /// Dataset the snapshot was taken from.
    source: String,
    label: &'a str,
    created_at: i64,
}

/// Detached snapshots: datasets `<root>/<container>/<label>` without an
/// origin that still hold their received `@csi-detach-<label>` snapshot.
fn detached_copies<'a>(
    datasets: &'a [Dataset],
    snapshots: &'a [ZfsSnapshot],
) -> Vec<DetachedCopy<'a>> {
    let by_name: HashMap<&str, &Dataset> =
        datasets.iter().map(|d| (d.name.as_str(), d)).collect();
    snapshots
        .iter()
        .filter_map(|marker| {
            let label = marker.label.strip_prefix(TEMP_DETACH_PREFIX)?;
            let (parent, leaf) = marker.dataset.rsplit_once('/')?;
            let (_, container) = parent.rsplit_once('/')?;
            // Volumes always sit below a parent, so a real source has a '/'.
            let source = container_source(container).filter(|s| s.contains('/'))?;
            let dataset = by_name
                .get(marker.dataset.as_str())
                .copied()
                .filter(|d| d.origin.is_none())?;
            (leaf == label).then_some(DetachedCopy {
                dataset,
                source,
                label,
                created_at: marker.created_at,
            })
        })
        .collect()
}

fn kind_protocol(kind: DatasetKind) -> Protocol {
    match kind {
        DatasetKind::Filesystem => Protocol::Nfs,
        DatasetKind::Volume => Protocol::Nvmeof,
    }
}

fn to_entry(handle: &SnapshotHandle, size_bytes: u64) -> Result<Snapshot, CsiError> {
    Ok(Snapshot {
        snapshot_id: SnapshotId(handle.encode().map_err(CsiError::internal)?),
        source_volume_id: VolumeId(handle.source_volume.clone()),
        creation_time: handle.created_at,
        size_bytes,
        ready_to_use: true,
    })
}

fn conflict(e: RegistryConflict) -> CsiError {
    CsiError::AlreadyExists(e.to_string())
}

impl NasBackend {
    // ----- create ----------------------------------------------------------

    pub(super) async fn create_snapshot_inner(
        &self,
        req: CreateSnapshotRequest,
    ) -> Result<Snapshot, CsiError> {
        validate_name("snapshot", &req.name)?;
        if is_temporary_label(&req.name) {
            return Err(CsiError::InvalidArgument(format!(
                "snapshot name {:?} uses a reserved prefix",
                req.name
            )));
        }
        let params = SnapshotParams::parse(
            &req.parameters,
            self.config.snapshot_parent_dataset.as_deref(),
        )?;
        let source = self.resolve_source(&req.source_volume_id).await?;

        let registration = self
            .registry
            .register(&req.name, &source.dataset)
            .map_err(conflict)?;

        let result = match &params {
            SnapshotParams::Native => self.take_native(&req, &source).await,
            SnapshotParams::Detached { root } => self.take_detached(&req, &source, root).await,
        };

        match result {
            Ok(snapshot) => {
                info!(label = %req.name, dataset = %source.dataset, "snapshot created");
                Ok(snapshot)
            }
            // The replication may still land; keep the name reserved.
            Err(e @ CsiError::DeadlineExceeded(_)) => Err(e),
            Err(e) => {
                if registration == Registration::Inserted {
                    self.registry.unregister(&req.name);
                }
                Err(e)
            }
        }
    }

    async fn take_native(
        &self,
        req: &CreateSnapshotRequest,
        source: &SourceVolume,
    ) -> Result<Snapshot, CsiError> {
        let snapshot_name = format!("{}@{}", source.dataset, req.name);
        let existing = self
            .client()
            .query_snapshots(&SnapshotFilter::Id(snapshot_name.clone()))
            .await
            .map_err(|e| CsiError::upstream("query snapshots", e))?;

        let snap = match existing.into_iter().next() {
            Some(snap) => {
                debug!(%snapshot_name, "snapshot already exists");
                snap
            }
            None => self
                .client()
                .create_snapshot(&source.dataset, &req.name)
                .await
                .map_err(|e| CsiError::upstream("create snapshot", e))?,
        };

        let handle = SnapshotHandle {
            snapshot_name,
            source_volume: req.source_volume_id.clone(),
            dataset_name: source.dataset.clone(),
            protocol: source.protocol,
            detached: false,
            created_at: snap.created_at,
        };
        to_entry(&handle, snap.used_bytes)
    }

    async fn take_detached(
        &self,
        req: &CreateSnapshotRequest,
        source: &SourceVolume,
        root: &str,
    ) -> Result<Snapshot, CsiError> {
        let container = format!("{root}/{}", container_name(&source.dataset));
        let target = format!("{container}/{}", req.name);
        let temp_label = format!("{TEMP_DETACH_PREFIX}{}", req.name);

        let existing = found(self.client().get_dataset(&target).await)
            .map_err(|e| CsiError::upstream("look up detached snapshot", e))?;
        let copy = match existing {
            Some(copy) => {
                debug!(%target, "detached snapshot already exists");
                copy
            }
            None => {
                ensure_dataset(self.client(), &DatasetSpec::filesystem(&container, None)).await?;
                self.replicate_detached(&source.dataset, &temp_label, &target)
                    .await?
            }
        };

        let marker = self
            .client()
            .query_snapshots(&SnapshotFilter::Id(format!("{target}@{temp_label}")))
            .await
            .map_err(|e| CsiError::upstream("query snapshots", e))?
            .into_iter()
            .next()
            .filter(|_| copy.origin.is_none())
            .ok_or_else(|| {
                CsiError::AlreadyExists(format!("dataset {target} is not a detached snapshot"))
            })?;

        let handle = SnapshotHandle {
            snapshot_name: target,
            source_volume: req.source_volume_id.clone(),
            dataset_name: source.dataset.clone(),
            protocol: source.protocol,
            detached: true,
            created_at: marker.created_at,
        };
        to_entry(&handle, copy.used_bytes)
    }

    /// Temporary snapshot, full replication, then drop the temporary
    /// snapshot.
    async fn replicate_detached(
        &self,
        dataset: &str,
        temp_label: &str,
        target: &str,
    ) -> Result<Dataset, CsiError> {
        let temp = self.ensure_temp_snapshot(dataset, temp_label).await?;

        let copy = match self
            .client()
            .replicate_snapshot(&temp.id, target, self.config.replication_timeout)
            .await
        {
            Ok(copy) => copy,
            Err(ApplianceError::Timeout(after)) => {
                return Err(CsiError::DeadlineExceeded(format!(
                    "replicating {} to {target} did not finish within {after:?}",
                    temp.id
                )));
            }
            Err(e) => {
                self.drop_temp_snapshot(&temp.id).await;
                return Err(CsiError::upstream("replicate snapshot", e));
            }
        };

        self.drop_temp_snapshot(&temp.id).await;
        Ok(copy)
    }

    /// Create `<dataset>@<label>`, reusing it when a previous attempt left it
    /// behind.
    pub(super) async fn ensure_temp_snapshot(
        &self,
        dataset: &str,
        label: &str,
    ) -> Result<ZfsSnapshot, CsiError> {
        match self.client().create_snapshot(dataset, label).await {
            Ok(snap) => Ok(snap),
            Err(ApplianceError::AlreadyExists(_)) => {
                let id = format!("{dataset}@{label}");
                self.client()
                    .query_snapshots(&SnapshotFilter::Id(id.clone()))
                    .await
                    .map_err(|e| CsiError::upstream("query snapshots", e))?
                    .into_iter()
                    .next()
                    .ok_or_else(|| CsiError::Internal(format!("snapshot {id} vanished")))
            }
            Err(e) => Err(CsiError::upstream("create temporary snapshot", e)),
        }
    }

    pub(super) async fn drop_temp_snapshot(&self, id: &str) {
        match self.client().delete_snapshot(id).await {
            Ok(()) => debug!(snapshot = %id, "temporary snapshot deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(snapshot = %id, error = %e, "failed to delete temporary snapshot"),
        }
    }

    // ----- delete ----------------------------------------------------------

    pub(super) async fn delete_snapshot_inner(
        &self,
        snapshot_id: &SnapshotId,
    ) -> Result<(), CsiError> {
        let handle = match SnapshotHandle::decode(&snapshot_id.0) {
            Ok(handle) => handle,
            Err(e) => {
                debug!(%snapshot_id, error = %e, "unrecognized snapshot id, nothing to delete");
                return Ok(());
            }
        };

        if handle.detached {
            self.delete_detached(&handle).await?;
            if let Some((container, _)) = handle.snapshot_name.rsplit_once('/') {
                self.drop_empty_container(container).await;
            }
        } else {
            found(self.client().delete_snapshot(&handle.snapshot_name).await)
                .map_err(|e| CsiError::upstream("delete snapshot", e))?;
        }

        // Only release the label if this snapshot is the one holding it.
        let label = handle.label();
        if self
            .registry
            .lookup(label)
            .is_some_and(|owner| owner == handle.dataset_name || owner == handle.snapshot_name)
        {
            self.registry.unregister(label);
        }
        info!(snapshot = %handle.snapshot_name, "snapshot deleted");
        Ok(())
    }

    /// Recursively delete a detached snapshot dataset, refusing anything
    /// that does not carry the received marker snapshot.
    async fn delete_detached(&self, handle: &SnapshotHandle) -> Result<(), CsiError> {
        let Some(copy) = found(self.client().get_dataset(&handle.snapshot_name).await)
            .map_err(|e| CsiError::upstream("look up detached snapshot", e))?
        else {
            return Ok(());
        };

        let marker = format!("{}@{TEMP_DETACH_PREFIX}{}", copy.name, handle.label());
        let marked = !self
            .client()
            .query_snapshots(&SnapshotFilter::Id(marker))
            .await
            .map_err(|e| CsiError::upstream("query snapshots", e))?
            .is_empty();
        if copy.origin.is_some() || !marked {
            return Err(CsiError::InvalidArgument(format!(
                "dataset {} is not a detached snapshot",
                copy.name
            )));
        }

        found(self.client().delete_dataset(&copy.name, true).await)
            .map_err(|e| CsiError::upstream("delete detached snapshot", e))?;
        Ok(())
    }

    async fn drop_empty_container(&self, container: &str) {
        let children = match self
            .client()
            .query_datasets(&format!("{container}/"))
            .await
        {
            Ok(children) => children,
            Err(e) => {
                warn!(%container, error = %e, "failed to inspect snapshot container");
                return;
            }
        };
        if !children.is_empty() {
            return;
        }
        match self.client().delete_dataset(container, false).await {
            Ok(()) => debug!(%container, "empty snapshot container deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(%container, error = %e, "failed to delete snapshot container"),
        }
    }

    // ----- list ------------------------------------------------------------

    pub(super) async fn list_snapshots_inner(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, CsiError> {
        let offset = match req.starting_token.as_deref().map(str::trim) {
            None | Some("") => 0,
            Some(token) => token.parse::<usize>().map_err(|e| {
                CsiError::InvalidArgument(format!("invalid starting token {token:?}: {e}"))
            })?,
        };

        let entries = if let Some(snapshot_id) = &req.snapshot_id {
            self.list_by_id(snapshot_id).await?
        } else if let Some(volume_id) = &req.source_volume_id {
            self.list_by_source(volume_id).await?
        } else {
            self.list_all().await?
        };

        paginate(entries, offset, req.max_entries)
    }

    async fn list_by_id(&self, snapshot_id: &SnapshotId) -> Result<Vec<Snapshot>, CsiError> {
        let Ok(handle) = SnapshotHandle::decode(&snapshot_id.0) else {
            debug!(%snapshot_id, "unrecognized snapshot id, listing nothing");
            return Ok(Vec::new());
        };

        let size = if handle.detached {
            found(self.client().get_dataset(&handle.snapshot_name).await)
                .map_err(|e| CsiError::upstream("look up detached snapshot", e))?
                .map(|copy| copy.used_bytes)
        } else {
            self.client()
                .query_snapshots(&SnapshotFilter::Id(handle.snapshot_name.clone()))
                .await
                .map_err(|e| CsiError::upstream("query snapshots", e))?
                .first()
                .map(|snap| snap.used_bytes)
        };

        match size {
            Some(size) => Ok(vec![Snapshot {
                snapshot_id: snapshot_id.clone(),
                ..to_entry(&handle, size)?
            }]),
            None => Ok(Vec::new()),
        }
    }

    async fn list_by_source(&self, volume_id: &VolumeId) -> Result<Vec<Snapshot>, CsiError> {
        let source = match self.resolve_source(&volume_id.0).await {
            Ok(source) => source,
            Err(e @ CsiError::Upstream { .. }) => return Err(e),
            Err(e) => {
                debug!(%volume_id, error = %e, "unresolvable source volume, listing nothing");
                return Ok(Vec::new());
            }
        };
        let (snapshots, datasets) = self.inventory().await?;

        let mut entries = Vec::new();
        let native = snapshots
            .iter()
            .filter(|s| s.dataset == source.dataset && !is_temporary_label(&s.label));
        for snap in native {
            let handle = SnapshotHandle {
                snapshot_name: snap.id.clone(),
                source_volume: volume_id.0.clone(),
                dataset_name: source.dataset.clone(),
                protocol: source.protocol,
                detached: false,
                created_at: snap.created_at,
            };
            entries.push(to_entry(&handle, snap.used_bytes)?);
        }

        let detached = detached_copies(&datasets, &snapshots)
            .into_iter()
            .filter(|copy| copy.source == source.dataset);
        for copy in detached {
            let handle = SnapshotHandle {
                snapshot_name: copy.dataset.name.clone(),
                source_volume: volume_id.0.clone(),
                dataset_name: copy.source,
                protocol: source.protocol,
                detached: true,
                created_at: copy.created_at,
            };
            entries.push(to_entry(&handle, copy.dataset.used_bytes)?);
        }
        Ok(entries)
    }

    /// Every snapshot on the appliance, with the source dataset name
    /// standing in for the source volume id.
    async fn list_all(&self) -> Result<Vec<Snapshot>, CsiError> {
        let (snapshots, datasets) = self.inventory().await?;
        let kinds: HashMap<&str, DatasetKind> =
            datasets.iter().map(|d| (d.name.as_str(), d.kind)).collect();

        let mut entries = Vec::new();
        for snap in snapshots.iter().filter(|s| !is_temporary_label(&s.label)) {
            let handle = SnapshotHandle {
                snapshot_name: snap.id.clone(),
                source_volume: snap.dataset.clone(),
                dataset_name: snap.dataset.clone(),
                protocol: kinds
                    .get(snap.dataset.as_str())
                    .map_or(Protocol::Nfs, |kind| kind_protocol(*kind)),
                detached: false,
                created_at: snap.created_at,
            };
            entries.push(to_entry(&handle, snap.used_bytes)?);
        }

        for copy in detached_copies(&datasets, &snapshots) {
            let handle = SnapshotHandle {
                snapshot_name: copy.dataset.name.clone(),
                source_volume: copy.source.clone(),
                dataset_name: copy.source,
                protocol: kind_protocol(copy.dataset.kind),
                detached: true,
                created_at: copy.created_at,
            };
            entries.push(to_entry(&handle, copy.dataset.used_bytes)?);
        }
        Ok(entries)
    }

    async fn inventory(&self) -> Result<(Vec<ZfsSnapshot>, Vec<Dataset>), CsiError> {
        let snapshots = self
            .client()
            .query_snapshots(&SnapshotFilter::All)
            .await
            .map_err(|e| CsiError::upstream("query snapshots", e))?;
        let datasets = self
            .client()
            .query_datasets("")
            .await
            .map_err(|e| CsiError::upstream("query datasets", e))?;
        Ok((snapshots, datasets))
    }

    // ----- recovery --------------------------------------------------------

    /// Rebuild the snapshot registry from the appliance inventory.
    ///
    /// Native snapshot labels are claimed by their dataset, detached
    /// snapshots by the source dataset their container is named after.
    /// Conflicting labels are skipped; the first owner wins.  Returns the
    /// number of labels registered.
    pub async fn recover(&self) -> Result<usize, CsiError> {
        let (snapshots, datasets) = self.inventory().await?;

        let mut restored = 0;
        for snap in snapshots.iter().filter(|s| !is_temporary_label(&s.label)) {
            restored += self.reclaim(&snap.label, &snap.dataset);
        }
        for copy in detached_copies(&datasets, &snapshots) {
            restored += self.reclaim(copy.label, &copy.source);
        }

        info!(restored, total = self.registry.len(), "snapshot registry recovered");
        Ok(restored)
    }

    fn reclaim(&self, label: &str, owner: &str) -> usize {
        match self.registry.register(label, owner) {
            Ok(Registration::Inserted) => 1,
            Ok(Registration::AlreadyHeld) => 0,
            Err(e) => {
                warn!(%label, dataset = %owner, error = %e, "conflicting snapshot label, skipped");
                0
            }
        }
    }
}

fn paginate(
    entries: Vec<Snapshot>,
    offset: usize,
    max_entries: u32,
) -> Result<ListSnapshotsResponse, CsiError> {
    if offset > entries.len() {
        return Err(CsiError::InvalidArgument(format!(
            "starting token {offset} is past the end of {} snapshots",
            entries.len()
        )));
    }
    let limit = match max_entries {
        0 => usize::MAX,
        n => n as usize,
    };
    let end = offset.saturating_add(limit).min(entries.len());
    let next_token = (end < entries.len()).then(|| end.to_string());
    Ok(ListSnapshotsResponse {
        entries: entries.into_iter().skip(offset).take(end - offset).collect(),
        next_token,
    })
}
