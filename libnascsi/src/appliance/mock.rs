//! In-memory appliance used by tests and local development.
//!
//! [`MockAppliance`] keeps every resource kind in its own [`DashMap`] and
//! enforces the rules the orchestrator depends on:
//!
//! - a dataset can only be created below an existing parent dataset;
//! - a snapshot with dependent clones cannot be destroyed, nor can the
//!   dataset holding it;
//! - a subsystem that still has namespaces cannot be deleted;
//! - creating anything whose identity is taken fails with `AlreadyExists`.
//!
//! Every call is appended to an ordered call log, and failures can be
//! injected per [`Op`], optionally restricted to one target.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::*;

/// NQN prefix used when a subsystem is created without an explicit NQN.
pub const MOCK_NQN_BASE: &str = "nqn.2011-06.org.example.nas";

const EPOCH: i64 = 1_700_000_000;

/// Appliance operations, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Ping,
    CreateDataset,
    GetDataset,
    DeleteDataset,
    QueryDatasets,
    CreateNfsShare,
    DeleteNfsShare,
    QueryNfsShares,
    CreateSubsystem,
    DeleteSubsystem,
    QuerySubsystems,
    CreateNamespace,
    DeleteNamespace,
    QueryNamespaces,
    CreateSnapshot,
    DeleteSnapshot,
    QuerySnapshots,
    CloneSnapshot,
    ReplicateSnapshot,
}

impl Op {
    /// Whether the operation mutates appliance state.
    pub fn is_mutation(self) -> bool {
        !matches!(
            self,
            Op::Ping
                | Op::GetDataset
                | Op::QueryDatasets
                | Op::QueryNfsShares
                | Op::QuerySubsystems
                | Op::QueryNamespaces
                | Op::QuerySnapshots
        )
    }

    pub fn is_delete(self) -> bool {
        matches!(
            self,
            Op::DeleteDataset
                | Op::DeleteNfsShare
                | Op::DeleteSubsystem
                | Op::DeleteNamespace
                | Op::DeleteSnapshot
        )
    }
}

#[derive(Debug)]
struct Fault {
    op: Op,
    target: Option<String>,
    error: ApplianceError,
    persistent: bool,
}

/// In-memory [`ApplianceClient`].
#[derive(Debug)]
pub struct MockAppliance {
    datasets: DashMap<String, Dataset>,
    shares: DashMap<u64, NfsShare>,
    subsystems: DashMap<u64, NvmeSubsystem>,
    namespaces: DashMap<u64, NvmeNamespace>,
    snapshots: DashMap<String, ZfsSnapshot>,
    next_id: AtomicU64,
    clock: AtomicI64,
    calls: Mutex<Vec<(Op, String)>>,
    faults: Mutex<Vec<Fault>>,
    replication_delay: Mutex<Duration>,
}

impl Default for MockAppliance {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAppliance {
    /// An empty appliance without any pool.
    pub fn new() -> Self {
        Self {
            datasets: DashMap::new(),
            shares: DashMap::new(),
            subsystems: DashMap::new(),
            namespaces: DashMap::new(),
            snapshots: DashMap::new(),
            next_id: AtomicU64::new(1),
            clock: AtomicI64::new(EPOCH),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            replication_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Add a pool (its root filesystem dataset).
    pub fn with_pool(self, pool: &str) -> Self {
        let root = self.materialize(pool, DatasetKind::Filesystem, None, None, None, None);
        self.datasets.insert(pool.to_owned(), root);
        self
    }

    // ----- fault injection -------------------------------------------------

    /// Fail the next call of `op` with `error`.
    pub fn fail_next(&self, op: Op, error: ApplianceError) {
        self.push_fault(op, None, error, false);
    }

    /// Fail the next call of `op` on `target` with `error`.
    pub fn fail_next_on(&self, op: Op, target: &str, error: ApplianceError) {
        self.push_fault(op, Some(target.to_owned()), error, false);
    }

    /// Fail every call of `op` with `error` until [`Self::clear_faults`].
    pub fn fail_always(&self, op: Op, error: ApplianceError) {
        self.push_fault(op, None, error, true);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Make replication take `delay` (honours the per-call timeout).
    pub fn set_replication_delay(&self, delay: Duration) {
        *self.replication_delay.lock() = delay;
    }

    fn push_fault(&self, op: Op, target: Option<String>, error: ApplianceError, persistent: bool) {
        self.faults.lock().push(Fault {
            op,
            target,
            error,
            persistent,
        });
    }

    // ----- inspection ------------------------------------------------------

    /// Every call made so far, in order, with its target.
    pub fn calls(&self) -> Vec<(Op, String)> {
        self.calls.lock().clone()
    }

    /// Mutating calls only, in order.
    pub fn mutations(&self) -> Vec<(Op, String)> {
        self.calls()
            .into_iter()
            .filter(|(op, _)| op.is_mutation())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn dataset(&self, name: &str) -> Option<Dataset> {
        self.datasets.get(name).map(|d| d.clone())
    }

    pub fn has_dataset(&self, name: &str) -> bool {
        self.datasets.contains_key(name)
    }

    pub fn has_snapshot(&self, id: &str) -> bool {
        self.snapshots.contains_key(id)
    }

    pub fn shares(&self) -> Vec<NfsShare> {
        self.shares.iter().map(|s| s.value().clone()).collect()
    }

    pub fn subsystems(&self) -> Vec<NvmeSubsystem> {
        self.subsystems.iter().map(|s| s.value().clone()).collect()
    }

    pub fn namespaces(&self) -> Vec<NvmeNamespace> {
        self.namespaces.iter().map(|n| n.value().clone()).collect()
    }

    // ----- internals -------------------------------------------------------

    /// Record the call, then fire a matching injected fault if any.
    fn enter(&self, op: Op, target: &str) -> Result<(), ApplianceError> {
        self.calls.lock().push((op, target.to_owned()));

        let mut faults = self.faults.lock();
        let hit = faults
            .iter()
            .position(|f| f.op == op && f.target.as_deref().is_none_or(|t| t == target));
        match hit {
            Some(pos) if faults[pos].persistent => Err(faults[pos].error.clone()),
            Some(pos) => Err(faults.remove(pos).error),
            None => Ok(()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn materialize(
        &self,
        name: &str,
        kind: DatasetKind,
        volsize: Option<u64>,
        volblocksize: Option<String>,
        refquota: Option<u64>,
        origin: Option<String>,
    ) -> Dataset {
        Dataset {
            id: name.to_owned(),
            name: name.to_owned(),
            kind,
            mountpoint: (kind == DatasetKind::Filesystem).then(|| format!("/mnt/{name}")),
            volsize,
            volblocksize,
            refquota,
            origin,
            used_bytes: 0,
        }
    }

    fn check_parent(&self, name: &str) -> Result<(), ApplianceError> {
        match name.rsplit_once('/') {
            Some((parent, _)) if !self.datasets.contains_key(parent) => {
                Err(ApplianceError::NotFound(format!("parent dataset {parent}")))
            }
            _ => Ok(()),
        }
    }

    /// Insert `dataset` unless its name is taken.
    fn insert_dataset(&self, dataset: Dataset) -> Result<Dataset, ApplianceError> {
        use dashmap::mapref::entry::Entry;

        match self.datasets.entry(dataset.name.clone()) {
            Entry::Occupied(_) => Err(ApplianceError::AlreadyExists(format!(
                "dataset {}",
                dataset.name
            ))),
            Entry::Vacant(slot) => {
                slot.insert(dataset.clone());
                Ok(dataset)
            }
        }
    }

    fn insert_snapshot(&self, dataset: &str, label: &str) -> Result<ZfsSnapshot, ApplianceError> {
        use dashmap::mapref::entry::Entry;

        let id = format!("{dataset}@{label}");
        match self.snapshots.entry(id.clone()) {
            Entry::Occupied(_) => Err(ApplianceError::AlreadyExists(format!("snapshot {id}"))),
            Entry::Vacant(slot) => {
                let snapshot = ZfsSnapshot {
                    id,
                    dataset: dataset.to_owned(),
                    label: label.to_owned(),
                    created_at: self.clock.fetch_add(1, Ordering::Relaxed),
                    used_bytes: 0,
                };
                slot.insert(snapshot.clone());
                Ok(snapshot)
            }
        }
    }

    /// Datasets with an origin snapshot in `snapshot_ids`, excluding `doomed`.
    fn dependent_clones(&self, snapshot_ids: &[String], doomed: &[String]) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|d| !doomed.contains(&d.name))
            .filter(|d| d.origin.as_ref().is_some_and(|o| snapshot_ids.contains(o)))
            .map(|d| d.name.clone())
            .collect()
    }

    fn snapshot_source(&self, snapshot: &str) -> Result<(ZfsSnapshot, Dataset), ApplianceError> {
        let snap = self
            .snapshots
            .get(snapshot)
            .map(|s| s.clone())
            .ok_or_else(|| ApplianceError::NotFound(format!("snapshot {snapshot}")))?;
        let source = self
            .datasets
            .get(&snap.dataset)
            .map(|d| d.clone())
            .ok_or_else(|| ApplianceError::NotFound(format!("dataset {}", snap.dataset)))?;
        Ok((snap, source))
    }
}

fn is_within(name: &str, root: &str) -> bool {
    name == root
        || name
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait]
impl ApplianceClient for MockAppliance {
    async fn ping(&self) -> Result<(), ApplianceError> {
        self.enter(Op::Ping, "")
    }

    async fn create_dataset(&self, spec: &DatasetSpec) -> Result<Dataset, ApplianceError> {
        self.enter(Op::CreateDataset, &spec.name)?;
        self.check_parent(&spec.name)?;
        let dataset = self.materialize(
            &spec.name,
            spec.kind,
            spec.volsize,
            spec.volblocksize.clone(),
            spec.refquota,
            None,
        );
        self.insert_dataset(dataset)
    }

    async fn get_dataset(&self, name: &str) -> Result<Dataset, ApplianceError> {
        self.enter(Op::GetDataset, name)?;
        self.dataset(name)
            .ok_or_else(|| ApplianceError::NotFound(format!("dataset {name}")))
    }

    async fn delete_dataset(&self, name: &str, recursive: bool) -> Result<(), ApplianceError> {
        self.enter(Op::DeleteDataset, name)?;
        if !self.datasets.contains_key(name) {
            return Err(ApplianceError::NotFound(format!("dataset {name}")));
        }

        let doomed: Vec<String> = self
            .datasets
            .iter()
            .filter(|d| is_within(&d.name, name))
            .map(|d| d.name.clone())
            .collect();
        let doomed_snapshots: Vec<String> = self
            .snapshots
            .iter()
            .filter(|s| doomed.contains(&s.dataset))
            .map(|s| s.id.clone())
            .collect();

        if !recursive && (doomed.len() > 1 || !doomed_snapshots.is_empty()) {
            return Err(ApplianceError::Request(format!(
                "dataset {name} has children or snapshots"
            )));
        }
        let dependents = self.dependent_clones(&doomed_snapshots, &doomed);
        if !dependents.is_empty() {
            return Err(ApplianceError::Request(format!(
                "dataset {name} has dependent clones: {}",
                dependents.join(", ")
            )));
        }

        for id in &doomed_snapshots {
            self.snapshots.remove(id);
        }
        for dataset in &doomed {
            self.datasets.remove(dataset);
        }
        Ok(())
    }

    async fn query_datasets(&self, prefix: &str) -> Result<Vec<Dataset>, ApplianceError> {
        self.enter(Op::QueryDatasets, prefix)?;
        let mut found: Vec<Dataset> = self
            .datasets
            .iter()
            .filter(|d| d.name.starts_with(prefix))
            .map(|d| d.clone())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn create_nfs_share(&self, spec: &NfsShareSpec) -> Result<NfsShare, ApplianceError> {
        self.enter(Op::CreateNfsShare, &spec.path)?;
        if self.shares.iter().any(|s| s.path == spec.path) {
            return Err(ApplianceError::AlreadyExists(format!(
                "nfs share {}",
                spec.path
            )));
        }
        let share = NfsShare {
            id: self.next_id(),
            path: spec.path.clone(),
            comment: spec.comment.clone(),
            enabled: true,
        };
        self.shares.insert(share.id, share.clone());
        Ok(share)
    }

    async fn delete_nfs_share(&self, id: u64) -> Result<(), ApplianceError> {
        self.enter(Op::DeleteNfsShare, &id.to_string())?;
        self.shares
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| ApplianceError::NotFound(format!("nfs share {id}")))
    }

    async fn query_nfs_shares(&self, prefix: &str) -> Result<Vec<NfsShare>, ApplianceError> {
        self.enter(Op::QueryNfsShares, prefix)?;
        let mut found: Vec<NfsShare> = self
            .shares
            .iter()
            .filter(|s| s.path.starts_with(prefix))
            .map(|s| s.clone())
            .collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    async fn create_subsystem(
        &self,
        spec: &NvmeSubsystemSpec,
    ) -> Result<NvmeSubsystem, ApplianceError> {
        self.enter(Op::CreateSubsystem, &spec.name)?;
        if self.subsystems.iter().any(|s| s.name == spec.name) {
            return Err(ApplianceError::AlreadyExists(format!(
                "subsystem {}",
                spec.name
            )));
        }
        let subsystem = NvmeSubsystem {
            id: self.next_id(),
            name: spec.name.clone(),
            subnqn: spec
                .subnqn
                .clone()
                .unwrap_or_else(|| format!("{MOCK_NQN_BASE}:{}", spec.name)),
        };
        self.subsystems.insert(subsystem.id, subsystem.clone());
        Ok(subsystem)
    }

    async fn delete_subsystem(&self, id: u64) -> Result<(), ApplianceError> {
        self.enter(Op::DeleteSubsystem, &id.to_string())?;
        if !self.subsystems.contains_key(&id) {
            return Err(ApplianceError::NotFound(format!("subsystem {id}")));
        }
        if self.namespaces.iter().any(|n| n.subsystem_id == id) {
            return Err(ApplianceError::Request(format!(
                "subsystem {id} still has namespaces"
            )));
        }
        self.subsystems.remove(&id);
        Ok(())
    }

    async fn query_subsystems(&self) -> Result<Vec<NvmeSubsystem>, ApplianceError> {
        self.enter(Op::QuerySubsystems, "")?;
        let mut found = self.subsystems();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    async fn create_namespace(
        &self,
        spec: &NvmeNamespaceSpec,
    ) -> Result<NvmeNamespace, ApplianceError> {
        self.enter(Op::CreateNamespace, &spec.device_path)?;
        if !self.subsystems.contains_key(&spec.subsystem_id) {
            return Err(ApplianceError::NotFound(format!(
                "subsystem {}",
                spec.subsystem_id
            )));
        }
        let zvol = spec.device_path.strip_prefix("zvol/").unwrap_or_default();
        let is_zvol = self
            .datasets
            .get(zvol)
            .is_some_and(|d| d.kind == DatasetKind::Volume);
        if !is_zvol {
            return Err(ApplianceError::NotFound(format!(
                "block device {}",
                spec.device_path
            )));
        }
        if self
            .namespaces
            .iter()
            .any(|n| n.subsystem_id == spec.subsystem_id && n.nsid == spec.nsid)
        {
            return Err(ApplianceError::AlreadyExists(format!(
                "namespace {} of subsystem {}",
                spec.nsid, spec.subsystem_id
            )));
        }
        let namespace = NvmeNamespace {
            id: self.next_id(),
            subsystem_id: spec.subsystem_id,
            nsid: spec.nsid,
            device_path: spec.device_path.clone(),
        };
        self.namespaces.insert(namespace.id, namespace.clone());
        Ok(namespace)
    }

    async fn delete_namespace(&self, id: u64) -> Result<(), ApplianceError> {
        self.enter(Op::DeleteNamespace, &id.to_string())?;
        self.namespaces
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| ApplianceError::NotFound(format!("namespace {id}")))
    }

    async fn query_namespaces(&self) -> Result<Vec<NvmeNamespace>, ApplianceError> {
        self.enter(Op::QueryNamespaces, "")?;
        let mut found = self.namespaces();
        found.sort_by_key(|n| n.id);
        Ok(found)
    }

    async fn create_snapshot(
        &self,
        dataset: &str,
        label: &str,
    ) -> Result<ZfsSnapshot, ApplianceError> {
        self.enter(Op::CreateSnapshot, &format!("{dataset}@{label}"))?;
        if !self.datasets.contains_key(dataset) {
            return Err(ApplianceError::NotFound(format!("dataset {dataset}")));
        }
        self.insert_snapshot(dataset, label)
    }

    async fn delete_snapshot(&self, id: &str) -> Result<(), ApplianceError> {
        self.enter(Op::DeleteSnapshot, id)?;
        if !self.snapshots.contains_key(id) {
            return Err(ApplianceError::NotFound(format!("snapshot {id}")));
        }
        let dependents = self.dependent_clones(&[id.to_owned()], &[]);
        if !dependents.is_empty() {
            return Err(ApplianceError::Request(format!(
                "snapshot {id} has dependent clones: {}",
                dependents.join(", ")
            )));
        }
        self.snapshots.remove(id);
        Ok(())
    }

    async fn query_snapshots(
        &self,
        filter: &SnapshotFilter,
    ) -> Result<Vec<ZfsSnapshot>, ApplianceError> {
        let target = match filter {
            SnapshotFilter::Id(id) => id.as_str(),
            SnapshotFilter::Dataset(dataset) => dataset.as_str(),
            SnapshotFilter::All => "",
        };
        self.enter(Op::QuerySnapshots, target)?;
        let mut found: Vec<ZfsSnapshot> = self
            .snapshots
            .iter()
            .filter(|s| match filter {
                SnapshotFilter::Id(id) => &s.id == id,
                SnapshotFilter::Dataset(dataset) => &s.dataset == dataset,
                SnapshotFilter::All => true,
            })
            .map(|s| s.clone())
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn clone_snapshot(
        &self,
        snapshot: &str,
        target: &str,
    ) -> Result<Dataset, ApplianceError> {
        self.enter(Op::CloneSnapshot, target)?;
        let (_, source) = self.snapshot_source(snapshot)?;
        self.check_parent(target)?;
        let clone = self.materialize(
            target,
            source.kind,
            source.volsize,
            source.volblocksize.clone(),
            None,
            Some(snapshot.to_owned()),
        );
        self.insert_dataset(clone)
    }

    async fn replicate_snapshot(
        &self,
        snapshot: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<Dataset, ApplianceError> {
        self.enter(Op::ReplicateSnapshot, target)?;
        let delay = *self.replication_delay.lock();
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(ApplianceError::Timeout(timeout));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (snap, source) = self.snapshot_source(snapshot)?;
        self.check_parent(target)?;
        let copy = self.materialize(
            target,
            source.kind,
            source.volsize,
            source.volblocksize.clone(),
            source.refquota,
            None,
        );
        let copy = self.insert_dataset(copy)?;
        // A received stream leaves its snapshot behind on the target.
        self.insert_snapshot(target, &snap.label)?;
        Ok(copy)
    }
}
