//! Storage appliance API contract.
//!
//! The orchestrator never talks to the appliance directly: every remote call
//! goes through [`ApplianceClient`].  A production client wraps the
//! appliance's management API; [`MockAppliance`] is an in-memory stand-in
//! with ZFS-like rules used by the test suites.
//!
//! Resources are referenced, never owned: the orchestrator does not cache any
//! of the values returned here between calls.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mock;

pub use mock::{MockAppliance, Op};

/// Errors reported by an [`ApplianceClient`].
///
/// `NotFound` is kept distinct from every other failure so that delete paths
/// can treat it as success.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplianceError {
    /// The referenced resource does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A resource with the same identity already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A bounded operation did not finish within its ceiling.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Any other failure (transport, validation, busy resource, ...).
    #[error("appliance request failed: {0}")]
    Request(String),
}

impl ApplianceError {
    /// Create an [`ApplianceError::Request`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn request<E: std::fmt::Display>(e: E) -> Self {
        Self::Request(e.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

/// Kind of a ZFS dataset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// A mountable filesystem, exported over NFS.
    Filesystem,
    /// A block device (zvol), exported over NVMe-oF.
    Volume,
}

/// A dataset as reported by the appliance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dataset {
    /// Appliance-side identifier.
    pub id: String,
    /// Full dataset path, e.g. `tank/k8s/pvc-1`.
    pub name: String,
    pub kind: DatasetKind,
    /// Mount path for filesystems.
    #[serde(default)]
    pub mountpoint: Option<String>,
    /// Logical size of a zvol in bytes.
    #[serde(default)]
    pub volsize: Option<u64>,
    #[serde(default)]
    pub volblocksize: Option<String>,
    /// Referenced-space quota for filesystems.
    #[serde(default)]
    pub refquota: Option<u64>,
    /// Snapshot this dataset was cloned from, if any.
    #[serde(default)]
    pub origin: Option<String>,
    /// Space referenced by the dataset.
    #[serde(default)]
    pub used_bytes: u64,
}

impl Dataset {
    /// Block device path of a zvol as used by NVMe-oF namespaces.
    pub fn device_path(&self) -> String {
        zvol_device_path(&self.name)
    }
}

/// Block device path of the zvol `dataset`, e.g. `zvol/tank/b`.
pub fn zvol_device_path(dataset: &str) -> String {
    format!("zvol/{dataset}")
}

/// Parameters of a dataset to create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetSpec {
    pub name: String,
    pub kind: DatasetKind,
    #[serde(default)]
    pub volsize: Option<u64>,
    #[serde(default)]
    pub volblocksize: Option<String>,
    #[serde(default)]
    pub refquota: Option<u64>,
    /// Thin-provision a zvol.
    #[serde(default)]
    pub sparse: bool,
}

impl DatasetSpec {
    /// A plain filesystem with an optional referenced-space quota.
    pub fn filesystem(name: impl Into<String>, refquota: Option<u64>) -> Self {
        Self {
            name: name.into(),
            kind: DatasetKind::Filesystem,
            volsize: None,
            volblocksize: None,
            refquota,
            sparse: false,
        }
    }

    /// A zvol of `volsize` bytes with a fixed block size.
    pub fn volume(name: impl Into<String>, volsize: u64, volblocksize: &str) -> Self {
        Self {
            name: name.into(),
            kind: DatasetKind::Volume,
            volsize: Some(volsize),
            volblocksize: Some(volblocksize.to_owned()),
            refquota: None,
            sparse: true,
        }
    }

    /// Whether an existing dataset has the shape this spec asks for.
    ///
    /// Quotas are not compared: they may have been raised out of band.
    pub fn matches(&self, existing: &Dataset) -> bool {
        if existing.name != self.name || existing.kind != self.kind {
            return false;
        }
        match self.kind {
            DatasetKind::Filesystem => true,
            DatasetKind::Volume => existing.volsize == self.volsize,
        }
    }
}

// ---------------------------------------------------------------------------
// NFS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NfsShare {
    pub id: u64,
    /// Exported path, the mount path of the backing dataset.
    pub path: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NfsShareSpec {
    pub path: String,
    #[serde(default)]
    pub comment: String,
}

// ---------------------------------------------------------------------------
// NVMe-oF
// ---------------------------------------------------------------------------

/// An NVMe-oF subsystem (the fabric target).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NvmeSubsystem {
    pub id: u64,
    pub name: String,
    /// Full NVMe qualified name of the subsystem.
    pub subnqn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NvmeSubsystemSpec {
    pub name: String,
    /// Requested NQN; the appliance generates one when `None`.
    #[serde(default)]
    pub subnqn: Option<String>,
    #[serde(default)]
    pub allow_any_host: bool,
}

/// A namespace exposing one zvol through a subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NvmeNamespace {
    pub id: u64,
    pub subsystem_id: u64,
    /// Namespace id inside the subsystem.
    pub nsid: u32,
    pub device_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NvmeNamespaceSpec {
    pub subsystem_id: u64,
    pub nsid: u32,
    pub device_path: String,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// A native ZFS snapshot `<dataset>@<label>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ZfsSnapshot {
    /// Full snapshot name, `<dataset>@<label>`.
    pub id: String,
    pub dataset: String,
    pub label: String,
    /// Creation time in unix seconds.
    pub created_at: i64,
    #[serde(default)]
    pub used_bytes: u64,
}

/// Selects which snapshots [`ApplianceClient::query_snapshots`] returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotFilter {
    /// Exactly the snapshot with this full name.
    Id(String),
    /// Every snapshot of this dataset (children excluded).
    Dataset(String),
    /// Every snapshot on the appliance.
    All,
}

// ---------------------------------------------------------------------------
// Client contract
// ---------------------------------------------------------------------------

/// Remote appliance API consumed by the orchestrator.
///
/// Every call may block on network I/O.  Dropping the returned future cancels
/// the call from the orchestrator's point of view.
#[async_trait]
pub trait ApplianceClient: Send + Sync {
    /// Cheap liveness check of the management API.
    async fn ping(&self) -> Result<(), ApplianceError>;

    async fn create_dataset(&self, spec: &DatasetSpec) -> Result<Dataset, ApplianceError>;

    async fn get_dataset(&self, name: &str) -> Result<Dataset, ApplianceError>;

    /// Destroy a dataset; `recursive` also destroys its children and
    /// snapshots.
    async fn delete_dataset(&self, name: &str, recursive: bool) -> Result<(), ApplianceError>;

    /// Every dataset whose name starts with `prefix`.
    async fn query_datasets(&self, prefix: &str) -> Result<Vec<Dataset>, ApplianceError>;

    async fn create_nfs_share(&self, spec: &NfsShareSpec) -> Result<NfsShare, ApplianceError>;

    async fn delete_nfs_share(&self, id: u64) -> Result<(), ApplianceError>;

    /// Every share whose path starts with `prefix`.
    async fn query_nfs_shares(&self, prefix: &str) -> Result<Vec<NfsShare>, ApplianceError>;

    async fn create_subsystem(
        &self,
        spec: &NvmeSubsystemSpec,
    ) -> Result<NvmeSubsystem, ApplianceError>;

    async fn delete_subsystem(&self, id: u64) -> Result<(), ApplianceError>;

    async fn query_subsystems(&self) -> Result<Vec<NvmeSubsystem>, ApplianceError>;

    async fn create_namespace(
        &self,
        spec: &NvmeNamespaceSpec,
    ) -> Result<NvmeNamespace, ApplianceError>;

    async fn delete_namespace(&self, id: u64) -> Result<(), ApplianceError>;

    async fn query_namespaces(&self) -> Result<Vec<NvmeNamespace>, ApplianceError>;

    async fn create_snapshot(&self, dataset: &str, label: &str)
    -> Result<ZfsSnapshot, ApplianceError>;

    /// Destroy the snapshot with full name `id`.
    async fn delete_snapshot(&self, id: &str) -> Result<(), ApplianceError>;

    async fn query_snapshots(
        &self,
        filter: &SnapshotFilter,
    ) -> Result<Vec<ZfsSnapshot>, ApplianceError>;

    /// Copy-on-write clone of `snapshot` at dataset path `target`.
    async fn clone_snapshot(&self, snapshot: &str, target: &str)
    -> Result<Dataset, ApplianceError>;

    /// Full, independent copy of `snapshot` at `target` (send/receive).
    ///
    /// May run for a long time on large datasets; gives up with
    /// [`ApplianceError::Timeout`] after `timeout`.
    async fn replicate_snapshot(
        &self,
        snapshot: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<Dataset, ApplianceError>;
}
