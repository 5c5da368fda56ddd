//! Core CSI types: volumes, snapshots, requests, and plugin metadata.
//!
//! These types form the data model shared by the CSI traits and the backend
//! implementation.  Volume and snapshot ids are opaque to the caller; see
//! [`crate::handle`] for what they carry.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque, unique identifier for a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SnapshotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------------

/// What a new volume is populated from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeContentSource {
    Snapshot(SnapshotId),
    Volume(VolumeId),
}

/// A provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// Attachment parameters handed to Node operations uninterpreted.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
}

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Name chosen by the orchestrator; also the dataset leaf name.
    pub name: String,
    /// Desired capacity in bytes; `0` selects the driver default.
    pub capacity_bytes: u64,
    /// Storage class parameters, see [`crate::params`].
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// A snapshot as reported to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,
    pub source_volume_id: VolumeId,
    /// Creation time in unix seconds.
    pub creation_time: i64,
    pub size_bytes: u64,
    pub ready_to_use: bool,
}

/// Request to take a snapshot of a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    /// Snapshot name; unique across the driver.
    pub name: String,
    pub source_volume_id: String,
    /// Snapshot class parameters, see [`crate::params::SnapshotParams`].
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to list snapshots.
///
/// At most one of `snapshot_id` / `source_volume_id` is normally set; when
/// both are, `snapshot_id` wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsRequest {
    #[serde(default)]
    pub snapshot_id: Option<SnapshotId>,
    #[serde(default)]
    pub source_volume_id: Option<VolumeId>,
    /// Page size; `0` returns everything.
    #[serde(default)]
    pub max_entries: u32,
    /// Offset returned as `next_token` by the previous page.
    #[serde(default)]
    pub starting_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsResponse {
    pub entries: Vec<Snapshot>,
    #[serde(default)]
    pub next_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Plugin info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
}

/// RPCs supported by the Controller service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    CreateDeleteSnapshot,
    ListSnapshots,
    CloneVolume,
}
