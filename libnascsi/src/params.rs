//! Typed request parameters.
//!
//! Storage classes hand the controller a free-form `string -> string` map.
//! It is parsed exactly once, up front, into the types below; pipeline code
//! only ever sees [`VolumeParams`] / [`SnapshotParams`] and matches
//! exhaustively on [`ProtocolParams`].
//!
//! Recognised keys:
//!
//! | Key | Meaning |
//! |---|---|
//! | `pool` | Pool that holds the volume datasets. |
//! | `parentDataset` | Parent of the volume datasets (wins over `pool`). |
//! | `protocol` | `nfs` (default), `nvmeof` or `iscsi` (unsupported). |
//! | `server` | Address clients use to reach the export. |
//! | `subsystemNQN` | NQN base for NVMe-oF subsystems. |
//! | `transport`, `port` | NVMe-oF transport (default `tcp`) and port (default `4420`). |
//! | `detachedVolumesFromSnapshots` | Restore snapshots as full copies instead of clones. |
//! | `detachedSnapshots` | Take snapshots as independent datasets. |
//! | `snapshotParentDataset` | Root dataset for detached snapshots. |

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;

pub const KEY_POOL: &str = "pool";
pub const KEY_PARENT_DATASET: &str = "parentDataset";
pub const KEY_PROTOCOL: &str = "protocol";
pub const KEY_SERVER: &str = "server";
pub const KEY_SUBSYSTEM_NQN: &str = "subsystemNQN";
pub const KEY_TRANSPORT: &str = "transport";
pub const KEY_PORT: &str = "port";
pub const KEY_DETACHED_CLONES: &str = "detachedVolumesFromSnapshots";
pub const KEY_DETACHED_SNAPSHOTS: &str = "detachedSnapshots";
pub const KEY_SNAPSHOT_PARENT_DATASET: &str = "snapshotParentDataset";

pub const DEFAULT_NVME_TRANSPORT: &str = "tcp";
pub const DEFAULT_NVME_PORT: u16 = 4420;

/// Export protocol of a volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Nfs,
    Nvmeof,
    Iscsi,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nfs => "nfs",
            Self::Nvmeof => "nvmeof",
            Self::Iscsi => "iscsi",
        })
    }
}

impl FromStr for Protocol {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nfs" => Ok(Self::Nfs),
            "nvmeof" | "nvme-of" | "nvme" => Ok(Self::Nvmeof),
            "iscsi" => Ok(Self::Iscsi),
            other => Err(CsiError::InvalidArgument(format!(
                "unknown protocol {other:?}"
            ))),
        }
    }
}

/// Where volume datasets are created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub pool: String,
    /// Dataset under which `<parent>/<name>` is created; may equal `pool`.
    pub parent: String,
}

impl Placement {
    /// Placement from explicit parameters, `parentDataset` winning over
    /// `pool`.
    fn from_params(pool: Option<&str>, parent: Option<&str>) -> Result<Option<Self>, CsiError> {
        match (pool, parent) {
            (_, Some(parent)) => {
                let parent = parent.trim_matches('/');
                let pool = first_segment(parent)?;
                Ok(Some(Self {
                    pool: pool.to_owned(),
                    parent: parent.to_owned(),
                }))
            }
            (Some(pool), None) => {
                let pool = pool.trim_matches('/');
                if pool.is_empty() || pool.contains('/') {
                    return Err(CsiError::InvalidArgument(format!("invalid pool {pool:?}")));
                }
                Ok(Some(Self {
                    pool: pool.to_owned(),
                    parent: pool.to_owned(),
                }))
            }
            (None, None) => Ok(None),
        }
    }

    /// Placement next to an existing dataset: same pool, same parent.
    pub fn beside(dataset: &str) -> Result<Self, CsiError> {
        let pool = first_segment(dataset)?;
        let parent = dataset
            .rsplit_once('/')
            .map_or(pool, |(parent, _)| parent);
        Ok(Self {
            pool: pool.to_owned(),
            parent: parent.to_owned(),
        })
    }

    /// Dataset path of the volume `name`.
    pub fn dataset_path(&self, name: &str) -> String {
        format!("{}/{name}", self.parent)
    }
}

fn first_segment(path: &str) -> Result<&str, CsiError> {
    match path.split('/').next() {
        Some(segment) if !segment.is_empty() && !path.contains('@') => Ok(segment),
        _ => Err(CsiError::InvalidArgument(format!(
            "invalid dataset path {path:?}"
        ))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NfsParams {
    pub server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeofParams {
    pub server: Option<String>,
    pub transport: String,
    pub port: u16,
    /// NQN base; the subsystem NQN is `<base>:<volume name>`.
    pub subsystem_nqn: Option<String>,
}

impl Default for NvmeofParams {
    fn default() -> Self {
        Self {
            server: None,
            transport: DEFAULT_NVME_TRANSPORT.to_owned(),
            port: DEFAULT_NVME_PORT,
            subsystem_nqn: None,
        }
    }
}

/// Protocol-specific knobs, one variant per supported protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolParams {
    Nfs(NfsParams),
    Nvmeof(NvmeofParams),
}

impl ProtocolParams {
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Nfs(_) => Protocol::Nfs,
            Self::Nvmeof(_) => Protocol::Nvmeof,
        }
    }

    pub fn server(&self) -> Option<&str> {
        match self {
            Self::Nfs(p) => p.server.as_deref(),
            Self::Nvmeof(p) => p.server.as_deref(),
        }
    }
}

/// Parsed `CreateVolume` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeParams {
    /// `None` when neither `pool` nor `parentDataset` was given.
    pub placement: Option<Placement>,
    pub protocol: ProtocolParams,
    /// Whether `protocol` was given explicitly (clones otherwise inherit the
    /// snapshot's protocol).
    pub protocol_explicit: bool,
    /// Restore snapshots as full independent copies.
    pub detached_clone: bool,
}

impl VolumeParams {
    pub fn parse(params: &HashMap<String, String>) -> Result<Self, CsiError> {
        let placement = Placement::from_params(
            non_empty(params, KEY_POOL),
            non_empty(params, KEY_PARENT_DATASET),
        )?;
        let explicit = non_empty(params, KEY_PROTOCOL);
        let protocol = explicit.map_or(Ok(Protocol::Nfs), str::parse::<Protocol>)?;
        let server = non_empty(params, KEY_SERVER).map(str::to_owned);

        let protocol = match protocol {
            Protocol::Nfs => ProtocolParams::Nfs(NfsParams { server }),
            Protocol::Nvmeof => {
                let port = match non_empty(params, KEY_PORT) {
                    Some(port) => port.parse().map_err(|e| {
                        CsiError::InvalidArgument(format!("invalid {KEY_PORT} {port:?}: {e}"))
                    })?,
                    None => DEFAULT_NVME_PORT,
                };
                ProtocolParams::Nvmeof(NvmeofParams {
                    server,
                    transport: non_empty(params, KEY_TRANSPORT)
                        .unwrap_or(DEFAULT_NVME_TRANSPORT)
                        .to_owned(),
                    port,
                    subsystem_nqn: non_empty(params, KEY_SUBSYSTEM_NQN).map(str::to_owned),
                })
            }
            Protocol::Iscsi => {
                return Err(CsiError::Unimplemented(
                    "iSCSI volumes are not supported".to_owned(),
                ));
            }
        };

        Ok(Self {
            placement,
            protocol,
            protocol_explicit: explicit.is_some(),
            detached_clone: flag(params, KEY_DETACHED_CLONES)?,
        })
    }
}

/// Parsed `CreateSnapshot` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotParams {
    /// Copy-on-write snapshot on the source dataset.
    Native,
    /// Independent dataset under `root`.
    Detached { root: String },
}

impl SnapshotParams {
    /// `default_root` is the driver-wide detached snapshot root, used when
    /// the request does not name one.
    pub fn parse(
        params: &HashMap<String, String>,
        default_root: Option<&str>,
    ) -> Result<Self, CsiError> {
        if !flag(params, KEY_DETACHED_SNAPSHOTS)? {
            return Ok(Self::Native);
        }
        let root = non_empty(params, KEY_SNAPSHOT_PARENT_DATASET)
            .or(default_root)
            .map(|r| r.trim_matches('/'))
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                CsiError::InvalidArgument(format!(
                    "{KEY_DETACHED_SNAPSHOTS} requires {KEY_SNAPSHOT_PARENT_DATASET}"
                ))
            })?;
        first_segment(root)?;
        Ok(Self::Detached {
            root: root.to_owned(),
        })
    }
}

fn non_empty<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn flag(params: &HashMap<String, String>, key: &str) -> Result<bool, CsiError> {
    match non_empty(params, key) {
        None => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
        Some(v) => Err(CsiError::InvalidArgument(format!(
            "{key} must be true or false, got {v:?}"
        ))),
    }
}
