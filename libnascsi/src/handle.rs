//! Opaque resource handles.
//!
//! The controller keeps no database: everything it needs to find a volume or
//! snapshot again is packed into the id it hands back to the caller.  A
//! handle is JSON, base64url-encoded (no padding) behind a short kind prefix:
//!
//! ```text
//! vh1.<base64url(json(VolumeHandle))>
//! sh1.<base64url(json(SnapshotHandle))>
//! ```
//!
//! Decoding is pure and total: any string that was not produced by `encode`
//! yields a [`HandleError`], never a panic.  Callers decide how to degrade
//! (delete: assume gone, list: empty, clone: not found).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::Protocol;

const VOLUME_PREFIX: &str = "vh1.";
const SNAPSHOT_PREFIX: &str = "sh1.";

/// Why a string could not be decoded into a handle.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("missing {0} handle prefix")]
    Prefix(&'static str),
    #[error("invalid handle encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("invalid handle payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("inconsistent handle: {0}")]
    Inconsistent(&'static str),
}

/// Protocol-specific part of a [`VolumeHandle`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Attachment {
    Nfs {
        share_id: u64,
        /// Exported path.
        share_path: String,
        #[serde(default)]
        server: Option<String>,
    },
    Nvmeof {
        subsystem_id: u64,
        namespace_id: u64,
        /// Fabric target identity.
        subsystem_nqn: String,
        #[serde(default)]
        server: Option<String>,
        transport: String,
        port: u16,
    },
    /// Recognised for decoding; the driver does not provision iSCSI.
    Iscsi,
}

impl Attachment {
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Nfs { .. } => Protocol::Nfs,
            Self::Nvmeof { .. } => Protocol::Nvmeof,
            Self::Iscsi => Protocol::Iscsi,
        }
    }

    pub fn server(&self) -> Option<&str> {
        match self {
            Self::Nfs { server, .. } | Self::Nvmeof { server, .. } => server.as_deref(),
            Self::Iscsi => None,
        }
    }
}

/// Everything needed to find a provisioned volume again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeHandle {
    /// Volume name as requested by the orchestrator.
    pub name: String,
    pub dataset_id: String,
    /// Full path of the backing dataset.
    pub dataset_name: String,
    pub attachment: Attachment,
}

impl VolumeHandle {
    pub fn protocol(&self) -> Protocol {
        self.attachment.protocol()
    }

    pub fn encode(&self) -> Result<String, HandleError> {
        encode(VOLUME_PREFIX, self)
    }

    pub fn decode(id: &str) -> Result<Self, HandleError> {
        let handle: Self = decode(VOLUME_PREFIX, "volume", id)?;
        if handle.name.is_empty() {
            return Err(HandleError::Inconsistent("empty volume name"));
        }
        if !is_dataset_path(&handle.dataset_name) {
            return Err(HandleError::Inconsistent("invalid dataset path"));
        }
        Ok(handle)
    }
}

/// Everything needed to find a snapshot again.
///
/// A native snapshot is named `<dataset>@<label>`; a detached snapshot is
/// named after the independent dataset that holds it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub snapshot_name: String,
    /// Id of the volume the snapshot was taken from, as given by the caller.
    pub source_volume: String,
    /// Dataset of the source volume.
    pub dataset_name: String,
    pub protocol: Protocol,
    pub detached: bool,
    /// Creation time in unix seconds.
    pub created_at: i64,
}

impl SnapshotHandle {
    /// The orchestrator-visible snapshot name.
    pub fn label(&self) -> &str {
        let separator = if self.detached { '/' } else { '@' };
        self.snapshot_name
            .rsplit_once(separator)
            .map_or(self.snapshot_name.as_str(), |(_, label)| label)
    }

    pub fn encode(&self) -> Result<String, HandleError> {
        encode(SNAPSHOT_PREFIX, self)
    }

    pub fn decode(id: &str) -> Result<Self, HandleError> {
        let handle: Self = decode(SNAPSHOT_PREFIX, "snapshot", id)?;
        if !is_dataset_path(&handle.dataset_name) {
            return Err(HandleError::Inconsistent("invalid dataset path"));
        }
        if handle.detached {
            if !is_dataset_path(&handle.snapshot_name) {
                return Err(HandleError::Inconsistent("invalid detached snapshot path"));
            }
        } else {
            let Some((dataset, label)) = handle.snapshot_name.split_once('@') else {
                return Err(HandleError::Inconsistent("native snapshot without '@'"));
            };
            if dataset != handle.dataset_name || label.is_empty() {
                return Err(HandleError::Inconsistent(
                    "native snapshot does not belong to its dataset",
                ));
            }
        }
        Ok(handle)
    }
}

fn encode<T: Serialize>(prefix: &str, value: &T) -> Result<String, HandleError> {
    let json = serde_json::to_vec(value)?;
    Ok(format!("{prefix}{}", URL_SAFE_NO_PAD.encode(json)))
}

fn decode<T: DeserializeOwned>(
    prefix: &str,
    kind: &'static str,
    id: &str,
) -> Result<T, HandleError> {
    let payload = id.strip_prefix(prefix).ok_or(HandleError::Prefix(kind))?;
    let json = URL_SAFE_NO_PAD.decode(payload)?;
    Ok(serde_json::from_slice(&json)?)
}

fn is_dataset_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('@')
        && !path.starts_with('/')
        && !path.ends_with('/')
        && !path.contains("//")
}
