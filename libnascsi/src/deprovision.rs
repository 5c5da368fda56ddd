//! Idempotent, continue-on-error volume teardown.
//!
//! Children go first (namespace, subsystem, then the zvol; or share, then the
//! filesystem).  A child that is already gone counts as deleted.  Any other
//! failure is recorded in the [`CleanupReport`] and the remaining deletions
//! still run.

use std::fmt;

use tracing::{debug, instrument, warn};

use crate::appliance::{ApplianceClient, ApplianceError};
use crate::handle::{Attachment, VolumeHandle};

/// One child resource that could not be deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// What was being deleted, e.g. `nfs share 7`.
    pub resource: String,
    pub error: ApplianceError,
}

/// Result of a best-effort teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Child resources deleted by this call.
    pub deleted: Vec<String>,
    /// Child resources that were already gone.
    pub missing: Vec<String>,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// `true` when nothing was left behind.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, resource: String, result: Result<(), ApplianceError>) {
        match result {
            Ok(()) => {
                debug!(%resource, "deleted");
                self.deleted.push(resource);
            }
            Err(e) if e.is_not_found() => {
                debug!(%resource, "already gone");
                self.missing.push(resource);
            }
            Err(error) => {
                warn!(%resource, %error, "delete failed, continuing");
                self.failures.push(CleanupFailure { resource, error });
            }
        }
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} deleted, {} already gone, {} failed",
            self.deleted.len(),
            self.missing.len(),
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.resource, failure.error)?;
        }
        Ok(())
    }
}

/// Delete everything `handle` refers to.
#[instrument(skip(client, handle), fields(dataset = %handle.dataset_name))]
pub async fn deprovision(client: &dyn ApplianceClient, handle: &VolumeHandle) -> CleanupReport {
    let mut report = CleanupReport::default();

    match &handle.attachment {
        Attachment::Nfs { share_id, .. } => {
            report.record(
                format!("nfs share {share_id}"),
                client.delete_nfs_share(*share_id).await,
            );
        }
        Attachment::Nvmeof {
            subsystem_id,
            namespace_id,
            ..
        } => {
            report.record(
                format!("namespace {namespace_id}"),
                client.delete_namespace(*namespace_id).await,
            );
            report.record(
                format!("subsystem {subsystem_id}"),
                client.delete_subsystem(*subsystem_id).await,
            );
        }
        Attachment::Iscsi => {}
    }

    report.record(
        format!("dataset {}", handle.dataset_name),
        client.delete_dataset(&handle.dataset_name, true).await,
    );

    if !report.is_clean() {
        warn!(%report, "volume only partially cleaned up");
    }
    report
}
