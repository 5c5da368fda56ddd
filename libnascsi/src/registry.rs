//! Snapshot name registry.
//!
//! Snapshot names are unique across the whole driver, while the appliance
//! only scopes them per dataset (`tank/a@s1` and `tank/c@s1` can coexist).
//! The registry maps each snapshot label to the dataset that owns it and is
//! consulted before any remote mutation.
//!
//! The registry is injected into the backend as a trait object so tests get
//! isolated instances and a persistent store can replace
//! [`InMemorySnapshotRegistry`] later.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

/// Outcome of a successful [`SnapshotRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The label was free and now belongs to the dataset.
    Inserted,
    /// The label already belonged to the same dataset.
    AlreadyHeld,
}

/// The label is owned by another dataset.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("snapshot name {label} is already used by dataset {owner}")]
pub struct RegistryConflict {
    pub label: String,
    pub owner: String,
}

/// Thread-safe `label -> dataset` map.
pub trait SnapshotRegistry: Send + Sync {
    /// Claim `label` for `dataset`.
    ///
    /// Re-registering the same pair is a no-op; claiming a label owned by a
    /// different dataset fails.
    fn register(&self, label: &str, dataset: &str) -> Result<Registration, RegistryConflict>;

    /// Release `label`, returning its previous owner.
    fn unregister(&self, label: &str) -> Option<String>;

    fn lookup(&self, label: &str) -> Option<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-lifetime registry behind a reader/writer lock.
#[derive(Debug, Default)]
pub struct InMemorySnapshotRegistry {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemorySnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotRegistry for InMemorySnapshotRegistry {
    fn register(&self, label: &str, dataset: &str) -> Result<Registration, RegistryConflict> {
        if let Some(owner) = self.entries.read().get(label) {
            return if owner == dataset {
                Ok(Registration::AlreadyHeld)
            } else {
                Err(RegistryConflict {
                    label: label.to_owned(),
                    owner: owner.clone(),
                })
            };
        }

        // Re-check under the write lock: another caller may have won the race
        // between the two acquisitions.
        let mut entries = self.entries.write();
        match entries.get(label) {
            Some(owner) if owner == dataset => Ok(Registration::AlreadyHeld),
            Some(owner) => Err(RegistryConflict {
                label: label.to_owned(),
                owner: owner.clone(),
            }),
            None => {
                entries.insert(label.to_owned(), dataset.to_owned());
                Ok(Registration::Inserted)
            }
        }
    }

    fn unregister(&self, label: &str) -> Option<String> {
        self.entries.write().remove(label)
    }

    fn lookup(&self, label: &str) -> Option<String> {
        self.entries.read().get(label).cloned()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}
