//! Shared fixtures: a mock appliance with a `tank` pool and a backend wired
//! to it.

use std::collections::HashMap;
use std::sync::Arc;

use libnascsi::appliance::{DatasetSpec, MockAppliance};
use libnascsi::handle::{SnapshotHandle, VolumeHandle};
use libnascsi::{
    ApplianceClient, ControllerConfig, CreateSnapshotRequest, CreateVolumeRequest, CsiController,
    CsiError, InMemorySnapshotRegistry, NasBackend, Snapshot, SnapshotRegistry, Volume,
};
use tracing_subscriber::EnvFilter;

pub const POOL: &str = "tank";
pub const SNAPSHOT_ROOT: &str = "tank/snaps";
pub const SERVER: &str = "10.0.0.5";

pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("libnascsi=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

pub struct Harness {
    pub mock: Arc<MockAppliance>,
    pub registry: Arc<InMemorySnapshotRegistry>,
    pub backend: Arc<NasBackend>,
}

impl Harness {
    /// Pool `tank` with the detached snapshot root `tank/snaps`.
    pub async fn new() -> Self {
        Self::with_config(ControllerConfig::default().with_snapshot_parent_dataset(SNAPSHOT_ROOT))
            .await
    }

    pub async fn with_config(config: ControllerConfig) -> Self {
        init_logger();
        let mock = Arc::new(MockAppliance::new().with_pool(POOL));
        mock.create_dataset(&DatasetSpec::filesystem(SNAPSHOT_ROOT, None))
            .await
            .unwrap();
        mock.clear_calls();
        Self::on(mock, config)
    }

    /// A second controller on the same appliance, with an empty registry.
    pub fn restarted(&self) -> Self {
        Self::on(Arc::clone(&self.mock), self.backend.config().clone())
    }

    fn on(mock: Arc<MockAppliance>, config: ControllerConfig) -> Self {
        let registry = Arc::new(InMemorySnapshotRegistry::new());
        let backend = NasBackend::new(
            Arc::clone(&mock) as Arc<dyn ApplianceClient>,
            Arc::clone(&registry) as Arc<dyn SnapshotRegistry>,
            config,
        );
        Self {
            mock,
            registry,
            backend: Arc::new(backend),
        }
    }

    pub async fn create_volume(
        &self,
        name: &str,
        pairs: &[(&str, &str)],
    ) -> Result<Volume, CsiError> {
        self.backend
            .create_volume(CreateVolumeRequest {
                name: name.to_owned(),
                capacity_bytes: 1 << 30,
                parameters: params(pairs),
                content_source: None,
            })
            .await
    }

    pub async fn nfs_volume(&self, name: &str) -> Volume {
        self.create_volume(name, &[("pool", POOL), ("server", SERVER)])
            .await
            .unwrap()
    }

    pub async fn nvmeof_volume(&self, name: &str) -> Volume {
        self.create_volume(
            name,
            &[("pool", POOL), ("protocol", "nvmeof"), ("server", SERVER)],
        )
        .await
        .unwrap()
    }

    pub async fn snapshot(
        &self,
        name: &str,
        source: &Volume,
        pairs: &[(&str, &str)],
    ) -> Result<Snapshot, CsiError> {
        self.backend
            .create_snapshot(CreateSnapshotRequest {
                name: name.to_owned(),
                source_volume_id: source.volume_id.0.clone(),
                parameters: params(pairs),
            })
            .await
    }
}

pub fn volume_handle(volume: &Volume) -> VolumeHandle {
    VolumeHandle::decode(&volume.volume_id.0).unwrap()
}

pub fn snapshot_handle(snapshot: &Snapshot) -> SnapshotHandle {
    SnapshotHandle::decode(&snapshot.snapshot_id.0).unwrap()
}
