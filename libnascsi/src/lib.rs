//! # libnascsi — CSI controller for ZFS NAS appliances
//!
//! `libnascsi` provisions volumes on a ZFS-based storage appliance on behalf
//! of a [Container Storage Interface][csi] orchestrator.  Volumes are
//! exported over NFS (a filesystem dataset plus a share) or NVMe-oF (a zvol
//! plus a subsystem with one namespace).  The controller is stateless apart
//! from a snapshot name registry: every id it hands out is an opaque handle
//! carrying what is needed to find the resources again.
//!
//! It follows the RK8s conventions (Tokio async runtime, `tracing` for
//! observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `Snapshot`, ids, requests. |
//! | [`error`] | [`CsiError`] enum and its status [`Code`]s. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volume and snapshot lifecycle. |
//! | [`appliance`] | [`ApplianceClient`] contract and an in-memory mock. |
//! | [`handle`] | Opaque volume / snapshot handle codec. |
//! | [`params`] | Typed storage class parameters. |
//! | [`config`] | Driver-wide [`ControllerConfig`]. |
//! | [`registry`] | Snapshot name registry. |
//! | [`saga`] | Compensating rollback stack. |
//! | [`provision`] | NFS and NVMe-oF provisioning pipelines. |
//! | [`deprovision`] | Best-effort volume teardown. |
//! | [`backend`] | [`NasBackend`], the appliance-backed controller. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod appliance;
pub mod backend;
pub mod config;
pub mod controller;
pub mod deprovision;
pub mod error;
pub mod handle;
pub mod identity;
pub mod params;
pub mod provision;
pub mod registry;
pub mod saga;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use appliance::{ApplianceClient, ApplianceError};
pub use backend::NasBackend;
pub use config::ControllerConfig;
pub use controller::CsiController;
pub use error::{Code, CsiError};
pub use identity::CsiIdentity;
pub use registry::{InMemorySnapshotRegistry, SnapshotRegistry};
pub use types::*;
