//! volmigrate - move PersistentVolumeClaim data between namespaces and clusters
//!
//! Kubernetes cannot copy a volume directly. Data is moved by scheduling
//! short-lived workloads that mount the source and/or destination claim and
//! run `rsync` inside them, over `ssh` when a network hop is involved.
//!
//! # Modules
//!
//! - [`engine`] - Fallback engine: validates, resolves and tries strategies in order
//! - [`strategy`] - The closed set of transfer strategies
//! - [`lifecycle`] - Create, poll and tear down ephemeral objects
//! - [`access`] - ServiceAccount/Role/RoleBinding and the shared security policy
//! - [`exposure`] - Service creation and endpoint resolution
//! - [`keys`] - Ephemeral SSH key pairs
//! - [`transfer`] - Bounded-retry rsync protocol run inside workloads
//! - [`workload`] - Pod, Job and Secret builders
//! - [`volume`] - Claim resolution (access modes, mounted node, node affinity)
//! - [`naming`] - Deterministic names and labels for ephemeral objects
//! - [`client`] - Kubernetes API capability trait
//! - [`error`] - Error taxonomy

#![deny(missing_docs)]

pub mod access;
pub mod client;
pub mod engine;
pub mod error;
pub mod exposure;
pub mod keys;
pub mod lifecycle;
pub mod naming;
pub mod retry;
pub mod strategy;
pub mod transfer;
pub mod volume;
pub mod workload;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClusterClient, KubeClusterClient};
pub use engine::{run, MigrationRequest, Options, Timeouts};
pub use error::Error;
pub use strategy::Strategy;
pub use volume::VolumeRef;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Prefix of every ephemeral object name
pub const NAME_PREFIX: &str = "volmigrate";

/// Label key carrying the migration instance id
pub const LABEL_INSTANCE: &str = "volmigrate.dev/instance";

/// Label key carrying the component tag (e.g. `svc-sshd`)
pub const LABEL_COMPONENT: &str = "volmigrate.dev/component";

/// Label key carrying the strategy name
pub const LABEL_STRATEGY: &str = "volmigrate.dev/strategy";

/// Standard managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on everything volmigrate creates
pub const LABEL_MANAGED_BY_VOLMIGRATE: &str = "volmigrate";

/// Default image running the in-workload transfer protocol (rsync + ssh client).
///
/// Built from `images/rsync/Dockerfile`; it must ship the `volmigrate` binary.
pub const DEFAULT_RSYNC_IMAGE: &str = "ghcr.io/volmigrate/volmigrate-rsync:latest";

/// Default image running the sshd server on the source side, built from `images/sshd/`
pub const DEFAULT_SSHD_IMAGE: &str = "ghcr.io/volmigrate/volmigrate-sshd:latest";
