//! Claim resolution
//!
//! Turns a `namespace/name` reference into the facts strategies decide on:
//! which access modes the claim supports, which node it is mounted on right
//! now and which nodes its PersistentVolume is pinned to.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use tracing::{debug, info};

use crate::client::ClusterClient;
use crate::lifecycle::{self, Handle};
use crate::{Error, Result};

/// Node label used by local-volume provisioners for hostname pinning
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Claim access modes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Mountable read-write by a single node
    ReadWriteOnce,
    /// Mountable read-only by many nodes
    ReadOnlyMany,
    /// Mountable read-write by many nodes
    ReadWriteMany,
    /// Mountable read-write by a single pod
    ReadWriteOncePod,
}

impl AccessMode {
    /// Parse the Kubernetes spelling, `None` for unknown modes
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ReadWriteOnce" => Some(AccessMode::ReadWriteOnce),
            "ReadOnlyMany" => Some(AccessMode::ReadOnlyMany),
            "ReadWriteMany" => Some(AccessMode::ReadWriteMany),
            "ReadWriteOncePod" => Some(AccessMode::ReadWriteOncePod),
            _ => None,
        }
    }
}

/// An unresolved claim reference on some cluster
#[derive(Clone)]
pub struct VolumeRef {
    /// Client for the cluster the claim lives on
    pub client: Arc<dyn ClusterClient>,
    /// Claim namespace
    pub namespace: String,
    /// Claim name
    pub name: String,
}

impl VolumeRef {
    /// Reference claim `name` in `namespace`
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl fmt::Debug for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeRef")
            .field("cluster", &self.client.cluster_id())
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish()
    }
}

/// A resolved claim
#[derive(Clone)]
pub struct VolumeDescriptor {
    /// Client for the cluster the claim lives on
    pub client: Arc<dyn ClusterClient>,
    /// Claim namespace
    pub namespace: String,
    /// Claim name
    pub name: String,
    /// Access modes the claim was bound with
    pub access_modes: Vec<AccessMode>,
    /// Node a running pod currently mounts the claim on
    pub mounted_node: Option<String>,
    /// Hostnames the bound PersistentVolume is restricted to (empty = any)
    pub affinity_nodes: Vec<String>,
}

impl VolumeDescriptor {
    /// Identity of the cluster the claim lives on
    pub fn cluster_id(&self) -> String {
        self.client.cluster_id()
    }

    /// Whether both claims are on the same API server
    pub fn same_cluster(&self, other: &VolumeDescriptor) -> bool {
        self.cluster_id() == other.cluster_id()
    }

    /// Whether both claims are in the same namespace of the same cluster
    pub fn same_namespace(&self, other: &VolumeDescriptor) -> bool {
        self.same_cluster(other) && self.namespace == other.namespace
    }

    /// Whether the claim was bound with `mode`
    pub fn supports(&self, mode: AccessMode) -> bool {
        self.access_modes.contains(&mode)
    }
}

impl fmt::Display for VolumeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl fmt::Debug for VolumeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeDescriptor")
            .field("cluster", &self.client.cluster_id())
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("access_modes", &self.access_modes)
            .field("mounted_node", &self.mounted_node)
            .field("affinity_nodes", &self.affinity_nodes)
            .finish()
    }
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn mounts_claim(pod: &Pod, claim: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes.iter().any(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .is_some_and(|pvc| pvc.claim_name == claim)
            })
        })
        .unwrap_or(false)
}

fn affinity_hostnames(pv: &PersistentVolume) -> Vec<String> {
    let Some(terms) = pv
        .spec
        .as_ref()
        .and_then(|s| s.node_affinity.as_ref())
        .and_then(|a| a.required.as_ref())
        .map(|r| &r.node_selector_terms)
    else {
        return Vec::new();
    };

    terms
        .iter()
        .filter_map(|t| t.match_expressions.as_ref())
        .flatten()
        .filter(|e| e.key == HOSTNAME_LABEL && e.operator == "In")
        .filter_map(|e| e.values.clone())
        .flatten()
        .collect()
}

/// Resolve a claim reference.
///
/// Fails with [`Error::Resolution`] when the claim does not exist, when it is
/// mounted and `ignore_mounted` is false, or when it is mounted on a node its
/// PersistentVolume's node affinity does not allow.
pub async fn resolve(volume: &VolumeRef, ignore_mounted: bool) -> Result<VolumeDescriptor> {
    let client = volume.client.as_ref();
    let fail = |msg: String| Error::resolution(volume.to_string(), msg);

    let handle: Handle<PersistentVolumeClaim> =
        Handle::new(&volume.name, Some(volume.namespace.clone()));
    let claim = lifecycle::get(client, &handle)
        .await
        .map_err(|e| fail(e.to_string()))?
        .ok_or_else(|| fail("claim not found".to_string()))?;

    let access_modes: Vec<AccessMode> = claim
        .status
        .as_ref()
        .and_then(|s| s.access_modes.clone())
        .or_else(|| claim.spec.as_ref().and_then(|s| s.access_modes.clone()))
        .unwrap_or_default()
        .iter()
        .filter_map(|m| AccessMode::parse(m))
        .collect();

    let pods: Vec<Pod> = lifecycle::list(client, Some(&volume.namespace), None)
        .await
        .map_err(|e| fail(e.to_string()))?;
    let mounter = pods
        .iter()
        .filter(|p| !is_terminated(p) && mounts_claim(p, &volume.name))
        .find_map(|p| {
            let node = p.spec.as_ref()?.node_name.clone()?;
            Some((p.metadata.name.clone().unwrap_or_default(), node))
        });

    if let Some((pod, node)) = &mounter {
        if !ignore_mounted {
            return Err(fail(format!(
                "claim is mounted by pod {} on node {}",
                pod, node
            )));
        }
        info!(volume = %volume, pod = %pod, node = %node, "claim is mounted, proceeding anyway");
    }
    let mounted_node = mounter.map(|(_, node)| node);

    let affinity_nodes = match claim.spec.as_ref().and_then(|s| s.volume_name.clone()) {
        Some(pv_name) => {
            let handle: Handle<PersistentVolume> = Handle::new(pv_name, None);
            lifecycle::get(client, &handle)
                .await
                .map_err(|e| fail(e.to_string()))?
                .map(|pv| affinity_hostnames(&pv))
                .unwrap_or_default()
        }
        None => Vec::new(),
    };

    if let Some(node) = &mounted_node {
        if !affinity_nodes.is_empty() && !affinity_nodes.contains(node) {
            return Err(fail(format!(
                "claim is mounted on node {} outside its volume's node affinity {:?}",
                node, affinity_nodes
            )));
        }
    }

    let descriptor = VolumeDescriptor {
        client: volume.client.clone(),
        namespace: volume.namespace.clone(),
        name: volume.name.clone(),
        access_modes,
        mounted_node,
        affinity_nodes,
    };
    debug!(descriptor = ?descriptor, "resolved volume");
    Ok(descriptor)
}
