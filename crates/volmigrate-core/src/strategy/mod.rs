//! Transfer strategies
//!
//! The set is closed: each variant knows when it applies to a pair of
//! resolved volumes and how to move the data. Ordering between strategies is
//! the caller's business, see [`crate::engine`].
//!
//! | name       | applies when                                   | data path                    |
//! |------------|------------------------------------------------|------------------------------|
//! | `mnt2`     | same namespace, both claims mountable together | one Job mounting both claims |
//! | `svc`      | same cluster                                   | rsync over ssh via ClusterIP |
//! | `nodeport` | always                                         | rsync over ssh via NodePort  |
//! | `lbsvc`    | always                                         | rsync over ssh via LoadBalancer |

mod mount;
mod remote;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use k8s_openapi::api::batch::v1::Job;

use crate::client::ClusterClient;
use crate::engine::{Options, Timeouts};
use crate::exposure::ExposureMode;
use crate::keys::KeyAlgorithm;
use crate::lifecycle::{self, Handle};
use crate::naming::Naming;
use crate::volume::VolumeDescriptor;
use crate::{Error, Result};

/// A way of moving data from one claim to another
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Mount both claims into one Job
    Mount,
    /// sshd on the source side exposed through a ClusterIP Service
    ClusterIp,
    /// sshd on the source side exposed through a NodePort Service
    NodePort,
    /// sshd on the source side exposed through a LoadBalancer Service
    LoadBalancer,
}

impl Strategy {
    /// Every strategy
    pub const ALL: [Strategy; 4] = [
        Strategy::Mount,
        Strategy::ClusterIp,
        Strategy::NodePort,
        Strategy::LoadBalancer,
    ];

    /// Order used when the caller does not give one
    pub const DEFAULT_ORDER: [Strategy; 3] =
        [Strategy::Mount, Strategy::ClusterIp, Strategy::LoadBalancer];

    /// Short name used on the command line, in object names and in labels
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Mount => "mnt2",
            Strategy::ClusterIp => "svc",
            Strategy::NodePort => "nodeport",
            Strategy::LoadBalancer => "lbsvc",
        }
    }

    /// Look a strategy up by name
    pub fn from_name(name: &str) -> Result<Self> {
        Strategy::ALL
            .into_iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| {
                let known: Vec<_> = Strategy::ALL.iter().map(|s| s.name()).collect();
                Error::configuration(format!(
                    "unknown strategy '{}' (known: {})",
                    name,
                    known.join(", ")
                ))
            })
    }

    fn exposure_mode(&self) -> Option<ExposureMode> {
        match self {
            Strategy::Mount => None,
            Strategy::ClusterIp => Some(ExposureMode::ClusterInternal),
            Strategy::NodePort => Some(ExposureMode::NodeLocal),
            Strategy::LoadBalancer => Some(ExposureMode::ExternallyRoutable),
        }
    }

    /// Whether the volumes' topology allows this strategy. No side effects.
    pub fn is_applicable(&self, source: &VolumeDescriptor, dest: &VolumeDescriptor) -> bool {
        match self {
            Strategy::Mount => mount::is_applicable(source, dest),
            Strategy::ClusterIp => source.same_cluster(dest),
            Strategy::NodePort | Strategy::LoadBalancer => true,
        }
    }

    /// Move the data. Objects created along the way are tracked by `attempt`.
    pub async fn execute(&self, attempt: &StrategyAttempt, migration: &Migration<'_>) -> Result<()> {
        match self.exposure_mode() {
            None => mount::execute(attempt, migration).await,
            Some(mode) => remote::execute(attempt, migration, mode).await,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Strategy::from_name(s)
    }
}

/// Wait for an rsync Job to start, then to finish.
///
/// The short `ready` bound catches a Job that can never be scheduled long
/// before the `completion` bound would.
async fn await_rsync_job(
    client: &dyn ClusterClient,
    job: &Handle<Job>,
    timeouts: &Timeouts,
) -> Result<()> {
    lifecycle::wait_until_ready(client, job, timeouts.ready, timeouts.poll_interval).await?;
    lifecycle::wait_until_succeeded(client, job, timeouts.completion, timeouts.poll_interval).await
}

/// Validated inputs shared by every strategy of one run
#[derive(Debug)]
pub struct Migration<'a> {
    /// Resolved source claim
    pub source: &'a VolumeDescriptor,
    /// Resolved destination claim
    pub dest: &'a VolumeDescriptor,
    /// Caller options
    pub options: &'a Options,
    /// Parsed key algorithm
    pub key_algorithm: KeyAlgorithm,
}

struct Scope {
    client: Arc<dyn ClusterClient>,
    cluster_id: String,
    namespace: String,
}

/// One strategy's execution within a migration instance.
///
/// Remembers every `(cluster, namespace)` it created objects in and sweeps
/// them by label on [`StrategyAttempt::cleanup`].
pub struct StrategyAttempt {
    naming: Naming,
    scopes: Mutex<Vec<Scope>>,
}

impl StrategyAttempt {
    /// Start an attempt of `strategy` for instance `instance_id`
    pub fn new(instance_id: &str, strategy: Strategy) -> Self {
        Self {
            naming: Naming::new(instance_id, strategy.name()),
            scopes: Mutex::new(Vec::new()),
        }
    }

    /// Names and labels of this attempt
    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    /// Record that objects will be created in `namespace` on `client`'s cluster
    pub async fn track(&self, client: &Arc<dyn ClusterClient>, namespace: &str) {
        let cluster_id = client.cluster_id();
        let mut scopes = self.scopes.lock().await;
        if scopes
            .iter()
            .any(|s| s.cluster_id == cluster_id && s.namespace == namespace)
        {
            return;
        }
        debug!(cluster = %cluster_id, namespace = %namespace, "tracking cleanup scope");
        scopes.push(Scope {
            client: client.clone(),
            cluster_id,
            namespace: namespace.to_string(),
        });
    }

    /// Delete everything this attempt created. Best effort, never fails.
    pub async fn cleanup(&self) -> usize {
        let selector = self.naming.attempt_selector();
        let scopes = self.scopes.lock().await;

        let mut deleted = 0;
        for scope in scopes.iter() {
            deleted += lifecycle::sweep(scope.client.as_ref(), &scope.namespace, &selector).await;
        }

        info!(
            instance = %self.naming.instance_id(),
            strategy = %self.naming.strategy(),
            deleted,
            "cleaned up attempt"
        );
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::Side;
    use crate::testing::FakeCluster;
    use crate::volume::AccessMode;

    fn descriptor(
        cluster: &Arc<FakeCluster>,
        namespace: &str,
        modes: &[AccessMode],
        node: Option<&str>,
    ) -> VolumeDescriptor {
        VolumeDescriptor {
            client: cluster.clone(),
            namespace: namespace.to_string(),
            name: "data".to_string(),
            access_modes: modes.to_vec(),
            mounted_node: node.map(String::from),
            affinity_nodes: vec![],
        }
    }

    #[test]
    fn names_round_trip() {
        for strategy in Strategy::ALL {
            assert_eq!(Strategy::from_name(strategy.name()).unwrap(), strategy);
        }
        assert_eq!("lbsvc".parse::<Strategy>().unwrap(), Strategy::LoadBalancer);
    }

    #[test]
    fn unknown_name_is_configuration_error() {
        let err = Strategy::from_name("rclone").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("mnt2, svc, nodeport, lbsvc"));
    }

    #[test]
    fn default_order_prefers_cheapest() {
        let names: Vec<_> = Strategy::DEFAULT_ORDER.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["mnt2", "svc", "lbsvc"]);
    }

    #[test]
    fn mount_needs_same_namespace() {
        let c1 = Arc::new(FakeCluster::new("c1"));
        let rwx = [AccessMode::ReadWriteMany];

        let a = descriptor(&c1, "apps", &rwx, None);
        let b = descriptor(&c1, "other", &rwx, None);
        assert!(!Strategy::Mount.is_applicable(&a, &b));
        assert!(Strategy::ClusterIp.is_applicable(&a, &b));
    }

    #[test]
    fn mount_of_exclusive_claims_needs_same_node() {
        let c1 = Arc::new(FakeCluster::new("c1"));
        let rwo = [AccessMode::ReadWriteOnce];

        let same = (
            descriptor(&c1, "apps", &rwo, Some("node-a")),
            descriptor(&c1, "apps", &rwo, Some("node-a")),
        );
        assert!(Strategy::Mount.is_applicable(&same.0, &same.1));

        let split = (
            descriptor(&c1, "apps", &rwo, Some("node-a")),
            descriptor(&c1, "apps", &rwo, Some("node-b")),
        );
        assert!(!Strategy::Mount.is_applicable(&split.0, &split.1));

        let shareable_source = descriptor(&c1, "apps", &[AccessMode::ReadOnlyMany], Some("node-a"));
        assert!(Strategy::Mount.is_applicable(&shareable_source, &split.1));
    }

    #[test]
    fn mount_rejects_claims_pinned_to_different_hosts() {
        let c1 = Arc::new(FakeCluster::new("c1"));
        let rwo = [AccessMode::ReadWriteOnce];

        let mut a = descriptor(&c1, "apps", &rwo, None);
        let mut b = descriptor(&c1, "apps", &rwo, None);
        a.affinity_nodes = vec!["node-a".to_string()];
        b.affinity_nodes = vec!["node-b".to_string()];
        assert!(!Strategy::Mount.is_applicable(&a, &b));

        // shareable access modes do not help against host pinning
        b.access_modes = vec![AccessMode::ReadWriteMany];
        assert!(!Strategy::Mount.is_applicable(&a, &b));

        b.affinity_nodes = vec!["node-b".to_string(), "node-a".to_string()];
        assert!(Strategy::Mount.is_applicable(&a, &b));

        b.affinity_nodes.clear();
        b.access_modes = rwo.to_vec();
        assert!(Strategy::Mount.is_applicable(&a, &b));
    }

    #[test]
    fn cluster_ip_needs_same_cluster() {
        let c1 = Arc::new(FakeCluster::new("c1"));
        let c2 = Arc::new(FakeCluster::new("c2"));
        let a = descriptor(&c1, "apps", &[], None);
        let b = descriptor(&c2, "apps", &[], None);

        assert!(!Strategy::Mount.is_applicable(&a, &b));
        assert!(!Strategy::ClusterIp.is_applicable(&a, &b));
        assert!(Strategy::NodePort.is_applicable(&a, &b));
        assert!(Strategy::LoadBalancer.is_applicable(&a, &b));
    }

    #[tokio::test]
    async fn cleanup_sweeps_each_tracked_scope_once() {
        let c1 = Arc::new(FakeCluster::new("c1"));
        let attempt = StrategyAttempt::new("abc12345", Strategy::ClusterIp);
        let client: Arc<dyn ClusterClient> = c1.clone();

        attempt.track(&client, "apps").await;
        attempt.track(&client, "apps").await;
        crate::access::grant_access(c1.as_ref(), attempt.naming(), Side::Source, "apps")
            .await
            .unwrap();
        assert_eq!(c1.object_count(), 3);

        assert_eq!(attempt.cleanup().await, 3);
        assert_eq!(c1.object_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_leaves_other_strategies_alone() {
        let c1 = Arc::new(FakeCluster::new("c1"));
        let client: Arc<dyn ClusterClient> = c1.clone();
        let earlier = StrategyAttempt::new("abc12345", Strategy::Mount);
        let current = StrategyAttempt::new("abc12345", Strategy::ClusterIp);

        crate::access::grant_access(c1.as_ref(), earlier.naming(), Side::Dest, "apps")
            .await
            .unwrap();
        current.track(&client, "apps").await;

        assert_eq!(current.cleanup().await, 0);
        assert_eq!(c1.object_count(), 3);
    }
}
