//! The fallback engine
//!
//! One call to [`run`] is one migration instance:
//!
//! 1. Validate options. Unknown strategy names and key algorithms fail here,
//!    before any API call.
//! 2. Resolve both claims.
//! 3. Try the candidate strategies in order. Inapplicable ones are skipped,
//!    failing ones are recorded and cleaned up, the first success wins.
//! 4. If none succeeds, report every outcome in order.
//!
//! The engine never reorders candidates and never reruns a failed strategy.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::{AttemptFailure, StrategyOutcome};
use crate::keys::KeyAlgorithm;
use crate::naming::generate_instance_id;
use crate::strategy::{Migration, Strategy, StrategyAttempt};
use crate::transfer::RetryPolicy;
use crate::volume::{self, VolumeRef};
use crate::{Error, Result, DEFAULT_RSYNC_IMAGE, DEFAULT_SSHD_IMAGE};

/// Upper bounds on every wait of a strategy attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Pod running
    pub ready: Duration,
    /// Service address assigned
    pub address: Duration,
    /// rsync job finished
    pub completion: Duration,
    /// Delay between two status polls
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready: Duration::from_secs(300),
            address: Duration::from_secs(300),
            completion: Duration::from_secs(24 * 60 * 60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Caller options for one migration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Delete destination files that do not exist in the source
    pub delete_extraneous: bool,
    /// Proceed when a claim is mounted by a running pod
    pub ignore_mounted: bool,
    /// Keep file owner and group
    pub preserve_ownership: bool,
    /// SSH key algorithm name
    pub key_algorithm: String,
    /// Strategy names in the order to try them, `None` for the default order
    pub strategies: Option<Vec<String>>,
    /// Image of the rsync job
    pub rsync_image: String,
    /// Image of the sshd pod
    pub sshd_image: String,
    /// Source cluster needs the shared pod security policy grant
    pub source_create_psp: bool,
    /// Destination cluster needs the shared pod security policy grant
    pub dest_create_psp: bool,
    /// Wait bounds
    pub timeouts: Timeouts,
    /// Retry budget of the transfer protocol
    pub transfer: RetryPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            delete_extraneous: false,
            ignore_mounted: false,
            preserve_ownership: true,
            key_algorithm: KeyAlgorithm::default().to_string(),
            strategies: None,
            rsync_image: DEFAULT_RSYNC_IMAGE.to_string(),
            sshd_image: DEFAULT_SSHD_IMAGE.to_string(),
            source_create_psp: false,
            dest_create_psp: false,
            timeouts: Timeouts::default(),
            transfer: RetryPolicy::default(),
        }
    }
}

/// Source, destination and options of one migration
#[derive(Clone, Debug)]
pub struct MigrationRequest {
    /// Claim to copy from
    pub source: VolumeRef,
    /// Claim to copy into
    pub dest: VolumeRef,
    /// Options
    pub options: Options,
}

/// Candidate strategies in caller order, or the default order
fn candidates(options: &Options) -> Result<Vec<Strategy>> {
    match &options.strategies {
        None => Ok(Strategy::DEFAULT_ORDER.to_vec()),
        Some(names) if names.is_empty() => {
            Err(Error::configuration("strategy list is empty"))
        }
        Some(names) => names.iter().map(|n| Strategy::from_name(n.trim())).collect(),
    }
}

/// Run a migration. Returns the strategy that succeeded.
pub async fn run(request: &MigrationRequest) -> Result<Strategy> {
    run_instance(request, &generate_instance_id()).await
}

pub(crate) async fn run_instance(request: &MigrationRequest, instance_id: &str) -> Result<Strategy> {
    let options = &request.options;
    let strategies = candidates(options)?;
    let key_algorithm: KeyAlgorithm = options.key_algorithm.parse()?;

    info!(
        instance = %instance_id,
        source = %request.source,
        dest = %request.dest,
        strategies = ?strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
        "starting migration"
    );
    if options.delete_extraneous {
        info!("extraneous files will be deleted from the destination");
    }

    let source = volume::resolve(&request.source, options.ignore_mounted).await?;
    let dest = volume::resolve(&request.dest, options.ignore_mounted).await?;
    let migration = Migration {
        source: &source,
        dest: &dest,
        options,
        key_algorithm,
    };

    let mut outcomes = Vec::with_capacity(strategies.len());
    for strategy in strategies {
        if !strategy.is_applicable(&source, &dest) {
            info!(instance = %instance_id, strategy = %strategy, "strategy not applicable, skipping");
            outcomes.push(StrategyOutcome {
                strategy: strategy.name().to_string(),
                failure: AttemptFailure::Skipped,
            });
            continue;
        }

        info!(instance = %instance_id, strategy = %strategy, "trying strategy");
        let attempt = StrategyAttempt::new(instance_id, strategy);
        let result = strategy.execute(&attempt, &migration).await;
        attempt.cleanup().await;

        match result {
            Ok(()) => {
                info!(instance = %instance_id, strategy = %strategy, "migration succeeded");
                return Ok(strategy);
            }
            Err(e) => {
                warn!(instance = %instance_id, strategy = %strategy, error = %e, "strategy failed");
                outcomes.push(StrategyOutcome {
                    strategy: strategy.name().to_string(),
                    failure: AttemptFailure::Failed(Box::new(e)),
                });
            }
        }
    }

    Err(Error::AllStrategiesExhausted { outcomes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::testing::FakeCluster;
    use crate::volume::tests::{claim, mounting_pod, pinned_volume};

    const ID: &str = "abc12345";

    fn cluster(id: &str) -> Arc<FakeCluster> {
        let cluster = Arc::new(FakeCluster::new(id));
        cluster.simulate_controllers(&[]);
        cluster
    }

    fn request(
        source: &Arc<FakeCluster>,
        dest: &Arc<FakeCluster>,
        strategies: Option<&[&str]>,
    ) -> MigrationRequest {
        MigrationRequest {
            source: VolumeRef::new(source.clone(), "apps", "old-data"),
            dest: VolumeRef::new(dest.clone(), "apps", "new-data"),
            options: Options {
                strategies: strategies.map(|s| s.iter().map(|n| n.to_string()).collect()),
                ..Default::default()
            },
        }
    }

    fn seed_claims(source: &FakeCluster, dest: &FakeCluster, modes: &[&str]) {
        source.seed(&claim("apps", "old-data", modes, None));
        dest.seed(&claim("apps", "new-data", modes, None));
    }

    fn outcome_names(err: &Error) -> Vec<String> {
        match err {
            Error::AllStrategiesExhausted { outcomes } => {
                outcomes.iter().map(|o| o.strategy.clone()).collect()
            }
            other => panic!("expected aggregate error, got {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_strategy_fails_before_touching_cluster() {
        let c1 = cluster("c1");
        seed_claims(&c1, &c1, &["ReadWriteOnce"]);

        let err = run_instance(&request(&c1, &c1, Some(&["mnt2", "rclone"])), ID)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.is_fatal());
        assert_eq!(c1.create_count(), 0);
    }

    #[tokio::test]
    async fn unsupported_key_algorithm_fails_before_touching_cluster() {
        let c1 = cluster("c1");
        let mut req = request(&c1, &c1, None);
        req.options.key_algorithm = "dsa".to_string();

        let err = run_instance(&req, ID).await.unwrap_err();

        assert!(matches!(err, Error::Configuration { .. }));
        assert_eq!(c1.create_count(), 0);
    }

    #[tokio::test]
    async fn empty_strategy_list_is_configuration_error() {
        let c1 = cluster("c1");
        let err = run_instance(&request(&c1, &c1, Some(&[])), ID)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn missing_claim_aborts_with_resolution_error() {
        let c1 = cluster("c1");
        c1.seed(&claim("apps", "old-data", &["ReadWriteOnce"], None));

        let err = run_instance(&request(&c1, &c1, None), ID).await.unwrap_err();

        assert!(matches!(err, Error::Resolution { ref volume, .. } if volume == "apps/new-data"));
        assert_eq!(c1.create_count(), 0);
    }

    #[tokio::test]
    async fn mounted_claim_aborts_unless_ignored() {
        let c1 = cluster("c1");
        seed_claims(&c1, &c1, &["ReadWriteOnce"]);
        c1.seed(&mounting_pod("apps", "app-0", "old-data", "worker-1", "Running"));
        c1.seed(&mounting_pod("apps", "app-1", "new-data", "worker-1", "Running"));

        let err = run_instance(&request(&c1, &c1, None), ID).await.unwrap_err();
        assert!(matches!(err, Error::Resolution { .. }));

        let mut req = request(&c1, &c1, None);
        req.options.ignore_mounted = true;
        assert_eq!(run_instance(&req, ID).await.unwrap(), Strategy::Mount);
    }

    #[tokio::test(start_paused = true)]
    async fn single_applicable_strategy_runs_exactly_once() {
        let src = cluster("c1");
        let dst = cluster("c2");
        seed_claims(&src, &dst, &["ReadWriteOnce"]);

        let strategy = run_instance(&request(&src, &dst, Some(&["mnt2", "svc", "lbsvc"])), ID)
            .await
            .unwrap();

        assert_eq!(strategy, Strategy::LoadBalancer);
        assert_eq!(src.created("Pod"), vec!["volmigrate-lbsvc-sshd-abc12345"]);
        assert_eq!(dst.created("Job"), vec!["volmigrate-lbsvc-rsync-abc12345"]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_stops_the_search() {
        let c1 = cluster("c1");
        seed_claims(&c1, &c1, &["ReadWriteMany"]);

        let strategy = run_instance(&request(&c1, &c1, None), ID).await.unwrap();

        assert_eq!(strategy, Strategy::Mount);
        assert_eq!(c1.created("Job"), vec!["volmigrate-mnt2-rsync-abc12345"]);
        assert_eq!(c1.count_of("Pod"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_fall_through_in_caller_order() {
        let c1 = Arc::new(FakeCluster::new("c1"));
        c1.simulate_controllers(&["mnt2", "svc"]);
        seed_claims(&c1, &c1, &["ReadWriteMany"]);

        let strategy = run_instance(&request(&c1, &c1, Some(&["mnt2", "svc", "nodeport"])), ID)
            .await
            .unwrap();

        assert_eq!(strategy, Strategy::NodePort);
        assert_eq!(
            c1.created("Job"),
            vec![
                "volmigrate-mnt2-rsync-abc12345",
                "volmigrate-svc-rsync-abc12345",
                "volmigrate-nodeport-rsync-abc12345",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_lists_three_failures_in_order() {
        let c1 = Arc::new(FakeCluster::new("c1"));
        c1.simulate_controllers(&["mnt2", "svc", "nodeport"]);
        seed_claims(&c1, &c1, &["ReadWriteMany"]);

        let err = run_instance(&request(&c1, &c1, Some(&["mnt2", "svc", "nodeport"])), ID)
            .await
            .unwrap_err();

        assert_eq!(outcome_names(&err), ["mnt2", "svc", "nodeport"]);
        match err {
            Error::AllStrategiesExhausted { outcomes } => {
                for outcome in outcomes {
                    assert!(matches!(
                        outcome.failure,
                        AttemptFailure::Failed(ref e) if matches!(**e, Error::StrategyExecution { .. })
                    ));
                }
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_strategies_are_reported() {
        let src = cluster("c1");
        let dst = Arc::new(FakeCluster::new("c2"));
        dst.simulate_controllers(&["nodeport"]);
        seed_claims(&src, &dst, &["ReadWriteOnce"]);

        let err = run_instance(&request(&src, &dst, Some(&["svc", "nodeport"])), ID)
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("svc: skipped: not applicable"));
        assert!(message.contains("nodeport: workload Job apps/volmigrate-nodeport-rsync-abc12345 failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_is_cleaned_up() {
        let src = cluster("c1");
        let dst = Arc::new(FakeCluster::new("c2"));
        dst.simulate_controllers(&["nodeport"]);
        seed_claims(&src, &dst, &["ReadWriteOnce"]);
        let mut req = request(&src, &dst, Some(&["nodeport", "lbsvc"]));
        req.options.source_create_psp = true;
        req.options.dest_create_psp = true;

        run_instance(&req, ID).await.unwrap();

        for cluster in [&src, &dst] {
            for kind in ["Job", "Pod", "Service", "Secret", "ServiceAccount", "Role", "RoleBinding"] {
                assert_eq!(cluster.count_of(kind), 0, "{kind} left behind");
            }
            assert!(cluster.contains("PodSecurityPolicy", None, "volmigrate"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sshd_timeout_moves_on_to_next_strategy() {
        let c1 = Arc::new(FakeCluster::new("c1"));
        c1.simulate_controllers(&[]);
        c1.on_create(|obj| {
            let is_sshd = obj
                .metadata
                .name
                .as_deref()
                .is_some_and(|n| n.starts_with("volmigrate-svc-sshd"));
            if is_sshd && obj.types.as_ref().map(|t| t.kind.as_str()) == Some("Pod") {
                obj.data["status"] = serde_json::json!({ "phase": "Pending" });
            }
        });
        seed_claims(&c1, &c1, &["ReadWriteOnce"]);
        let mut req = request(&c1, &c1, Some(&["svc", "lbsvc"]));
        req.options.timeouts.ready = Duration::from_secs(30);

        let strategy = run_instance(&req, ID).await.unwrap();

        assert_eq!(strategy, Strategy::LoadBalancer);
        assert!(!c1.contains("Pod", Some("apps"), "volmigrate-svc-sshd-abc12345"));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_strategy_grants_both_sides_in_one_namespace() {
        let c1 = cluster("c1");
        seed_claims(&c1, &c1, &["ReadWriteOnce"]);
        let mut req = request(&c1, &c1, Some(&["svc"]));
        req.options.source_create_psp = true;
        req.options.dest_create_psp = true;

        let strategy = run_instance(&req, ID).await.unwrap();

        assert_eq!(strategy, Strategy::ClusterIp);
        assert_eq!(
            c1.created("ServiceAccount"),
            vec![
                "volmigrate-svc-src-access-abc12345",
                "volmigrate-svc-dst-access-abc12345",
            ]
        );
        assert_eq!(c1.count_of("ServiceAccount"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn claims_pinned_to_different_hosts_skip_mount() {
        let c1 = cluster("c1");
        c1.seed(&claim("apps", "old-data", &["ReadWriteOnce"], Some("pv-old")));
        c1.seed(&claim("apps", "new-data", &["ReadWriteOnce"], Some("pv-new")));
        c1.seed(&pinned_volume("pv-old", &["node-a"]));
        c1.seed(&pinned_volume("pv-new", &["node-b"]));

        let err = run_instance(&request(&c1, &c1, Some(&["mnt2"])), ID)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mnt2: skipped: not applicable"));
        assert_eq!(c1.count_of("Job"), 0);

        let strategy = run_instance(&request(&c1, &c1, None), ID).await.unwrap();
        assert_eq!(strategy, Strategy::ClusterIp);
    }

    #[tokio::test(start_paused = true)]
    async fn unschedulable_rsync_job_gives_up_after_ready_timeout() {
        let c1 = cluster("c1");
        c1.on_create(|obj| {
            let is_mount_job = obj
                .metadata
                .name
                .as_deref()
                .is_some_and(|n| n.starts_with("volmigrate-mnt2-rsync"));
            if is_mount_job {
                obj.data["status"] = serde_json::json!({ "active": 1, "ready": 0 });
            }
        });
        seed_claims(&c1, &c1, &["ReadWriteMany"]);
        let mut req = request(&c1, &c1, Some(&["mnt2", "svc"]));
        req.options.timeouts.ready = Duration::from_secs(60);

        let start = tokio::time::Instant::now();
        let strategy = run_instance(&req, ID).await.unwrap();

        assert_eq!(strategy, Strategy::ClusterIp);
        assert!(start.elapsed() < Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn private_key_is_removed_before_attempt_sweep() {
        let c1 = Arc::new(FakeCluster::new("c1"));
        c1.simulate_controllers(&["svc"]);
        seed_claims(&c1, &c1, &["ReadWriteOnce"]);

        run_instance(&request(&c1, &c1, Some(&["svc"])), ID)
            .await
            .unwrap_err();

        let deletions = c1.deletions();
        let position = |kind: &str, name: &str| {
            deletions
                .iter()
                .position(|(k, n)| k == kind && n == name)
                .unwrap()
        };
        assert!(
            position("Secret", "volmigrate-svc-privkey-abc12345")
                < position("Job", "volmigrate-svc-rsync-abc12345")
        );
        assert_eq!(c1.count_of("Secret"), 0);
    }
}
