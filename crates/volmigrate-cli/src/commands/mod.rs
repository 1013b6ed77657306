//! CLI commands

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;
use volmigrate_core::KubeClusterClient;

use crate::Result;

pub mod migrate;
pub mod rsync;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected cluster and the namespace its context defaults to
pub struct ClusterConnection {
    pub client: KubeClusterClient,
    pub default_namespace: String,
}

/// Connect to a cluster.
///
/// With neither a kubeconfig path nor a context the configuration is
/// inferred (in-cluster or `KUBECONFIG` / `~/.kube/config`).
pub async fn connect(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<ClusterConnection> {
    let mut config = match (kubeconfig, context) {
        (None, None) => Config::infer().await?,
        (path, context) => {
            let kubeconfig = match path {
                Some(path) => Kubeconfig::read_from(path)?,
                None => Kubeconfig::read()?,
            };
            let options = KubeConfigOptions {
                context: context.map(String::from),
                ..Default::default()
            };
            Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
    };
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);

    let cluster_id = config.cluster_url.to_string();
    let default_namespace = config.default_namespace.clone();
    debug!(cluster = %cluster_id, namespace = %default_namespace, "connecting");

    let client = Client::try_from(config)?;
    Ok(ClusterConnection {
        client: KubeClusterClient::new(client, cluster_id),
        default_namespace,
    })
}
