//! Network exposure of the sshd endpoint
//!
//! The sshd pod is published through a Service whose type follows the
//! strategy's exposure mode. Address assignment is asynchronous for every
//! mode except ClusterIP, so [`resolve_address`] polls until the Service (and
//! for NodePort, the node hosting the pod) reports something routable.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, info};

use crate::client::ClusterClient;
use crate::lifecycle::{self, Handle};
use crate::naming::{selector_string, Component, Naming};
use crate::{Error, Result};

/// Port sshd listens on inside the pod and on ClusterIP/LoadBalancer services
pub const SSH_PORT: u16 = 22;

/// How the sshd endpoint is reached from the destination side
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExposureMode {
    /// ClusterIP, reachable from inside the same cluster
    ClusterInternal,
    /// NodePort, reachable wherever the node's addresses route
    NodeLocal,
    /// LoadBalancer, reachable through an externally assigned address
    ExternallyRoutable,
}

impl ExposureMode {
    /// Kubernetes Service type for this mode
    pub fn service_type(&self) -> &'static str {
        match self {
            ExposureMode::ClusterInternal => "ClusterIP",
            ExposureMode::NodeLocal => "NodePort",
            ExposureMode::ExternallyRoutable => "LoadBalancer",
        }
    }
}

impl fmt::Display for ExposureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_type())
    }
}

/// A created Service and what it selects
#[derive(Clone, Debug)]
pub struct ExposureHandle {
    /// The Service object
    pub service: Handle<Service>,
    /// Requested mode
    pub mode: ExposureMode,
    /// Pod selector of the Service
    pub selector: BTreeMap<String, String>,
}

/// A resolved `host:port`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// IP address or DNS name
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn build_service(
    naming: &Naming,
    namespace: &str,
    selector: &BTreeMap<String, String>,
    mode: ExposureMode,
) -> Service {
    Service {
        metadata: naming.metadata(Component::Sshd, namespace),
        spec: Some(ServiceSpec {
            type_: Some(mode.service_type().to_string()),
            selector: Some(selector.clone()),
            ports: Some(vec![ServicePort {
                name: Some("ssh".to_string()),
                port: i32::from(SSH_PORT),
                target_port: Some(IntOrString::Int(i32::from(SSH_PORT))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create a Service of the mode's type selecting `selector` on port 22
pub async fn expose(
    client: &dyn ClusterClient,
    naming: &Naming,
    namespace: &str,
    selector: BTreeMap<String, String>,
    mode: ExposureMode,
) -> Result<ExposureHandle> {
    let service = lifecycle::create(client, &build_service(naming, namespace, &selector, mode))
        .await
        .map_err(|e| Error::exposure(mode.service_type(), e.to_string()))?;

    info!(service = %service.name(), mode = %mode, "exposed sshd");
    Ok(ExposureHandle {
        service,
        mode,
        selector,
    })
}

fn cluster_ip(service: &Service) -> Option<String> {
    service
        .spec
        .as_ref()?
        .cluster_ip
        .clone()
        .filter(|ip| !ip.is_empty() && ip != "None")
}

fn node_port(service: &Service) -> Option<i32> {
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find_map(|p| p.node_port)
}

fn ingress_host(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|i| {
            i.ip
                .clone()
                .filter(|ip| !ip.is_empty())
                .or_else(|| i.hostname.clone().filter(|h| !h.is_empty()))
        })
}

/// Prefer ExternalIP, fall back to InternalIP
fn node_address(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    ["ExternalIP", "InternalIP"].iter().find_map(|type_| {
        addresses
            .iter()
            .find(|a| a.type_ == *type_ && !a.address.is_empty())
            .map(|a| a.address.clone())
    })
}

async fn node_endpoint(
    client: &dyn ClusterClient,
    handle: &ExposureHandle,
    port: i32,
) -> Result<Option<Endpoint>> {
    let port = u16::try_from(port).map_err(|_| {
        Error::exposure(handle.mode.service_type(), format!("invalid node port {}", port))
    })?;

    let selector = selector_string(&handle.selector);
    let pods: Vec<Pod> =
        lifecycle::list(client, handle.service.namespace(), Some(&selector)).await?;
    let Some(node_name) = pods
        .iter()
        .find_map(|p| p.spec.as_ref().and_then(|s| s.node_name.clone()))
    else {
        return Ok(None);
    };

    let node: Handle<Node> = Handle::new(&node_name, None);
    let Some(node) = lifecycle::get(client, &node).await? else {
        return Ok(None);
    };

    match node_address(&node) {
        Some(host) => Ok(Some(Endpoint { host, port })),
        None => Err(Error::exposure(
            handle.mode.service_type(),
            format!("node {} has no ExternalIP or InternalIP address", node_name),
        )),
    }
}

/// Poll until the exposure has a reachable address
pub async fn resolve_address(
    client: &dyn ClusterClient,
    handle: &ExposureHandle,
    timeout: Duration,
    interval: Duration,
) -> Result<Endpoint> {
    let what = format!("address of {}", handle.service.describe());
    let endpoint = lifecycle::poll_until(timeout, interval, &what, || async move {
        let Some(service) = lifecycle::get(client, &handle.service).await? else {
            return Ok(None);
        };
        match handle.mode {
            ExposureMode::ClusterInternal => Ok(cluster_ip(&service).map(|host| Endpoint {
                host,
                port: SSH_PORT,
            })),
            ExposureMode::NodeLocal => match node_port(&service) {
                Some(port) => node_endpoint(client, handle, port).await,
                None => Ok(None),
            },
            ExposureMode::ExternallyRoutable => Ok(ingress_host(&service).map(|host| Endpoint {
                host,
                port: SSH_PORT,
            })),
        }
    })
    .await?;

    debug!(service = %handle.service.name(), endpoint = %endpoint, "resolved endpoint");
    Ok(endpoint)
}
