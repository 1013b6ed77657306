//! Ephemeral object lifecycle: create, observe, wait, delete
//!
//! The Kubernetes API is declarative and asynchronous. Every state transition
//! the engine depends on (pod running, job completed, address assigned) is
//! observed by polling with an explicit timeout, never assumed.
//!
//! All functions are generic over the typed `k8s_openapi` resource and go
//! through [`ClusterClient`] as `DynamicObject`s.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::ClusterClient;
use crate::error::is_not_found;
use crate::retry::retry_api;
use crate::{Error, Result};

/// Final state of a run-to-completion workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalStatus {
    /// Exited zero
    Succeeded,
    /// Exited non-zero or was killed
    Failed {
        /// Reason reported by Kubernetes
        message: String,
    },
}

impl TerminalStatus {
    /// Turn a failed status into [`Error::StrategyExecution`] attributed to `workload`
    pub fn into_result(self, workload: impl Into<String>) -> Result<()> {
        match self {
            TerminalStatus::Succeeded => Ok(()),
            TerminalStatus::Failed { message } => {
                Err(Error::strategy_execution(workload, message))
            }
        }
    }
}

/// Kind-specific readiness and completion predicates
pub trait StatusProbe {
    /// Whether the object reached its "ready" state
    fn is_ready(&self) -> bool;

    /// Terminal status, `None` while still running (or for kinds that never terminate)
    fn terminal(&self) -> Option<TerminalStatus> {
        None
    }
}

impl StatusProbe for Pod {
    fn is_ready(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        if status.phase.as_deref() != Some("Running") {
            return false;
        }
        status
            .container_statuses
            .as_ref()
            .map(|containers| {
                !containers.is_empty()
                    && containers
                        .iter()
                        .all(|c| c.state.as_ref().and_then(|s| s.running.as_ref()).is_some())
            })
            .unwrap_or(false)
    }

    fn terminal(&self) -> Option<TerminalStatus> {
        let status = self.status.as_ref()?;
        match status.phase.as_deref() {
            Some("Succeeded") => Some(TerminalStatus::Succeeded),
            Some("Failed") => Some(TerminalStatus::Failed {
                message: status
                    .message
                    .clone()
                    .or_else(|| status.reason.clone())
                    .unwrap_or_else(|| "pod failed".to_string()),
            }),
            _ => None,
        }
    }
}

impl StatusProbe for Job {
    /// A pod of the Job is running. Pending pods count as `active` but not
    /// as `ready`, so an unschedulable Job never gets here.
    fn is_ready(&self) -> bool {
        let ready = self
            .status
            .as_ref()
            .and_then(|s| s.ready)
            .unwrap_or(0);
        ready > 0 || self.terminal() == Some(TerminalStatus::Succeeded)
    }

    fn terminal(&self) -> Option<TerminalStatus> {
        let conditions = self.status.as_ref()?.conditions.as_ref()?;
        if conditions
            .iter()
            .any(|c| c.type_ == "Complete" && c.status == "True")
        {
            return Some(TerminalStatus::Succeeded);
        }
        conditions
            .iter()
            .find(|c| c.type_ == "Failed" && c.status == "True")
            .map(|c| TerminalStatus::Failed {
                message: c
                    .message
                    .clone()
                    .or_else(|| c.reason.clone())
                    .unwrap_or_else(|| "job failed".to_string()),
            })
    }
}

/// Reference to an object created through [`create`]
pub struct Handle<K> {
    name: String,
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> std::fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl<K: Resource<DynamicType = ()>> Handle<K> {
    /// Handle to an existing object
    pub fn new(name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            name: name.into(),
            namespace,
            _kind: PhantomData,
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Object namespace (`None` for cluster-scoped kinds)
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Resource kind
    pub fn kind(&self) -> String {
        K::kind(&()).into_owned()
    }

    /// Human-readable `Kind namespace/name`
    pub fn describe(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{} {}/{}", self.kind(), ns, self.name),
            None => format!("{} {}", self.kind(), self.name),
        }
    }
}

fn to_dynamic<K: Serialize>(object: &K) -> std::result::Result<DynamicObject, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(object)?)
}

fn from_dynamic<K: DeserializeOwned>(
    object: DynamicObject,
) -> std::result::Result<K, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(object)?)
}

/// Submit a new object.
///
/// Fails with [`Error::Creation`] on any API error. Not retried: the names are
/// deterministic per instance, so a conflict is a bug, not a transient state.
pub async fn create<K>(client: &dyn ClusterClient, object: &K) -> Result<Handle<K>>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let kind = K::kind(&()).into_owned();
    let name = object.meta().name.clone().unwrap_or_default();
    let namespace = object.meta().namespace.clone();

    let dynamic = to_dynamic(object).map_err(|e| Error::creation(&kind, &name, e.to_string()))?;
    client
        .create(&ApiResource::erase::<K>(&()), namespace.as_deref(), &dynamic)
        .await
        .map_err(|e| Error::creation(&kind, &name, e.to_string()))?;

    debug!(kind = %kind, name = %name, namespace = ?namespace, "created object");
    Ok(Handle::new(name, namespace))
}

/// Fetch the current state of an object.
///
/// Transient API failures are retried with backoff before surfacing as
/// [`Error::Watch`]. A missing object is `Ok(None)`.
pub async fn get<K>(client: &dyn ClusterClient, handle: &Handle<K>) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let ar = &ApiResource::erase::<K>(&());
    let operation = format!("get {}", handle.describe());
    let object = retry_api(&operation, move || {
        client.get(ar, handle.namespace(), handle.name())
    })
    .await
    .map_err(|e| Error::watch(handle.kind(), handle.name(), e.to_string()))?;

    object
        .map(from_dynamic)
        .transpose()
        .map_err(|e| Error::watch(handle.kind(), handle.name(), e.to_string()))
}

/// List objects of kind `K` in `namespace`, retrying transient API failures
pub async fn list<K>(
    client: &dyn ClusterClient,
    namespace: Option<&str>,
    selector: Option<&str>,
) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let ar = &ApiResource::erase::<K>(&());
    let scope = namespace.unwrap_or("<cluster>");
    let operation = format!("list {} in {}", ar.kind, scope);
    let objects = retry_api(&operation, move || {
        client.list(ar, namespace, selector)
    })
    .await
    .map_err(|e| Error::watch(&ar.kind, scope, e.to_string()))?;

    objects
        .into_iter()
        .map(from_dynamic)
        .collect::<std::result::Result<Vec<K>, _>>()
        .map_err(|e| Error::watch(&ar.kind, scope, e.to_string()))
}

/// Poll `check` every `interval` until it yields a value or `timeout` elapses.
///
/// Errors returned by `check` abort the wait immediately.
pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    what: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::timeout(what, timeout));
        }

        trace!(what = %what, "condition not met yet");
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// Block until the object reports ready.
///
/// A workload that terminates with failure before becoming ready fails the
/// wait with [`Error::StrategyExecution`] rather than running into the timeout.
pub async fn wait_until_ready<K>(
    client: &dyn ClusterClient,
    handle: &Handle<K>,
    timeout: Duration,
    interval: Duration,
) -> Result<()>
where
    K: Resource<DynamicType = ()> + DeserializeOwned + StatusProbe,
{
    let what = format!("{} to become ready", handle.describe());
    poll_until(timeout, interval, &what, || async move {
        match get(client, handle).await? {
            None => Ok(None),
            Some(obj) if obj.is_ready() => Ok(Some(())),
            Some(obj) => match obj.terminal() {
                Some(TerminalStatus::Failed { message }) => {
                    Err(Error::strategy_execution(handle.describe(), message))
                }
                _ => Ok(None),
            },
        }
    })
    .await?;

    debug!(object = %handle.describe(), "object ready");
    Ok(())
}

/// Block until the object reaches a terminal state
pub async fn wait_until_terminal<K>(
    client: &dyn ClusterClient,
    handle: &Handle<K>,
    timeout: Duration,
    interval: Duration,
) -> Result<TerminalStatus>
where
    K: Resource<DynamicType = ()> + DeserializeOwned + StatusProbe,
{
    let what = format!("{} to complete", handle.describe());
    let status = poll_until(timeout, interval, &what, || async move {
        Ok(get(client, handle).await?.and_then(|obj| obj.terminal()))
    })
    .await?;

    debug!(object = %handle.describe(), status = ?status, "object terminal");
    Ok(status)
}

/// Wait for a workload to finish and turn failure into [`Error::StrategyExecution`]
pub async fn wait_until_succeeded<K>(
    client: &dyn ClusterClient,
    handle: &Handle<K>,
    timeout: Duration,
    interval: Duration,
) -> Result<()>
where
    K: Resource<DynamicType = ()> + DeserializeOwned + StatusProbe,
{
    wait_until_terminal(client, handle, timeout, interval)
        .await?
        .into_result(handle.describe())
}

async fn delete_object(
    client: &dyn ClusterClient,
    ar: &ApiResource,
    namespace: Option<&str>,
    name: &str,
) -> bool {
    let operation = format!("delete {} {}", ar.kind, name);
    let result = retry_api(&operation, || async move {
        match client.delete(ar, namespace, name).await {
            Err(e) if is_not_found(&e) => Ok(()),
            other => other,
        }
    })
    .await;

    match result {
        Ok(()) => {
            debug!(kind = %ar.kind, name = %name, namespace = ?namespace, "deleted object");
            true
        }
        Err(e) => {
            warn!(kind = %ar.kind, name = %name, namespace = ?namespace, error = %e, "failed to delete object");
            false
        }
    }
}

/// Best-effort delete: an already-gone object is fine, other failures are logged
pub async fn delete<K>(client: &dyn ClusterClient, handle: &Handle<K>)
where
    K: Resource<DynamicType = ()>,
{
    delete_object(
        client,
        &ApiResource::erase::<K>(&()),
        handle.namespace(),
        handle.name(),
    )
    .await;
}

/// Namespaced kinds an attempt may create, in deletion order
fn ephemeral_kinds() -> [ApiResource; 7] {
    [
        ApiResource::erase::<Job>(&()),
        ApiResource::erase::<Pod>(&()),
        ApiResource::erase::<Service>(&()),
        ApiResource::erase::<Secret>(&()),
        ApiResource::erase::<RoleBinding>(&()),
        ApiResource::erase::<Role>(&()),
        ApiResource::erase::<ServiceAccount>(&()),
    ]
}

/// Best-effort delete of every ephemeral object matching `selector` in `namespace`.
///
/// Returns the number of objects deleted.
pub async fn sweep(client: &dyn ClusterClient, namespace: &str, selector: &str) -> usize {
    let mut deleted = 0;

    for ar in ephemeral_kinds() {
        let objects = match client.list(&ar, Some(namespace), Some(selector)).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(kind = %ar.kind, namespace = %namespace, error = %e, "failed to list objects for cleanup");
                continue;
            }
        };

        for obj in objects {
            let Some(name) = obj.metadata.name.as_deref() else {
                continue;
            };
            if delete_object(client, &ar, Some(namespace), name).await {
                deleted += 1;
            }
        }
    }

    deleted
}
