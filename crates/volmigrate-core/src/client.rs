//! Kubernetes API capability used by the engine
//!
//! The core never touches `kube::Api` directly. Everything goes through
//! [`ClusterClient`], which only knows how to create, get, list and delete a
//! named object of a given kind. This keeps the engine testable against an
//! in-memory cluster and lets source and destination live on different
//! API servers with different credentials.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;

use crate::error::is_not_found;

/// Trait abstracting the Kubernetes operations volmigrate needs
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Identity of the API server this client talks to.
    ///
    /// Two clients with the same id reach the same cluster, which is what
    /// decides whether in-cluster strategies apply.
    fn cluster_id(&self) -> String;

    /// Create an object
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    /// Get an object by name, `None` if it does not exist
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error>;

    /// List objects, optionally filtered by label selector
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, kube::Error>;

    /// Delete an object with background propagation
    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), kube::Error>;
}

/// Real Kubernetes client implementation
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    cluster_id: String,
}

impl KubeClusterClient {
    /// Wrap a kube client; `cluster_id` is typically the API server URL
    pub fn new(client: Client, cluster_id: impl Into<String>) -> Self {
        Self {
            client,
            cluster_id: cluster_id.into(),
        }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    fn cluster_id(&self) -> String {
        self.cluster_id.clone()
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        self.api(resource, namespace)
            .create(&PostParams::default(), object)
            .await
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error> {
        match self.api(resource, namespace).get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, kube::Error> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(self.api(resource, namespace).list(&params).await?.items)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), kube::Error> {
        self.api(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }
}
