//! In-memory cluster for unit tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::Resource;
use serde::Serialize;

use crate::client::ClusterClient;
use crate::LABEL_STRATEGY;

/// Node every simulated pod is scheduled on
pub const SIMULATED_NODE: &str = "worker-1";

type Key = (String, Option<String>, String);
type CreateHook = Box<dyn Fn(&mut DynamicObject) + Send + Sync>;

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

/// A fake API server keyed by (kind, namespace, name) with call counters
pub struct FakeCluster {
    id: String,
    objects: Mutex<BTreeMap<Key, DynamicObject>>,
    hooks: Mutex<Vec<CreateHook>>,
    created: Mutex<Vec<Key>>,
    reject_kinds: Mutex<Vec<(String, u16)>>,
    fail_gets: AtomicBool,
    deleted: Mutex<Vec<Key>>,
}

impl FakeCluster {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            hooks: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            reject_kinds: Mutex::new(Vec::new()),
            fail_gets: AtomicBool::new(false),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Mutate every object as it is created (simulates controllers filling in status)
    pub fn on_create(&self, hook: impl Fn(&mut DynamicObject) + Send + Sync + 'static) {
        self.hooks.lock().unwrap().push(Box::new(hook));
    }

    /// Behave like a healthy cluster: pods start, services get addresses,
    /// rsync jobs complete. Jobs of the strategies in `failing` fail instead.
    pub fn simulate_controllers(&self, failing: &[&str]) {
        let failing: Vec<String> = failing.iter().map(|s| s.to_string()).collect();
        self.seed(&k8s_openapi::api::core::v1::Node {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(SIMULATED_NODE.to_string()),
                ..Default::default()
            },
            status: Some(k8s_openapi::api::core::v1::NodeStatus {
                addresses: Some(vec![k8s_openapi::api::core::v1::NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: "10.0.0.4".to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });

        self.on_create(move |obj| {
            let kind = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
            match kind.as_str() {
                "Pod" => {
                    if obj.data["spec"]["nodeName"].is_null() {
                        obj.data["spec"]["nodeName"] = serde_json::json!(SIMULATED_NODE);
                    }
                    obj.data["status"] = serde_json::json!({
                        "phase": "Running",
                        "containerStatuses": [{
                            "name": "sshd",
                            "image": "sshd",
                            "imageID": "",
                            "ready": true,
                            "restartCount": 0,
                            "state": { "running": {} }
                        }]
                    });
                }
                "Service" => {
                    obj.data["spec"]["clusterIP"] = serde_json::json!("10.96.0.10");
                    obj.data["spec"]["ports"][0]["nodePort"] = serde_json::json!(30022);
                    obj.data["status"] = serde_json::json!({
                        "loadBalancer": { "ingress": [{ "ip": "198.51.100.7" }] }
                    });
                }
                "Job" => {
                    let strategy = obj
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(LABEL_STRATEGY).cloned())
                        .unwrap_or_default();
                    let condition = if failing.contains(&strategy) {
                        serde_json::json!({
                            "type": "Failed",
                            "status": "True",
                            "reason": "BackoffLimitExceeded",
                            "message": "rsync exited 23"
                        })
                    } else {
                        serde_json::json!({ "type": "Complete", "status": "True" })
                    };
                    obj.data["status"] = serde_json::json!({ "conditions": [condition] });
                }
                _ => {}
            }
        });
    }

    /// Make every `get` fail with a 500
    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Reject creation of `kind` with the given HTTP status code
    pub fn reject_creates(&self, kind: &str, code: u16) {
        self.reject_kinds
            .lock()
            .unwrap()
            .push((kind.to_string(), code));
    }

    /// Store an object without counting it as a create call
    pub fn seed<K: Resource<DynamicType = ()> + Serialize>(&self, object: &K) {
        let value = serde_json::to_value(object).unwrap();
        let obj: DynamicObject = serde_json::from_value(value).unwrap();
        let key = (
            K::kind(&()).into_owned(),
            obj.metadata.namespace.clone(),
            obj.metadata.name.clone().unwrap(),
        );
        self.objects.lock().unwrap().insert(key, obj);
    }

    /// Number of successful create calls
    pub fn create_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Number of successful delete calls
    pub fn delete_count(&self) -> usize {
        self.deleted.lock().unwrap().len()
    }

    /// `(kind, name)` of deleted objects, in deletion order
    pub fn deletions(&self) -> Vec<(String, String)> {
        self.deleted
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, _, name)| (kind.clone(), name.clone()))
            .collect()
    }

    /// Names of created objects of `kind`, in creation order
    pub fn created(&self, kind: &str) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _, _)| k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Number of objects currently stored
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Number of stored objects of `kind`
    pub fn count_of(&self, kind: &str) -> usize {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(k, _, _)| k == kind)
            .count()
    }

    pub fn contains(&self, kind: &str, namespace: Option<&str>, name: &str) -> bool {
        let key = (
            kind.to_string(),
            namespace.map(String::from),
            name.to_string(),
        );
        self.objects.lock().unwrap().contains_key(&key)
    }

    /// Fetch a stored object as JSON
    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> serde_json::Value {
        let key = (
            kind.to_string(),
            namespace.map(String::from),
            name.to_string(),
        );
        let objects = self.objects.lock().unwrap();
        serde_json::to_value(objects.get(&key).unwrap()).unwrap()
    }
}

fn matches_selector(obj: &DynamicObject, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(pair),
        })
}

#[async_trait]
impl ClusterClient for FakeCluster {
    fn cluster_id(&self) -> String {
        self.id.clone()
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let name = object.metadata.name.clone().unwrap_or_default();

        if let Some((_, code)) = self
            .reject_kinds
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| *k == resource.kind)
        {
            return Err(api_error(
                *code,
                "Rejected",
                format!("{} {} rejected", resource.kind, name),
            ));
        }

        let key = (resource.kind.clone(), namespace.map(String::from), name.clone());
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", resource.kind, name),
            ));
        }

        let mut stored = object.clone();
        stored.metadata.namespace = namespace.map(String::from);
        for hook in self.hooks.lock().unwrap().iter() {
            hook(&mut stored);
        }
        objects.insert(key.clone(), stored.clone());
        self.created.lock().unwrap().push(key);
        Ok(stored)
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(api_error(500, "InternalError", "etcd unavailable".to_string()));
        }
        let key = (
            resource.kind.clone(),
            namespace.map(String::from),
            name.to_string(),
        );
        Ok(self.objects.lock().unwrap().get(&key).cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, kube::Error> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((kind, ns, _), obj)| {
                *kind == resource.kind
                    && (namespace.is_none() || ns.as_deref() == namespace)
                    && matches_selector(obj, label_selector)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), kube::Error> {
        let key = (
            resource.kind.clone(),
            namespace.map(String::from),
            name.to_string(),
        );
        let removed = self.objects.lock().unwrap().remove(&key);
        match removed {
            Some(_) => {
                self.deleted.lock().unwrap().push(key);
                Ok(())
            }
            None => Err(api_error(
                404,
                "NotFound",
                format!("{} \"{}\" not found", resource.kind, name),
            )),
        }
    }
}
