//! Deterministic names and labels for ephemeral objects
//!
//! Every object a migration creates is named
//! `volmigrate-<component>-<instance>` and labelled with the instance id,
//! the component tag and the strategy. External tooling can find and
//! garbage-collect a migration's footprint from the labels alone.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::Rng;

use crate::{
    LABEL_COMPONENT, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_MANAGED_BY_VOLMIGRATE,
    LABEL_STRATEGY, NAME_PREFIX,
};

/// Length of a generated instance id
const INSTANCE_ID_LEN: usize = 8;

const INSTANCE_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random instance id (lowercase alphanumeric, DNS-label safe)
pub fn generate_instance_id() -> String {
    let mut rng = rand::thread_rng();
    (0..INSTANCE_ID_LEN)
        .map(|_| INSTANCE_ID_CHARSET[rng.gen_range(0..INSTANCE_ID_CHARSET.len())] as char)
        .collect()
}

/// Role an ephemeral object plays within a strategy attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    /// The rsync Job
    Rsync,
    /// The sshd Pod and its Service
    Sshd,
    /// Secret holding the private key
    PrivateKey,
    /// Secret holding the public key
    PublicKey,
    /// ServiceAccount, Role and RoleBinding of an access grant
    Access(Side),
}

/// Which end of the migration an object serves
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Next to the source claim
    Source,
    /// Next to the destination claim
    Dest,
}

impl Component {
    /// Tag used in names and labels
    pub fn tag(&self) -> &'static str {
        match self {
            Component::Rsync => "rsync",
            Component::Sshd => "sshd",
            Component::PrivateKey => "privkey",
            Component::PublicKey => "pubkey",
            Component::Access(Side::Source) => "src-access",
            Component::Access(Side::Dest) => "dst-access",
        }
    }
}

/// Names and labels for one strategy attempt of one migration instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Naming {
    instance_id: String,
    strategy: &'static str,
}

impl Naming {
    /// Scope names to an instance and a strategy
    pub fn new(instance_id: impl Into<String>, strategy: &'static str) -> Self {
        Self {
            instance_id: instance_id.into(),
            strategy,
        }
    }

    /// Migration instance id
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Strategy name
    pub fn strategy(&self) -> &'static str {
        self.strategy
    }

    /// Component tag, e.g. `svc-sshd`
    pub fn component_tag(&self, component: Component) -> String {
        format!("{}-{}", self.strategy, component.tag())
    }

    /// Object name, e.g. `volmigrate-svc-sshd-k3j9x0ab`
    pub fn name(&self, component: Component) -> String {
        format!(
            "{}-{}-{}",
            NAME_PREFIX,
            self.component_tag(component),
            self.instance_id
        )
    }

    /// Full label set for a component
    pub fn labels(&self, component: Component) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_INSTANCE.to_string(), self.instance_id.clone());
        labels.insert(LABEL_COMPONENT.to_string(), self.component_tag(component));
        labels.insert(LABEL_STRATEGY.to_string(), self.strategy.to_string());
        labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_VOLMIGRATE.to_string(),
        );
        labels
    }

    /// Selector matching exactly one component's pods
    pub fn selector(&self, component: Component) -> BTreeMap<String, String> {
        let mut selector = BTreeMap::new();
        selector.insert(LABEL_INSTANCE.to_string(), self.instance_id.clone());
        selector.insert(LABEL_COMPONENT.to_string(), self.component_tag(component));
        selector
    }

    /// Label selector string matching everything this attempt created
    pub fn attempt_selector(&self) -> String {
        format!(
            "{}={},{}={}",
            LABEL_INSTANCE, self.instance_id, LABEL_STRATEGY, self.strategy
        )
    }

    /// ObjectMeta with name, namespace and labels filled in
    pub fn metadata(&self, component: Component, namespace: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name(component)),
            namespace: Some(namespace.to_string()),
            labels: Some(self.labels(component)),
            ..Default::default()
        }
    }
}

/// Render a label map as a selector string (`k=v,k=v`)
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
