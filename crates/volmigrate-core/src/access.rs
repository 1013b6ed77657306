//! Least-privilege access for transfer workloads
//!
//! Clusters that enforce PodSecurityPolicy only admit the sshd and rsync pods
//! when their service account may `use` a policy allowing them. One shared,
//! cluster-scoped policy named `volmigrate` is created on demand and never
//! deleted; each attempt then gets its own ServiceAccount, Role and
//! RoleBinding granting nothing beyond `use` of that policy.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use tracing::{debug, info};

use crate::client::ClusterClient;
use crate::error::is_already_exists;
use crate::lifecycle;
use crate::naming::{Component, Naming, Side};
use crate::{Error, Result, LABEL_MANAGED_BY, LABEL_MANAGED_BY_VOLMIGRATE};

/// Name of the shared PodSecurityPolicy
pub const SHARED_POLICY_NAME: &str = "volmigrate";

/// Service account used when no grant is required
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Per-attempt access objects in one namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessGrant {
    /// Namespace the grant lives in
    pub namespace: String,
    /// ServiceAccount the workload runs as
    pub service_account: String,
    /// Role allowing `use` of the shared policy
    pub role: String,
    /// Binding of the role to the service account
    pub role_binding: String,
}

fn policy_resource() -> ApiResource {
    ApiResource {
        group: "policy".to_string(),
        version: "v1beta1".to_string(),
        api_version: "policy/v1beta1".to_string(),
        kind: "PodSecurityPolicy".to_string(),
        plural: "podsecuritypolicies".to_string(),
    }
}

fn shared_policy(ar: &ApiResource) -> DynamicObject {
    let mut policy = DynamicObject::new(SHARED_POLICY_NAME, ar).data(serde_json::json!({
        "spec": {
            "runAsUser": { "rule": "RunAsAny" },
            "runAsGroup": { "rule": "RunAsAny" },
            "fsGroup": { "rule": "RunAsAny" },
            "seLinux": { "rule": "RunAsAny" },
            "supplementalGroups": { "rule": "RunAsAny" },
            "volumes": ["secret", "persistentVolumeClaim"]
        }
    }));
    policy.metadata.labels = Some(
        [(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_VOLMIGRATE.to_string(),
        )]
        .into_iter()
        .collect(),
    );
    policy
}

/// Create the shared policy unless it already exists.
///
/// Safe under concurrent first use: "already exists" is success.
pub async fn ensure_shared_policy(client: &dyn ClusterClient) -> Result<()> {
    let ar = policy_resource();
    match client.create(&ar, None, &shared_policy(&ar)).await {
        Ok(_) => {
            info!(policy = SHARED_POLICY_NAME, "created shared pod security policy");
            Ok(())
        }
        Err(e) if is_already_exists(&e) => {
            debug!(policy = SHARED_POLICY_NAME, "shared pod security policy already exists");
            Ok(())
        }
        Err(e) => Err(Error::provisioning("pod-security-policy", e.to_string())),
    }
}

fn service_account(naming: &Naming, side: Side, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: naming.metadata(Component::Access(side), namespace),
        ..Default::default()
    }
}

fn role(naming: &Naming, side: Side, namespace: &str) -> Role {
    Role {
        metadata: naming.metadata(Component::Access(side), namespace),
        rules: Some(vec![PolicyRule {
            verbs: vec!["use".to_string()],
            api_groups: Some(vec!["policy".to_string()]),
            resources: Some(vec!["podsecuritypolicies".to_string()]),
            resource_names: Some(vec![SHARED_POLICY_NAME.to_string()]),
            ..Default::default()
        }]),
    }
}

fn role_binding(naming: &Naming, side: Side, namespace: &str) -> RoleBinding {
    let name = naming.name(Component::Access(side));
    RoleBinding {
        metadata: naming.metadata(Component::Access(side), namespace),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

/// Create ServiceAccount, Role and RoleBinding for `side` in sequence.
///
/// Source and destination grants have distinct names, so both may live in
/// the same namespace. The first failure is reported with its sub-step. Objects created before it
/// are left for the attempt cleanup.
pub async fn grant_access(
    client: &dyn ClusterClient,
    naming: &Naming,
    side: Side,
    namespace: &str,
) -> Result<AccessGrant> {
    let sa = lifecycle::create(client, &service_account(naming, side, namespace))
        .await
        .map_err(|e| Error::provisioning("service-account", e.to_string()))?;
    let role = lifecycle::create(client, &role(naming, side, namespace))
        .await
        .map_err(|e| Error::provisioning("role", e.to_string()))?;
    let binding = lifecycle::create(client, &role_binding(naming, side, namespace))
        .await
        .map_err(|e| Error::provisioning("role-binding", e.to_string()))?;

    info!(
        namespace = %namespace,
        service_account = %sa.name(),
        "granted pod security policy access"
    );
    Ok(AccessGrant {
        namespace: namespace.to_string(),
        service_account: sa.name().to_string(),
        role: role.name().to_string(),
        role_binding: binding.name().to_string(),
    })
}

/// Service account a workload in `namespace` should run as.
///
/// Without `create_psp` this is the namespace's default account and nothing
/// is created.
pub async fn prepare_service_account(
    client: &dyn ClusterClient,
    naming: &Naming,
    side: Side,
    namespace: &str,
    create_psp: bool,
) -> Result<String> {
    if !create_psp {
        return Ok(DEFAULT_SERVICE_ACCOUNT.to_string());
    }
    ensure_shared_policy(client).await?;
    Ok(grant_access(client, naming, side, namespace).await?.service_account)
}
