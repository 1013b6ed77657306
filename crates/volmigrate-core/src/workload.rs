//! Pod, Job and Secret construction
//!
//! Builders are pure: they take names from [`Naming`] and return typed
//! objects for [`crate::lifecycle::create`].

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec,
    Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::exposure::SSH_PORT;
use crate::keys::{KeyAlgorithm, KeyPair};
use crate::naming::{Component, Naming};
use crate::transfer::{TransferSpec, DEST_MOUNT, SOURCE_MOUNT};

/// Secret key holding the private half
pub const PRIVATE_KEY_ENTRY: &str = "privateKey";

/// Secret key holding the public half
pub const PUBLIC_KEY_ENTRY: &str = "publicKey";

/// Where sshd reads authorized keys from
const AUTHORIZED_KEYS_PATH: &str = "/root/.ssh/authorized_keys";

/// Command of the rsync container; the image ships the volmigrate binary
const TRANSFER_COMMAND: &str = "volmigrate";

/// Owner read-only
const KEY_FILE_MODE: i32 = 0o400;

/// Rsync jobs never retry at the pod level; the transfer protocol does.
const RSYNC_BACKOFF_LIMIT: i32 = 0;

/// Finished rsync jobs are garbage-collected after ten minutes
const RSYNC_TTL_SECONDS: i32 = 600;

fn key_secret(
    naming: &Naming,
    component: Component,
    namespace: &str,
    entry: &str,
    value: &str,
) -> Secret {
    Secret {
        metadata: naming.metadata(component, namespace),
        string_data: Some(BTreeMap::from([(entry.to_string(), value.to_string())])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Secret holding the private key, consumed by the rsync job
pub fn private_key_secret(naming: &Naming, namespace: &str, keys: &KeyPair) -> Secret {
    key_secret(
        naming,
        Component::PrivateKey,
        namespace,
        PRIVATE_KEY_ENTRY,
        &keys.private_key,
    )
}

/// Secret holding the public key, consumed by the sshd pod
pub fn public_key_secret(naming: &Naming, namespace: &str, keys: &KeyPair) -> Secret {
    key_secret(
        naming,
        Component::PublicKey,
        namespace,
        PUBLIC_KEY_ENTRY,
        &keys.public_key,
    )
}

fn claim_volume(name: &str, claim: &str, read_only: bool) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            read_only: Some(read_only),
        }),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            default_mode: Some(KEY_FILE_MODE),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(volume: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

fn file_mount(volume: &str, path: &str, entry: &str) -> VolumeMount {
    VolumeMount {
        sub_path: Some(entry.to_string()),
        ..mount(volume, path, true)
    }
}

/// Build the sshd pod serving the source claim read-only.
///
/// The pod is pinned to `node` when the claim is already mounted there.
pub fn build_sshd_pod(
    naming: &Naming,
    namespace: &str,
    source_claim: &str,
    public_key_secret: &str,
    image: &str,
    service_account: &str,
    node: Option<&str>,
) -> Pod {
    let container = Container {
        name: "sshd".to_string(),
        image: Some(image.to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("ssh".to_string()),
            container_port: i32::from(SSH_PORT),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            mount("source-vol", SOURCE_MOUNT, true),
            file_mount("public-key-vol", AUTHORIZED_KEYS_PATH, PUBLIC_KEY_ENTRY),
        ]),
        ..Default::default()
    };

    Pod {
        metadata: naming.metadata(Component::Sshd, namespace),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(vec![
                claim_volume("source-vol", source_claim, true),
                secret_volume("public-key-vol", public_key_secret),
            ]),
            service_account_name: Some(service_account.to_string()),
            node_name: node.map(String::from),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Inputs of [`build_rsync_job`]
#[derive(Clone, Debug)]
pub struct RsyncJobParams<'a> {
    /// Image shipping `rsync`, `ssh` and the volmigrate binary
    pub image: &'a str,
    /// Service account the pod runs as
    pub service_account: &'a str,
    /// Claim mounted at `/dest`
    pub dest_claim: &'a str,
    /// Claim mounted read-only at `/source` (local copies only)
    pub source_claim: Option<&'a str>,
    /// Private key secret and algorithm (network copies only)
    pub private_key: Option<(&'a str, KeyAlgorithm)>,
    /// Node to pin the pod to
    pub node: Option<&'a str>,
    /// Transfer parameters rendered into the container args
    pub transfer: &'a TransferSpec,
}

/// Build the run-to-completion rsync job
pub fn build_rsync_job(naming: &Naming, namespace: &str, params: &RsyncJobParams<'_>) -> Job {
    let mut volumes = vec![claim_volume("dest-vol", params.dest_claim, false)];
    let mut mounts = vec![mount("dest-vol", DEST_MOUNT, false)];

    if let Some(source) = params.source_claim {
        volumes.push(claim_volume("source-vol", source, true));
        mounts.push(mount("source-vol", SOURCE_MOUNT, true));
    }
    if let Some((secret, algorithm)) = params.private_key {
        volumes.push(secret_volume("private-key-vol", secret));
        mounts.push(file_mount(
            "private-key-vol",
            &algorithm.ssh_identity_file(),
            PRIVATE_KEY_ENTRY,
        ));
    }

    let container = Container {
        name: "rsync".to_string(),
        image: Some(params.image.to_string()),
        command: Some(vec![TRANSFER_COMMAND.to_string()]),
        args: Some(params.transfer.workload_args()),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    Job {
        metadata: naming.metadata(Component::Rsync, namespace),
        spec: Some(JobSpec {
            backoff_limit: Some(RSYNC_BACKOFF_LIMIT),
            ttl_seconds_after_finished: Some(RSYNC_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(naming.labels(Component::Rsync)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    service_account_name: Some(params.service_account.to_string()),
                    node_name: params.node.map(String::from),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
