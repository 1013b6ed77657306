//! `svc`, `nodeport`, `lbsvc`: rsync over ssh
//!
//! The source side runs an sshd pod serving the source claim read-only with
//! the attempt's public key authorized. The destination side runs the rsync
//! job with the private key, pulling from the exposed sshd endpoint.

use tracing::info;

use super::{Migration, StrategyAttempt};
use crate::exposure::{self, ExposureMode};
use crate::naming::{Component, Side};
use crate::transfer::{RemoteEndpoint, TransferSpec, DEST_MOUNT, SOURCE_MOUNT};
use crate::workload::{self, RsyncJobParams};
use crate::{access, keys, lifecycle, Result};

pub(super) async fn execute(
    attempt: &StrategyAttempt,
    migration: &Migration<'_>,
    mode: ExposureMode,
) -> Result<()> {
    let Migration {
        source,
        dest,
        options,
        key_algorithm,
    } = migration;
    let naming = attempt.naming();
    let timeouts = &options.timeouts;
    let source_client = source.client.as_ref();
    let dest_client = dest.client.as_ref();

    attempt.track(&source.client, &source.namespace).await;
    attempt.track(&dest.client, &dest.namespace).await;

    let (source_sa, dest_sa) = tokio::try_join!(
        access::prepare_service_account(
            source_client,
            naming,
            Side::Source,
            &source.namespace,
            options.source_create_psp,
        ),
        access::prepare_service_account(
            dest_client,
            naming,
            Side::Dest,
            &dest.namespace,
            options.dest_create_psp,
        ),
    )?;

    info!(algorithm = %key_algorithm, "generating ssh key pair");
    let key_pair = keys::generate(*key_algorithm)?;

    let public_key = lifecycle::create(
        source_client,
        &workload::public_key_secret(naming, &source.namespace, &key_pair),
    )
    .await?;

    let sshd = lifecycle::create(
        source_client,
        &workload::build_sshd_pod(
            naming,
            &source.namespace,
            &source.name,
            public_key.name(),
            &options.sshd_image,
            &source_sa,
            source.mounted_node.as_deref(),
        ),
    )
    .await?;
    info!(pod = %sshd.name(), "waiting for sshd");
    lifecycle::wait_until_ready(source_client, &sshd, timeouts.ready, timeouts.poll_interval)
        .await?;

    let exposure = exposure::expose(
        source_client,
        naming,
        &source.namespace,
        naming.selector(Component::Sshd),
        mode,
    )
    .await?;
    let endpoint = exposure::resolve_address(
        source_client,
        &exposure,
        timeouts.address,
        timeouts.poll_interval,
    )
    .await?;
    info!(endpoint = %endpoint, "sshd reachable");

    let private_key = lifecycle::create(
        dest_client,
        &workload::private_key_secret(naming, &dest.namespace, &key_pair),
    )
    .await?;
    drop(key_pair);

    let transfer = TransferSpec {
        source: SOURCE_MOUNT.to_string(),
        dest: DEST_MOUNT.to_string(),
        delete_extraneous: options.delete_extraneous,
        preserve_ownership: options.preserve_ownership,
        remote: Some(RemoteEndpoint {
            host: endpoint.host,
            port: endpoint.port,
            connect_timeout: options.transfer.connect_timeout,
        }),
        policy: options.transfer.clone(),
    };
    let job = lifecycle::create(
        dest_client,
        &workload::build_rsync_job(
            naming,
            &dest.namespace,
            &RsyncJobParams {
                image: &options.rsync_image,
                service_account: &dest_sa,
                dest_claim: &dest.name,
                source_claim: None,
                private_key: Some((private_key.name(), *key_algorithm)),
                node: dest.mounted_node.as_deref(),
                transfer: &transfer,
            },
        ),
    )
    .await?;

    info!(job = %job.name(), "waiting for rsync job");
    let result = super::await_rsync_job(dest_client, &job, timeouts).await;

    // the private key outlives the transfer only until here
    lifecycle::delete(dest_client, &private_key).await;
    result
}
