//! `mnt2`: one Job mounting both claims

use tracing::info;

use super::{Migration, StrategyAttempt};
use crate::access;
use crate::lifecycle;
use crate::naming::Side;
use crate::transfer::{TransferSpec, DEST_MOUNT, SOURCE_MOUNT};
use crate::volume::{AccessMode, VolumeDescriptor};
use crate::workload::{self, RsyncJobParams};
use crate::Result;

/// PVs pinned to disjoint sets of hosts can never be attached to one pod
fn affinity_disjoint(source: &VolumeDescriptor, dest: &VolumeDescriptor) -> bool {
    !source.affinity_nodes.is_empty()
        && !dest.affinity_nodes.is_empty()
        && !source
            .affinity_nodes
            .iter()
            .any(|node| dest.affinity_nodes.contains(node))
}

/// Both claims must be mountable by one pod: same namespace, compatible node
/// affinity, and either on the same node or shareable.
pub(super) fn is_applicable(source: &VolumeDescriptor, dest: &VolumeDescriptor) -> bool {
    if !source.same_namespace(dest) || affinity_disjoint(source, dest) {
        return false;
    }
    source.mounted_node == dest.mounted_node
        || source.supports(AccessMode::ReadOnlyMany)
        || source.supports(AccessMode::ReadWriteMany)
        || dest.supports(AccessMode::ReadWriteMany)
}

pub(super) async fn execute(attempt: &StrategyAttempt, migration: &Migration<'_>) -> Result<()> {
    let Migration {
        source,
        dest,
        options,
        ..
    } = migration;
    let client = dest.client.as_ref();
    let naming = attempt.naming();
    let timeouts = &options.timeouts;

    attempt.track(&dest.client, &dest.namespace).await;

    let service_account = access::prepare_service_account(
        client,
        naming,
        Side::Dest,
        &dest.namespace,
        options.dest_create_psp,
    )
    .await?;

    let transfer = TransferSpec {
        source: SOURCE_MOUNT.to_string(),
        dest: DEST_MOUNT.to_string(),
        delete_extraneous: options.delete_extraneous,
        preserve_ownership: options.preserve_ownership,
        remote: None,
        policy: options.transfer.clone(),
    };
    let node = source.mounted_node.as_deref().or(dest.mounted_node.as_deref());
    let job = workload::build_rsync_job(
        naming,
        &dest.namespace,
        &RsyncJobParams {
            image: &options.rsync_image,
            service_account: &service_account,
            dest_claim: &dest.name,
            source_claim: Some(source.name.as_str()),
            private_key: None,
            node,
            transfer: &transfer,
        },
    );

    let job = lifecycle::create(client, &job).await?;
    info!(job = %job.name(), node = ?node, "waiting for rsync job");
    super::await_rsync_job(client, &job, timeouts).await
}
