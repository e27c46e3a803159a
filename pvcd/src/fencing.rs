//! Fencing Module: forced power reset of a peer observed dead past the
//! liveness grace window, followed by VM relocation (spec §4.6). Only the
//! node holding `/primary_node` performs fencing for a given peer.

use pvcd_scheduling::{select_target, NodeUsage};
use pvcd_sys::run_foreground;
use pvcd_types::{DaemonState, DomainState};

use crate::config::OobCredentials;
use crate::context::AgentContext;
use crate::error::ReconcileError;
use crate::store;

/// Power-cycles `peer` through its out-of-band management interface.
/// Grounded in the Process Runner pattern: shells to `ipmitool`, the
/// standard out-of-band power tool, the same way other external
/// collaborators are invoked.
pub fn power_cycle(peer_creds: &OobCredentials) -> Result<(), ReconcileError> {
    run_foreground(
        "ipmitool",
        &[
            "-I",
            "lanplus",
            "-H",
            &peer_creds.address,
            "-U",
            &peer_creds.username,
            "-P",
            &peer_creds.password,
            "chassis",
            "power",
            "cycle",
        ],
    )
    .map_err(|err| ReconcileError::Process {
        program: "ipmitool".to_string(),
        exit_code: -1,
        stderr: err.to_string(),
    })?
    .into_result()
    .map(|_| ())
    .map_err(|err| ReconcileError::Process {
        program: "ipmitool".to_string(),
        exit_code: -1,
        stderr: err.to_string(),
    })
}

/// Runs the fencing sequence for `peer` (spec §4.6). Only called once
/// `now - peer.keepalive > grace` has already been confirmed by the caller
/// and this node holds `/primary_node`.
pub async fn fence_peer(
    ctx: &AgentContext,
    peer: &str,
    peer_domains: &[String],
    candidates: &[NodeUsage],
) -> Result<(), ReconcileError> {
    store::write_node_daemon_state(ctx, peer, DaemonState::Dead).await?;

    let creds = ctx
        .config
        .oob
        .get(peer)
        .ok_or_else(|| ReconcileError::ClusterState(format!("no out-of-band credentials for peer {peer}")))?;

    match power_cycle(creds) {
        Ok(()) => {
            store::write_node_daemon_state(ctx, peer, DaemonState::Fenced).await?;
            relocate_domains(ctx, peer, peer_domains, candidates).await
        }
        Err(err) => {
            tracing::warn!(%peer, %err, "fencing failed, leaving peer dead and not relocating its VMs");
            Ok(())
        }
    }
}

/// For every domain owned by `peer` in `start`, flush its RBD locks and
/// reassign it to a freshly selected node (spec §4.6 step 3).
async fn relocate_domains(
    ctx: &AgentContext,
    peer: &str,
    peer_domains: &[String],
    candidates: &[NodeUsage],
) -> Result<(), ReconcileError> {
    for domain_uuid in peer_domains {
        let uuid: uuid::Uuid = domain_uuid
            .parse()
            .map_err(|_| ReconcileError::Validation(format!("invalid domain uuid {domain_uuid}")))?;

        if store::read_domain_node(ctx, &uuid).await?.as_deref() != Some(peer) {
            continue;
        }
        if store::read_domain_state(ctx, &uuid).await? != DomainState::Start {
            continue;
        }

        crate::storage_facade::flush_domain_locks(ctx, &uuid).await?;

        let selector = store::read_domain_node_selector(ctx, &uuid).await?;
        let node_limit = store::read_domain_node_limit(ctx, &uuid).await?;
        let target = select_target(candidates, selector, &node_limit, peer)
            .map_err(ReconcileError::Transient)?
            .ok_or_else(|| ReconcileError::ClusterState(format!("no eligible fencing target for {domain_uuid}")))?
            .to_string();

        ctx.store
            .transaction(vec![
                pvcd_coordinator::TransactionOp::SetData {
                    path: &store::domain_path(&uuid, "node"),
                    value: target.as_bytes(),
                },
                pvcd_coordinator::TransactionOp::SetData {
                    path: &store::domain_path(&uuid, "state"),
                    value: &pvcd_types::encode(&DomainState::Start),
                },
            ])
            .await?;
    }
    Ok(())
}

pub fn should_fence(now_secs: u64, peer_keepalive_secs: u64, grace_secs: u64, peer_daemon_state: DaemonState) -> bool {
    use std::time::Duration;
    peer_daemon_state == DaemonState::Run
        && crate::node_supervisor::peer_is_overdue(
            Duration::from_secs(now_secs),
            Duration::from_secs(peer_keepalive_secs),
            Duration::from_secs(grace_secs),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_only_running_peers_past_grace() {
        assert!(should_fence(100, 0, 30, DaemonState::Run));
        assert!(!should_fence(20, 0, 30, DaemonState::Run));
        assert!(!should_fence(100, 0, 30, DaemonState::Dead));
    }
}

