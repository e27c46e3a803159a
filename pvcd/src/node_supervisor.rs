//! Node Supervisor: registers the host, runs the Keepalive/Scheduler Engine
//! tick, evaluates peer liveness, drives primary-coordinator election, and
//! orchestrates node-flush workload evacuation (spec §4.3).

use std::time::Duration;

use pvcd_scheduling::{select_target, NodeSelector, NodeUsage};
use pvcd_types::{DaemonState, NodeDomainState, RouterState};

use crate::context::AgentContext;
use crate::error::ReconcileError;
use crate::store;

pub struct Telemetry {
    pub mem_free: u64,
    pub mem_used: u64,
    pub cpu_load: f64,
    pub vcpu_alloc: u32,
    pub domains_count: u32,
}

/// Publishes this node's own telemetry into the store (spec §4.3 KSE tick,
/// first bullet).
pub async fn publish_telemetry(ctx: &AgentContext, telemetry: &Telemetry) -> Result<(), ReconcileError> {
    let name = ctx.node_name();
    ctx.store
        .write(&store::node_path(name, "memfree"), telemetry.mem_free.to_string().as_bytes())
        .await?;
    ctx.store
        .write(&store::node_path(name, "memused"), telemetry.mem_used.to_string().as_bytes())
        .await?;
    ctx.store
        .write(&store::node_path(name, "cpuload"), telemetry.cpu_load.to_string().as_bytes())
        .await?;
    ctx.store
        .write(
            &store::node_path(name, "vcpualloc"),
            telemetry.vcpu_alloc.to_string().as_bytes(),
        )
        .await?;
    ctx.store
        .write(
            &store::node_path(name, "domainscount"),
            telemetry.domains_count.to_string().as_bytes(),
        )
        .await?;
    ctx.store
        .write(
            &store::node_path(name, "keepalive"),
            ctx.clock.now().as_secs().to_string().as_bytes(),
        )
        .await?;
    Ok(())
}

/// `age = now - keepalive` past `daemon_state == run` for a peer (spec §4.3,
/// §4.6). The caller decides what to do with the verdict (fence or not).
pub fn peer_is_overdue(now: Duration, peer_keepalive: Duration, grace: Duration) -> bool {
    now.saturating_sub(peer_keepalive) > grace
}

pub fn grace_window(ctx: &AgentContext) -> Duration {
    Duration::from_secs(ctx.config.keepalive_interval_secs * ctx.config.fencing_grace_ticks)
}

/// Node flush (spec §4.3). Marks the node `flush`, migrates every domain it
/// currently runs to a selected target, and finally marks `flushed` once
/// `runningdomains` is empty. Each domain's own `VmController` performs the
/// actual migration once its `/node`/`/state` change; this function only
/// issues the transactional writes that trigger that.
pub async fn begin_flush(
    ctx: &AgentContext,
    running: &[String],
    selectors: &[(String, NodeSelector)],
    candidates: &[NodeUsage],
) -> Result<(), ReconcileError> {
    store::write_node_domain_state(ctx, ctx.node_name(), NodeDomainState::Flush).await?;

    for domain_uuid in running {
        let selector = selectors
            .iter()
            .find(|(uuid, _)| uuid == domain_uuid)
            .map(|(_, selector)| *selector)
            .unwrap_or(NodeSelector::Mem);

        let uuid: uuid::Uuid = domain_uuid
            .parse()
            .map_err(|_| ReconcileError::Validation(format!("invalid domain uuid {domain_uuid}")))?;
        let node_limit = store::read_domain_node_limit(ctx, &uuid).await?;

        let target = select_target(candidates, selector, &node_limit, ctx.node_name())
            .map_err(ReconcileError::Transient)?
            .ok_or_else(|| ReconcileError::ClusterState(format!("no eligible flush target for {domain_uuid}")))?
            .to_string();

        store::write_domain_lastnode(ctx, &uuid, ctx.node_name()).await?;
        ctx.store
            .transaction(vec![
                pvcd_coordinator::TransactionOp::SetData {
                    path: &store::domain_path(&uuid, "node"),
                    value: target.as_bytes(),
                },
                pvcd_coordinator::TransactionOp::SetData {
                    path: &store::domain_path(&uuid, "state"),
                    value: &pvcd_types::encode(&pvcd_types::DomainState::Migrate),
                },
            ])
            .await?;
    }

    Ok(())
}

/// Called once `runningdomains` on self has emptied after a flush.
pub async fn complete_flush(ctx: &AgentContext) -> Result<(), ReconcileError> {
    let running = store::read_running_domains(ctx, ctx.node_name()).await?;
    if !running.is_empty() {
        return Err(ReconcileError::ClusterState(
            "cannot complete flush while domains are still running".to_string(),
        ));
    }
    store::write_node_domain_state(ctx, ctx.node_name(), NodeDomainState::Flushed).await
}

/// Unflush (spec §4.3): migrate back domains whose `lastnode == self`,
/// clearing `lastnode`, then autostart (spec §4.2 Autostart).
pub async fn unflush(ctx: &AgentContext, cluster_domains: &[String]) -> Result<(), ReconcileError> {
    store::write_node_domain_state(ctx, ctx.node_name(), NodeDomainState::Ready).await?;

    for domain_uuid in cluster_domains {
        let uuid: uuid::Uuid = domain_uuid
            .parse()
            .map_err(|_| ReconcileError::Validation(format!("invalid domain uuid {domain_uuid}")))?;
        if store::read_domain_lastnode(ctx, &uuid).await?.as_deref() == Some(ctx.node_name()) {
            ctx.store
                .transaction(vec![
                    pvcd_coordinator::TransactionOp::SetData {
                        path: &store::domain_path(&uuid, "node"),
                        value: ctx.node_name().as_bytes(),
                    },
                    pvcd_coordinator::TransactionOp::SetData {
                        path: &store::domain_path(&uuid, "state"),
                        value: &pvcd_types::encode(&pvcd_types::DomainState::Migrate),
                    },
                    pvcd_coordinator::TransactionOp::Delete {
                        path: &store::domain_path(&uuid, "lastnode"),
                    },
                ])
                .await?;
        }
    }

    autostart(ctx, cluster_domains).await
}

/// Iterate domains with `node_autostart == true` and `state in {stop,
/// disable}` whose `node` matches self; write `start` and clear the flag
/// (there is no separate autostart-flag field to clear beyond re-reading it,
/// since `node_autostart` is requester-owned policy, not mutated here).
async fn autostart(ctx: &AgentContext, cluster_domains: &[String]) -> Result<(), ReconcileError> {
    for domain_uuid in cluster_domains {
        let uuid: uuid::Uuid = domain_uuid
            .parse()
            .map_err(|_| ReconcileError::Validation(format!("invalid domain uuid {domain_uuid}")))?;
        if !store::read_domain_node_autostart(ctx, &uuid).await? {
            continue;
        }
        let node = store::read_domain_node(ctx, &uuid).await?;
        if node.as_deref() != Some(ctx.node_name()) {
            continue;
        }
        let state = store::read_domain_state(ctx, &uuid).await?;
        if matches!(state, pvcd_types::DomainState::Stop | pvcd_types::DomainState::Disable) {
            store::write_domain_state(ctx, &uuid, pvcd_types::DomainState::Start).await?;
        }
    }
    Ok(())
}

/// Primary election (spec §4.3): contend for `/primary_node` via
/// compare-and-swap from `none` to self. Only coordinator nodes with
/// `daemon_state == run` may attempt this.
pub async fn attempt_primary_election(ctx: &AgentContext) -> Result<bool, ReconcileError> {
    if !ctx.config.coordinator {
        return Ok(false);
    }
    if store::read_node_daemon_state(ctx, ctx.node_name()).await? != DaemonState::Run {
        return Ok(false);
    }

    let won = ctx
        .store
        .compare_and_swap("/primary_node", b"none", ctx.node_name().as_bytes())
        .await?;
    if !won {
        return Ok(false);
    }

    store::write_node_domain_state(ctx, ctx.node_name(), NodeDomainState::Ready).await?;
    ctx.store
        .write(
            &store::node_path(ctx.node_name(), "router_state"),
            &pvcd_types::encode(&RouterState::Takeover),
        )
        .await?;
    Ok(true)
}

/// The prior primary relinquishes: router state `relinquish`, then
/// `/primary_node = none` only after the caller has torn down gateways and
/// DHCP daemons.
pub async fn relinquish_primary(ctx: &AgentContext) -> Result<(), ReconcileError> {
    ctx.store
        .write(
            &store::node_path(ctx.node_name(), "router_state"),
            &pvcd_types::encode(&RouterState::Relinquish),
        )
        .await?;
    Ok(())
}

pub async fn finish_relinquish(ctx: &AgentContext) -> Result<(), ReconcileError> {
    ctx.store.write("/primary_node", b"none").await?;
    ctx.store
        .write(
            &store::node_path(ctx.node_name(), "router_state"),
            &pvcd_types::encode(&RouterState::Secondary),
        )
        .await?;
    Ok(())
}

pub async fn finish_takeover(ctx: &AgentContext) -> Result<(), ReconcileError> {
    ctx.store
        .write(
            &store::node_path(ctx.node_name(), "router_state"),
            &pvcd_types::encode(&RouterState::Primary),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pvcd_coordinator::{CoordinationStore, FakeStore};

    use super::*;
    use crate::config::NodeConfig;
    use crate::context::{AgentContext, FakeClock};

    #[test]
    fn peer_is_overdue_past_grace_window() {
        let grace = Duration::from_secs(30);
        assert!(!peer_is_overdue(Duration::from_secs(10), Duration::from_secs(0), grace));
        assert!(peer_is_overdue(Duration::from_secs(31), Duration::from_secs(0), grace));
    }

    fn coordinator_ctx(store: &Arc<dyn CoordinationStore>, node_name: &str) -> AgentContext {
        let mut config = NodeConfig::for_test(node_name);
        config.coordinator = true;
        AgentContext::new(Arc::clone(store), Arc::new(config), Arc::new(FakeClock::new()))
    }

    /// Testable Property 1 (spec §8): for all interleavings of coordinator
    /// joins, at most one node ends up holding `/primary_node`. Two nodes
    /// racing `attempt_primary_election` against the same store must not
    /// both win.
    #[tokio::test]
    async fn only_one_of_two_racing_nodes_wins_the_election() {
        let store: Arc<dyn CoordinationStore> = Arc::new(FakeStore::new());
        store.write("/primary_node", b"none").await.unwrap();
        let hv1 = coordinator_ctx(&store, "hv1");
        let hv2 = coordinator_ctx(&store, "hv2");
        store::write_node_daemon_state(&hv1, "hv1", DaemonState::Run).await.unwrap();
        store::write_node_daemon_state(&hv2, "hv2", DaemonState::Run).await.unwrap();

        let (won1, won2) = tokio::join!(attempt_primary_election(&hv1), attempt_primary_election(&hv2));
        let won1 = won1.unwrap();
        let won2 = won2.unwrap();

        assert_ne!(won1, won2, "exactly one of the two racing nodes must win");
        let primary = store.read("/primary_node").await.unwrap().unwrap();
        let expected = if won1 { "hv1" } else { "hv2" };
        assert_eq!(String::from_utf8(primary).unwrap(), expected);
    }

    #[tokio::test]
    async fn election_fails_when_primary_already_taken() {
        let store: Arc<dyn CoordinationStore> = Arc::new(FakeStore::new());
        store.write("/primary_node", b"hv9").await.unwrap();
        let hv1 = coordinator_ctx(&store, "hv1");
        store::write_node_daemon_state(&hv1, "hv1", DaemonState::Run).await.unwrap();

        assert!(!attempt_primary_election(&hv1).await.unwrap());
    }
}
