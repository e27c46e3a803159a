//! Per-node hypervisor agent entry point: loads configuration, connects to
//! the coordination store, and runs the Node Supervisor's KSE tick loop
//! alongside per-domain VM Controllers until asked to shut down.

mod command_queue;
mod config;
mod context;
mod driver;
mod error;
mod fencing;
mod network_controller;
mod node_supervisor;
mod storage_facade;
mod store;
mod vm_controller;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::mpsc;

use context::{AgentContext, SystemClock};
use pvcd_coordinator::{CoordinationStore, Coordinator};

const CONFIG_PATH_ENV: &str = "PVCD_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/pvcd/pvcd.conf";
const SESSION_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> Result<()> {
    pvcd_log::init_logger("PVCD_LOG", pvcd_log::Level::INFO)?;

    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Arc::new(config::NodeConfig::load(std::path::Path::new(&config_path))?);

    pvcd_daemon::catch_shutdown_signal(std::future::pending())?;
    pvcd_daemon::catch_reload_signal(std::future::pending())?;

    run(config).await
}

async fn run(config: Arc<config::NodeConfig>) -> Result<()> {
    let coordinator = Coordinator::connect(&config.coordination_store, SESSION_TIMEOUT)
        .await
        .context("failed to connect to coordination store")?;
    coordinator.session_state_listener(|| {
        tracing::error!("coordination-store session lost, exiting for a clean restart");
        std::process::exit(1);
    });
    let store: Arc<dyn CoordinationStore> = Arc::new(coordinator);
    let ctx = AgentContext::new(store, config.clone(), Arc::new(SystemClock::default()));

    register_node(&ctx).await?;

    let driver: Arc<dyn driver::VirtDriver> = Arc::new(driver::VirshDriver);
    let mut controllers: HashMap<uuid::Uuid, mpsc::Sender<vm_controller::VmEvent>> = HashMap::new();
    let dhcp_daemons: tokio::sync::Mutex<HashMap<u32, network_controller::NetworkDaemon>> =
        tokio::sync::Mutex::new(HashMap::new());

    let mut tick = tokio::time::interval(Duration::from_secs(ctx.config.keepalive_interval_secs));
    loop {
        tokio::select! {
            _ = pvcd_daemon::shutdown_future() => {
                tracing::info!("shutdown requested, stopping node agent");
                break;
            }
            _ = tick.tick() => {
                if let Err(err) = kse_tick(&ctx, &driver, &mut controllers, &dhcp_daemons).await {
                    tracing::warn!(%err, "KSE tick failed");
                }
            }
        }
    }

    Ok(())
}

async fn register_node(ctx: &AgentContext) -> Result<()> {
    store::write_node_daemon_state(ctx, ctx.node_name(), pvcd_types::DaemonState::Init)
        .await
        .context("failed to register node")?;
    store::write_node_daemon_state(ctx, ctx.node_name(), pvcd_types::DaemonState::Run).await?;
    store::write_node_domain_state(ctx, ctx.node_name(), pvcd_types::NodeDomainState::Ready).await?;
    Ok(())
}

/// One Keepalive/Scheduler Engine tick (spec §4.3): publish telemetry,
/// ensure every domain assigned to self has a running controller task, and
/// attempt primary election.
async fn kse_tick(
    ctx: &AgentContext,
    driver: &Arc<dyn driver::VirtDriver>,
    controllers: &mut HashMap<uuid::Uuid, mpsc::Sender<vm_controller::VmEvent>>,
    dhcp_daemons: &tokio::sync::Mutex<HashMap<u32, network_controller::NetworkDaemon>>,
) -> Result<()> {
    node_supervisor::publish_telemetry(
        ctx,
        &node_supervisor::Telemetry {
            mem_free: 0,
            mem_used: 0,
            cpu_load: 0.0,
            vcpu_alloc: 0,
            domains_count: controllers.len() as u32,
        },
    )
    .await?;

    node_supervisor::attempt_primary_election(ctx).await?;

    for uuid_str in ctx.store.list_children("/domains").await? {
        let Ok(uuid) = uuid_str.parse::<uuid::Uuid>() else {
            continue;
        };
        let sender = controllers.entry(uuid).or_insert_with(|| {
            let (tx, _handle) = vm_controller::VmController::spawn(uuid, ctx.clone(), driver.clone());
            tx
        });
        let _ = sender.send(vm_controller::VmEvent::Changed).await;
    }

    reconcile_networks(ctx, dhcp_daemons).await?;
    check_peer_liveness(ctx).await?;
    process_command_queue(ctx, dhcp_daemons).await?;
    reconcile_flush(ctx).await?;

    Ok(())
}

/// Progresses a node's own flush/unflush lifecycle (spec §4.3): once every
/// domain has left a `flush`-ing node's `runningdomains`, mark it `flushed`.
async fn reconcile_flush(ctx: &AgentContext) -> Result<()> {
    let domain_state = store::read_node_domain_state(ctx, ctx.node_name()).await?;
    if domain_state == pvcd_types::NodeDomainState::Flush {
        let running = store::read_running_domains(ctx, ctx.node_name()).await?;
        if running.is_empty() {
            node_supervisor::complete_flush(ctx).await?;
        }
    }
    Ok(())
}

/// Network Controller per-tick reconciliation (spec §4.4): every node keeps
/// its local overlay interfaces up; only the primary owns gateway/DHCP.
async fn reconcile_networks(
    ctx: &AgentContext,
    dhcp_daemons: &tokio::sync::Mutex<HashMap<u32, network_controller::NetworkDaemon>>,
) -> Result<()> {
    let is_primary = ctx.store.read("/primary_node").await?.as_deref() == Some(ctx.node_name().as_bytes());
    let mut seen = std::collections::HashSet::new();
    let mut dhcp_daemons = dhcp_daemons.lock().await;

    for vni_str in ctx.store.list_children("/networks").await? {
        let Ok(vni) = vni_str.parse::<u32>() else { continue };
        seen.insert(vni);
        if let Err(err) = network_controller::ensure_overlay(vni, &ctx.config.overlay_carrier) {
            tracing::warn!(vni, %err, "failed to reconcile overlay interface");
            continue;
        }
        if !is_primary {
            continue;
        }
        let Some(raw) = ctx.store.read(&store::network_path(vni, "ip4_gateway")).await? else {
            continue;
        };
        let Ok(gateway) = String::from_utf8_lossy(&raw).trim().parse::<pvcd_network_types::Ipv4Cidr>() else {
            continue;
        };
        if let Err(err) = network_controller::assert_gateway(vni, &gateway) {
            tracing::warn!(vni, %err, "failed to assert gateway address");
        }

        let dhcp4 = ctx
            .store
            .read(&store::network_path(vni, "dhcp4"))
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).trim() == "true")
            .unwrap_or(false);
        if !dhcp4 {
            dhcp_daemons.remove(&vni);
            continue;
        }
        if dhcp_daemons.contains_key(&vni) {
            continue;
        }
        let (Some(start_raw), Some(end_raw)) = (
            ctx.store.read(&store::network_path(vni, "dhcp4_start")).await?,
            ctx.store.read(&store::network_path(vni, "dhcp4_end")).await?,
        ) else {
            continue;
        };
        let range_start = String::from_utf8_lossy(&start_raw).trim().to_string();
        let range_end = String::from_utf8_lossy(&end_raw).trim().to_string();
        match network_controller::NetworkDaemon::start(vni, &gateway, &range_start, &range_end) {
            Ok(daemon) => {
                dhcp_daemons.insert(vni, daemon);
            }
            Err(err) => tracing::warn!(vni, %err, "failed to start dhcp daemon"),
        }
    }

    dhcp_daemons.retain(|vni, _| seen.contains(vni) && is_primary);
    if let Err(err) = network_controller::reconcile_overlay_removals(&seen) {
        tracing::warn!(%err, "failed to remove overlay for a deleted network");
    }
    Ok(())
}

/// Node Supervisor peer-liveness check (spec §4.3, §4.6): only the primary
/// fences a dead peer.
async fn check_peer_liveness(ctx: &AgentContext) -> Result<()> {
    let is_primary = ctx.store.read("/primary_node").await?.as_deref() == Some(ctx.node_name().as_bytes());
    if !is_primary {
        return Ok(());
    }

    let grace = node_supervisor::grace_window(ctx).as_secs();
    let now = ctx.clock.now().as_secs();

    for peer in ctx.store.list_children("/nodes").await? {
        if peer == ctx.node_name() {
            continue;
        }
        let daemon_state = store::read_node_daemon_state(ctx, &peer).await?;
        let Some(raw) = ctx.store.read(&store::node_path(&peer, "keepalive")).await? else {
            continue;
        };
        let Ok(keepalive) = String::from_utf8_lossy(&raw).trim().parse::<u64>() else {
            continue;
        };
        if !fencing::should_fence(now, keepalive, grace, daemon_state) {
            continue;
        }

        tracing::warn!(%peer, "peer past liveness grace window, fencing");
        let peer_domains = ctx.store.list_children("/domains").await?;
        let candidates = healthy_node_candidates(ctx).await?;
        if let Err(err) = fencing::fence_peer(ctx, &peer, &peer_domains, &candidates).await {
            tracing::warn!(%peer, %err, "fencing attempt failed");
        }
    }
    Ok(())
}

/// Reads telemetry for every node with `daemon_state == run` and
/// `domain_state == ready`, for use as flush/fencing placement candidates
/// (spec §4.3, §4.6).
async fn healthy_node_candidates(ctx: &AgentContext) -> Result<Vec<pvcd_scheduling::NodeUsage>> {
    let mut usages = Vec::new();
    for name in ctx.store.list_children("/nodes").await? {
        if store::read_node_daemon_state(ctx, &name).await? != pvcd_types::DaemonState::Run {
            continue;
        }
        if store::read_node_domain_state(ctx, &name).await? != pvcd_types::NodeDomainState::Ready {
            continue;
        }
        let read_u64 = |field: &'static str| {
            let ctx = ctx.clone();
            let name = name.clone();
            async move {
                ctx.store
                    .read(&store::node_path(&name, field))
                    .await
                    .ok()
                    .flatten()
                    .and_then(|raw| String::from_utf8_lossy(&raw).trim().parse().ok())
                    .unwrap_or(0)
            }
        };
        usages.push(pvcd_scheduling::NodeUsage {
            name: name.clone(),
            mem_free: read_u64("memfree").await,
            mem_used: read_u64("memused").await,
            cpu_load: ctx
                .store
                .read(&store::node_path(&name, "cpuload"))
                .await?
                .and_then(|raw| String::from_utf8_lossy(&raw).trim().parse().ok())
                .unwrap_or(0.0),
            vcpu_alloc: read_u64("vcpualloc").await as u32,
            running_domains: read_u64("domainscount").await as u32,
        });
    }
    Ok(usages)
}

/// Domain verbs from the Command Queue (spec §4.5, §6 `vm` CLI group).
struct DomainCommandHandler;

#[async_trait::async_trait]
impl command_queue::CommandHandler for DomainCommandHandler {
    async fn handle(
        &self,
        ctx: &AgentContext,
        request: &command_queue::Request,
    ) -> Result<String, error::ReconcileError> {
        let mut args = request.args.split_whitespace();
        let uuid_arg = args.next().unwrap_or_default();
        let uuid: uuid::Uuid = uuid_arg
            .parse()
            .map_err(|_| error::ReconcileError::Validation(format!("invalid domain uuid {uuid_arg}")))?;

        match request.verb.as_str() {
            "start" => store::write_domain_state(ctx, &uuid, pvcd_types::DomainState::Start).await?,
            "shutdown" => store::write_domain_state(ctx, &uuid, pvcd_types::DomainState::Shutdown).await?,
            "stop" => store::write_domain_state(ctx, &uuid, pvcd_types::DomainState::Stop).await?,
            "restart" => store::write_domain_state(ctx, &uuid, pvcd_types::DomainState::Restart).await?,
            "disable" => store::write_domain_state(ctx, &uuid, pvcd_types::DomainState::Disable).await?,
            "migrate" | "move" => {
                let target = args
                    .next()
                    .ok_or_else(|| error::ReconcileError::Validation("migrate requires a target node".to_string()))?;
                store::write_domain_node(ctx, &uuid, target).await?;
                store::write_domain_state(ctx, &uuid, pvcd_types::DomainState::Migrate).await?;
            }
            "unmigrate" => {
                let lastnode = store::read_domain_lastnode(ctx, &uuid)
                    .await?
                    .ok_or_else(|| error::ReconcileError::ClusterState(format!("domain {uuid} has no lastnode")))?;
                store::write_domain_node(ctx, &uuid, &lastnode).await?;
                store::write_domain_state(ctx, &uuid, pvcd_types::DomainState::Migrate).await?;
            }
            "flush-locks" => vm_controller::flush_locks(ctx, &uuid).await?,
            other => {
                return Err(error::ReconcileError::Validation(format!("unknown vm verb {other}")));
            }
        }
        Ok(uuid_arg.to_string())
    }
}

/// Storage verbs from the Command Queue (spec §4.5, §6 `storage` CLI group).
struct StorageCommandHandler;

#[async_trait::async_trait]
impl command_queue::CommandHandler for StorageCommandHandler {
    async fn handle(
        &self,
        ctx: &AgentContext,
        request: &command_queue::Request,
    ) -> Result<String, error::ReconcileError> {
        let mut args = request.args.split_whitespace();
        match request.verb.as_str() {
            "flush-locks" => {
                let uuid_arg = args.next().unwrap_or_default();
                let uuid: uuid::Uuid = uuid_arg
                    .parse()
                    .map_err(|_| error::ReconcileError::Validation(format!("invalid domain uuid {uuid_arg}")))?;
                vm_controller::flush_locks(ctx, &uuid).await?;
                Ok(uuid_arg.to_string())
            }
            "list-locks" => {
                let volume = args
                    .next()
                    .ok_or_else(|| error::ReconcileError::Validation("list-locks requires a volume".to_string()))?;
                let locks = storage_facade::list_locks(volume)?;
                Ok(locks.iter().map(|l| format!("{}/{}", l.id, l.locker)).collect::<Vec<_>>().join(","))
            }
            other => Err(error::ReconcileError::Validation(format!("unknown storage verb {other}"))),
        }
    }
}

/// Network verbs from the Command Queue (spec §4.5, §6 `network` CLI group):
/// re-materialize an overlay's firewall chains, insert a new firewall rule at
/// a given order, or SIGHUP its DHCP daemon after a reservation change.
struct NetworkCommandHandler<'a> {
    dhcp_daemons: &'a tokio::sync::Mutex<HashMap<u32, network_controller::NetworkDaemon>>,
}

impl NetworkCommandHandler<'_> {
    async fn read_rules(
        ctx: &AgentContext,
        vni: u32,
        direction: &str,
    ) -> Result<Vec<network_controller::FirewallRule>, error::ReconcileError> {
        let dir_path = format!("{}/{direction}", store::network_path(vni, "firewall_rules"));
        let mut rules = Vec::new();
        for order_str in ctx.store.list_children(&dir_path).await? {
            let Ok(order) = order_str.parse::<u32>() else { continue };
            let Some(raw) = ctx
                .store
                .read(&network_controller::firewall_rule_path(vni, direction, order))
                .await?
            else {
                continue;
            };
            rules.push(network_controller::FirewallRule {
                order,
                spec: String::from_utf8_lossy(&raw).trim().to_string(),
            });
        }
        rules.sort_by_key(|r| r.order);
        Ok(rules)
    }

    async fn write_rules(
        ctx: &AgentContext,
        vni: u32,
        direction: &str,
        rules: &[network_controller::FirewallRule],
    ) -> Result<(), error::ReconcileError> {
        for rule in rules {
            ctx.store
                .write(
                    &network_controller::firewall_rule_path(vni, direction, rule.order),
                    rule.spec.as_bytes(),
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl command_queue::CommandHandler for NetworkCommandHandler<'_> {
    async fn handle(
        &self,
        ctx: &AgentContext,
        request: &command_queue::Request,
    ) -> Result<String, error::ReconcileError> {
        let mut args = request.args.split_whitespace();
        let vni_arg = args.next().unwrap_or_default();
        let vni: u32 = vni_arg
            .parse()
            .map_err(|_| error::ReconcileError::Validation(format!("invalid network vni {vni_arg}")))?;

        match request.verb.as_str() {
            "firewall-sync" => {
                for direction in ["in", "out"] {
                    let rules = Self::read_rules(ctx, vni, direction).await?;
                    network_controller::materialize_chain(vni, direction, &rules)?;
                }
                Ok(vni_arg.to_string())
            }
            "add-firewall-rule" => {
                let direction = args
                    .next()
                    .ok_or_else(|| error::ReconcileError::Validation("add-firewall-rule requires a direction".to_string()))?;
                let order: u32 = args
                    .next()
                    .ok_or_else(|| error::ReconcileError::Validation("add-firewall-rule requires an order".to_string()))?
                    .parse()
                    .map_err(|_| error::ReconcileError::Validation("invalid firewall rule order".to_string()))?;
                let spec: String = args.collect::<Vec<_>>().join(" ");
                let existing = Self::read_rules(ctx, vni, direction).await?;
                let rules = network_controller::insert_ordered(existing, network_controller::FirewallRule { order, spec });
                Self::write_rules(ctx, vni, direction, &rules).await?;
                network_controller::materialize_chain(vni, direction, &rules)?;
                Ok(vni_arg.to_string())
            }
            "reservation-reload" => {
                let mac: pvcd_network_types::MacAddress = args
                    .next()
                    .ok_or_else(|| error::ReconcileError::Validation("reservation-reload requires a mac".to_string()))?
                    .parse::<pvcd_network_types::MacAddress>()
                    .map_err(|err| error::ReconcileError::Validation(err.to_string()))?;
                let ip: std::net::Ipv4Addr = args
                    .next()
                    .ok_or_else(|| error::ReconcileError::Validation("reservation-reload requires an ip".to_string()))?
                    .parse()
                    .map_err(|_| error::ReconcileError::Validation("invalid ipv4 address".to_string()))?;
                network_controller::write_static_reservation(vni, &mac, &ip)?;
                if let Some(daemon) = self.dhcp_daemons.lock().await.get(&vni) {
                    daemon.reload()?;
                }
                Ok(vni_arg.to_string())
            }
            other => Err(error::ReconcileError::Validation(format!("unknown network verb {other}"))),
        }
    }
}

/// Node verbs from the Command Queue, addressed per-node at
/// `/cmd/nodes/<node>` so only that node's own agent ever executes them
/// (spec §4.3, §6 `node` CLI group).
struct NodeCommandHandler<'a> {
    dhcp_daemons: &'a tokio::sync::Mutex<HashMap<u32, network_controller::NetworkDaemon>>,
}

#[async_trait::async_trait]
impl command_queue::CommandHandler for NodeCommandHandler<'_> {
    async fn handle(
        &self,
        ctx: &AgentContext,
        request: &command_queue::Request,
    ) -> Result<String, error::ReconcileError> {
        match request.verb.as_str() {
            "flush" => {
                let running = store::read_running_domains(ctx, ctx.node_name()).await?;
                let mut selectors = Vec::with_capacity(running.len());
                for domain_uuid in &running {
                    let uuid: uuid::Uuid = domain_uuid
                        .parse()
                        .map_err(|_| error::ReconcileError::Validation(format!("invalid domain uuid {domain_uuid}")))?;
                    selectors.push((domain_uuid.clone(), store::read_domain_node_selector(ctx, &uuid).await?));
                }
                let candidates = healthy_node_candidates(ctx).await.map_err(error::ReconcileError::Transient)?;
                node_supervisor::begin_flush(ctx, &running, &selectors, &candidates).await?;
                Ok("flushing".to_string())
            }
            "ready" => {
                store::write_node_domain_state(ctx, ctx.node_name(), pvcd_types::NodeDomainState::Ready).await?;
                Ok("ready".to_string())
            }
            "unflush" => {
                let cluster_domains = ctx.store.list_children("/domains").await?;
                node_supervisor::unflush(ctx, &cluster_domains).await?;
                Ok("unflushed".to_string())
            }
            "secondary" => {
                node_supervisor::relinquish_primary(ctx).await?;
                let mut dhcp_daemons = self.dhcp_daemons.lock().await;
                for vni_str in ctx.store.list_children("/networks").await? {
                    let Ok(vni) = vni_str.parse::<u32>() else { continue };
                    let Some(raw) = ctx.store.read(&store::network_path(vni, "ip4_gateway")).await? else {
                        continue;
                    };
                    let Ok(gateway) = String::from_utf8_lossy(&raw).trim().parse::<pvcd_network_types::Ipv4Cidr>()
                    else {
                        continue;
                    };
                    network_controller::teardown_gateway(vni, &gateway)?;
                    dhcp_daemons.remove(&vni);
                }
                drop(dhcp_daemons);
                node_supervisor::finish_relinquish(ctx).await?;
                Ok("secondary".to_string())
            }
            "primary" => {
                node_supervisor::finish_takeover(ctx).await?;
                Ok("primary".to_string())
            }
            other => Err(error::ReconcileError::Validation(format!("unknown node verb {other}"))),
        }
    }
}

async fn process_command_queue(
    ctx: &AgentContext,
    dhcp_daemons: &tokio::sync::Mutex<HashMap<u32, network_controller::NetworkDaemon>>,
) -> Result<()> {
    command_queue::process_once(ctx, "/cmd/domains", &DomainCommandHandler).await?;
    command_queue::process_once(ctx, "/cmd/storage", &StorageCommandHandler).await?;
    command_queue::process_once(ctx, "/cmd/networks", &NetworkCommandHandler { dhcp_daemons }).await?;
    command_queue::process_once(
        ctx,
        &format!("/cmd/nodes/{}", ctx.node_name()),
        &NodeCommandHandler { dhcp_daemons },
    )
    .await?;
    Ok(())
}
