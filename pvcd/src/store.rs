//! Path helpers and typed accessors over the coordination store (spec §3).
//! Every read here goes through [`pvcd_types::codec`]; a malformed value is
//! an error a caller must act on, never a silent default.

use pvcd_types::{codec, DaemonState, DomainState, NodeDomainState};
use uuid::Uuid;

use crate::context::AgentContext;
use crate::error::ReconcileError;

pub fn node_path(name: &str, field: &str) -> String {
    format!("/nodes/{name}/{field}")
}

pub fn domain_path(uuid: &Uuid, field: &str) -> String {
    format!("/domains/{uuid}/{field}")
}

pub fn network_path(vni: u32, field: &str) -> String {
    format!("/networks/{vni}/{field}")
}

async fn read_required(ctx: &AgentContext, field: &'static str, key: &str) -> Result<Vec<u8>, ReconcileError> {
    ctx.store
        .read(key)
        .await?
        .ok_or_else(|| ReconcileError::ClusterState(format!("missing required key for '{field}': {key}")))
}

pub async fn read_domain_state(ctx: &AgentContext, uuid: &Uuid) -> Result<DomainState, ReconcileError> {
    let key = domain_path(uuid, "state");
    let raw = read_required(ctx, "state", &key).await?;
    codec::decode("state", &raw).map_err(|err| ReconcileError::Validation(err.to_string()))
}

pub async fn read_domain_node(ctx: &AgentContext, uuid: &Uuid) -> Result<Option<String>, ReconcileError> {
    let key = domain_path(uuid, "node");
    Ok(ctx
        .store
        .read(&key)
        .await?
        .map(|raw| String::from_utf8_lossy(&raw).trim().to_string())
        .filter(|s| !s.is_empty()))
}

pub async fn write_domain_node(ctx: &AgentContext, uuid: &Uuid, node: &str) -> Result<(), ReconcileError> {
    ctx.store
        .write(&domain_path(uuid, "node"), node.as_bytes())
        .await
        .map_err(Into::into)
}

pub async fn write_domain_state(ctx: &AgentContext, uuid: &Uuid, state: DomainState) -> Result<(), ReconcileError> {
    ctx.store
        .write(&domain_path(uuid, "state"), &codec::encode(&state))
        .await
        .map_err(Into::into)
}

pub async fn write_domain_lastnode(ctx: &AgentContext, uuid: &Uuid, node: &str) -> Result<(), ReconcileError> {
    ctx.store
        .write(&domain_path(uuid, "lastnode"), node.as_bytes())
        .await
        .map_err(Into::into)
}

pub async fn read_domain_lastnode(ctx: &AgentContext, uuid: &Uuid) -> Result<Option<String>, ReconcileError> {
    let key = domain_path(uuid, "lastnode");
    Ok(ctx
        .store
        .read(&key)
        .await?
        .map(|raw| String::from_utf8_lossy(&raw).trim().to_string())
        .filter(|s| !s.is_empty()))
}

pub async fn write_domain_failed_reason(ctx: &AgentContext, uuid: &Uuid, reason: &str) -> Result<(), ReconcileError> {
    ctx.store
        .write(&domain_path(uuid, "failedreason"), reason.as_bytes())
        .await
        .map_err(Into::into)
}

pub async fn read_domain_xml(ctx: &AgentContext, uuid: &Uuid) -> Result<String, ReconcileError> {
    let key = domain_path(uuid, "xml");
    let raw = read_required(ctx, "xml", &key).await?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

pub async fn read_domain_node_limit(ctx: &AgentContext, uuid: &Uuid) -> Result<Vec<String>, ReconcileError> {
    let key = domain_path(uuid, "node_limit");
    match ctx.store.read(&key).await? {
        Some(raw) => codec::decode_list("node_limit", &raw).map_err(|err| ReconcileError::Validation(err.to_string())),
        None => Ok(Vec::new()),
    }
}

pub async fn read_domain_node_selector(ctx: &AgentContext, uuid: &Uuid) -> Result<pvcd_scheduling::NodeSelector, ReconcileError> {
    let key = domain_path(uuid, "node_selector");
    let raw = read_required(ctx, "node_selector", &key).await?;
    let text = String::from_utf8_lossy(&raw);
    text.trim()
        .parse()
        .map_err(|err: anyhow::Error| ReconcileError::Validation(err.to_string()))
}

pub async fn read_domain_node_autostart(ctx: &AgentContext, uuid: &Uuid) -> Result<bool, ReconcileError> {
    let key = domain_path(uuid, "node_autostart");
    match ctx.store.read(&key).await? {
        Some(raw) => codec::decode("node_autostart", &raw).map_err(|err| ReconcileError::Validation(err.to_string())),
        None => Ok(false),
    }
}

pub async fn read_node_daemon_state(ctx: &AgentContext, name: &str) -> Result<DaemonState, ReconcileError> {
    let key = node_path(name, "daemon_state");
    let raw = read_required(ctx, "daemon_state", &key).await?;
    codec::decode("daemon_state", &raw).map_err(|err| ReconcileError::Validation(err.to_string()))
}

pub async fn write_node_daemon_state(ctx: &AgentContext, name: &str, state: DaemonState) -> Result<(), ReconcileError> {
    ctx.store
        .write(&node_path(name, "daemon_state"), &codec::encode(&state))
        .await
        .map_err(Into::into)
}

pub async fn read_node_domain_state(ctx: &AgentContext, name: &str) -> Result<NodeDomainState, ReconcileError> {
    let key = node_path(name, "domain_state");
    let raw = read_required(ctx, "domain_state", &key).await?;
    codec::decode("domain_state", &raw).map_err(|err| ReconcileError::Validation(err.to_string()))
}

pub async fn write_node_domain_state(ctx: &AgentContext, name: &str, state: NodeDomainState) -> Result<(), ReconcileError> {
    ctx.store
        .write(&node_path(name, "domain_state"), &codec::encode(&state))
        .await
        .map_err(Into::into)
}

pub async fn read_running_domains(ctx: &AgentContext, name: &str) -> Result<Vec<String>, ReconcileError> {
    let key = node_path(name, "runningdomains");
    match ctx.store.read(&key).await? {
        Some(raw) => codec::decode_list("runningdomains", &raw).map_err(|err| ReconcileError::Validation(err.to_string())),
        None => Ok(Vec::new()),
    }
}

pub async fn write_running_domains(ctx: &AgentContext, name: &str, domains: &[String]) -> Result<(), ReconcileError> {
    ctx.store
        .write(&node_path(name, "runningdomains"), &codec::encode_list(domains))
        .await
        .map_err(Into::into)
}
