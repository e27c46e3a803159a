//! Network Controller: overlay interface/bridge lifecycle on every node, plus
//! gateway/DHCP/firewall duties restricted to the primary coordinator (spec
//! §4.4).

use std::collections::HashMap;

use pvcd_network_types::{Ipv4Cidr, MacAddress};
use pvcd_sys::{run_foreground, ManagedDaemon};

use crate::error::ReconcileError;
use crate::store::network_path;

const VXLAN_DST_PORT: u16 = 4789;
const LEASE_TIME: &str = "4h";

fn vxlan_if(vni: u32) -> String {
    format!("vxlan{vni}")
}

fn bridge_if(vni: u32) -> String {
    format!("br{vni}")
}

fn run_ip(args: &[&str]) -> Result<(), ReconcileError> {
    run_foreground("ip", args)
        .map_err(|err| ReconcileError::Process {
            program: "ip".to_string(),
            exit_code: -1,
            stderr: err.to_string(),
        })?
        .into_result()
        .map(|_| ())
        .map_err(|err| ReconcileError::Process {
            program: "ip".to_string(),
            exit_code: -1,
            stderr: err.to_string(),
        })
}

/// Creates `vxlan<vni>` over `carrier`, `br<vni>`, attaches the former to the
/// latter, and brings both up. Idempotent: callers reconcile on every change
/// to the network's store entry, so "already exists" from `ip` is not an
/// error worth failing reconciliation over.
pub fn ensure_overlay(vni: u32, carrier: &str) -> Result<(), ReconcileError> {
    let vxlan = vxlan_if(vni);
    let bridge = bridge_if(vni);

    let _ = run_foreground(
        "ip",
        &[
            "link",
            "add",
            &vxlan,
            "type",
            "vxlan",
            "id",
            &vni.to_string(),
            "dstport",
            &VXLAN_DST_PORT.to_string(),
            "dev",
            carrier,
        ],
    );
    let _ = run_foreground("ip", &["link", "add", &bridge, "type", "bridge"]);
    let _ = run_foreground("ip", &["link", "set", &vxlan, "master", &bridge]);
    run_ip(&["link", "set", &vxlan, "up"])?;
    run_ip(&["link", "set", &bridge, "up"])?;
    Ok(())
}

pub fn teardown_overlay(vni: u32) -> Result<(), ReconcileError> {
    let _ = run_foreground("ip", &["link", "del", &vxlan_if(vni)]);
    let _ = run_foreground("ip", &["link", "del", &bridge_if(vni)]);
    Ok(())
}

/// Tears down any local `vxlan<n>` overlay whose network is no longer
/// present in the store. Overlay creation/removal is a per-node duty run
/// every tick regardless of primary status (spec §4.4): "remove on network
/// delete", not on primary handoff.
pub fn reconcile_overlay_removals(present: &std::collections::HashSet<u32>) -> Result<(), ReconcileError> {
    let out = run_foreground("ip", &["-o", "link", "show", "type", "vxlan"]).map_err(|err| ReconcileError::Process {
        program: "ip".to_string(),
        exit_code: -1,
        stderr: err.to_string(),
    })?;
    for line in out.stdout.lines() {
        let Some(name) = line.split(':').nth(1) else { continue };
        let name = name.trim().split('@').next().unwrap_or("").trim();
        let Some(vni_str) = name.strip_prefix("vxlan") else { continue };
        let Ok(vni) = vni_str.parse::<u32>() else { continue };
        if !present.contains(&vni) {
            teardown_overlay(vni)?;
        }
    }
    Ok(())
}

/// Assigns the gateway address to the bridge and sends two gratuitous ARPs
/// (primary-only duty, spec §4.4).
pub fn assert_gateway(vni: u32, gateway: &Ipv4Cidr) -> Result<(), ReconcileError> {
    let bridge = bridge_if(vni);
    let _ = run_foreground("ip", &["addr", "add", &gateway.to_string(), "dev", &bridge]);
    for _ in 0..2 {
        let _ = run_foreground("arping", &["-U", "-I", &bridge, "-c", "1", &gateway.address().to_string()]);
    }
    Ok(())
}

/// Removes the gateway address from the bridge, the inverse of
/// `assert_gateway`. Used on primary relinquish, which per spec §4.4 tears
/// down only gateway addresses and DHCP daemons, not the overlay/bridge
/// itself (that stays up across handoffs and is only removed on network
/// delete, regardless of who is primary).
pub fn teardown_gateway(vni: u32, gateway: &Ipv4Cidr) -> Result<(), ReconcileError> {
    let bridge = bridge_if(vni);
    let _ = run_foreground("ip", &["addr", "del", &gateway.to_string(), "dev", &bridge]);
    Ok(())
}

/// DHCP/DNS daemon for one overlay network, owned only by the primary.
pub struct NetworkDaemon {
    daemon: ManagedDaemon,
}

impl NetworkDaemon {
    pub fn start(vni: u32, gateway: &Ipv4Cidr, range_start: &str, range_end: &str) -> Result<Self, ReconcileError> {
        let leases_dir = format!("/var/lib/dnsmasq/{vni}");
        let bridge = bridge_if(vni);
        let gateway_addr = gateway.address().to_string();
        let daemon = ManagedDaemon::spawn(
            "dnsmasq",
            &[
                "--keep-in-foreground",
                "--interface",
                &bridge,
                "--bind-interfaces",
                "--listen-address",
                &gateway_addr,
                "--dhcp-range",
                &format!("{range_start},{range_end},{LEASE_TIME}"),
                "--dhcp-option",
                &format!("option:router,{gateway_addr}"),
                "--dhcp-hostsdir",
                &leases_dir,
                "--dhcp-script",
                "/usr/libexec/pvcd/dhcp-lease-hook",
            ],
            &HashMap::from([("PVCD_NETWORK_VNI".to_string(), vni.to_string())]),
        )
        .map_err(ReconcileError::Driver)?;
        Ok(Self { daemon })
    }

    /// Re-reads the reservation directory and signals the daemon to pick up
    /// changes, per spec §4.4 ("the daemon is SIGHUP'd on change").
    pub fn reload(&self) -> Result<(), ReconcileError> {
        self.daemon
            .signal(nix::sys::signal::Signal::SIGHUP)
            .map_err(ReconcileError::Driver)
    }
}

/// Writes a static DHCP reservation file `<mac>` containing `<mac>,<ip>`
/// beneath the network's lease-hosts directory (spec §4.4, §6 on-disk
/// artifacts).
pub fn write_static_reservation(vni: u32, mac: &MacAddress, ip: &std::net::Ipv4Addr) -> Result<(), ReconcileError> {
    let dir = format!("/var/lib/dnsmasq/{vni}");
    std::fs::create_dir_all(&dir).map_err(|err| ReconcileError::Driver(err.into()))?;
    std::fs::write(format!("{dir}/{mac}"), format!("{mac},{ip}\n")).map_err(|err| ReconcileError::Driver(err.into()))
}

/// One firewall rule as materialized under `/networks/<vni>/firewall_rules`.
#[derive(Clone, Debug)]
pub struct FirewallRule {
    pub order: u32,
    pub spec: String,
}

/// Inserts `rule` at its requested `order`, shifting subsequent rules down
/// (spec §4.4: "`order` conflicts resolve by inserting the new rule at the
/// requested position and shifting subsequent rules").
pub fn insert_ordered(mut rules: Vec<FirewallRule>, rule: FirewallRule) -> Vec<FirewallRule> {
    for existing in rules.iter_mut() {
        if existing.order >= rule.order {
            existing.order += 1;
        }
    }
    rules.push(rule);
    rules.sort_by_key(|r| r.order);
    rules
}

pub fn firewall_rule_path(vni: u32, direction: &str, order: u32) -> String {
    format!("{}/{direction}/{order}", network_path(vni, "firewall_rules"))
}

/// Materializes the ordered rule set into the local forward chain for the
/// bridge. Grounded in the Process Runner pattern (`pvcd_sys::run_foreground`)
/// the same way the overlay-interface calls are.
pub fn materialize_chain(vni: u32, direction: &str, rules: &[FirewallRule]) -> Result<(), ReconcileError> {
    let bridge = bridge_if(vni);
    let chain = format!("pvcd-{bridge}-{direction}");
    let _ = run_foreground("nft", &["flush", "chain", "inet", "filter", &chain]);
    for rule in rules {
        run_foreground("nft", &["add", "rule", "inet", "filter", &chain, &rule.spec])
            .map_err(|err| ReconcileError::Process {
                program: "nft".to_string(),
                exit_code: -1,
                stderr: err.to_string(),
            })?
            .into_result()
            .map_err(|err| ReconcileError::Process {
                program: "nft".to_string(),
                exit_code: -1,
                stderr: err.to_string(),
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserting_at_occupied_order_shifts_later_rules() {
        let rules = vec![
            FirewallRule { order: 0, spec: "a".into() },
            FirewallRule { order: 1, spec: "b".into() },
        ];
        let rules = insert_ordered(rules, FirewallRule { order: 1, spec: "c".into() });
        let orders: Vec<u32> = rules.iter().map(|r| r.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
        assert_eq!(rules[1].spec, "c");
        assert_eq!(rules[2].spec, "b");
    }

    #[test]
    fn vxlan_and_bridge_names_follow_vni() {
        assert_eq!(vxlan_if(42), "vxlan42");
        assert_eq!(bridge_if(42), "br42");
    }
}
