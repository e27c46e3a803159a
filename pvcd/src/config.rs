use std::path::Path;

use anyhow::{Context, Error};
use serde::Deserialize;

/// `/etc/pvcd/pvcd.conf`. Parsed once at startup; a malformed or incomplete
/// file is a startup-time validation error, not something reconciliation
/// logic ever has to cope with.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// This host's name, as written to `/nodes/<name>`.
    pub node_name: String,
    /// Coordination-store connect string, e.g. `zk1:2181,zk2:2181/pvc`.
    pub coordination_store: String,
    /// Whether this node contends for `/primary_node`.
    #[serde(default)]
    pub coordinator: bool,
    /// DNS domain appended to node names for the live-migration transport
    /// URI (`qemu+tcp://<target>.<cluster_domain>/system`).
    pub cluster_domain: String,
    /// Physical interface VXLAN overlays are built on top of.
    pub overlay_carrier: String,
    /// KSE tick interval in seconds. Default matches the spec's 5 s.
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Multiplier on the tick interval before a quiet peer is considered
    /// dead. Default matches the spec's 6 ticks.
    #[serde(default = "default_fencing_grace_ticks")]
    pub fencing_grace_ticks: u64,
    /// Out-of-band power management credentials, keyed by node name.
    #[serde(default)]
    pub oob: std::collections::HashMap<String, OobCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OobCredentials {
    pub address: String,
    pub username: String,
    pub password: String,
}

fn default_keepalive_interval_secs() -> u64 {
    5
}

fn default_fencing_grace_ticks() -> u64 {
    6
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: NodeConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.node_name.is_empty() {
            anyhow::bail!("node_name must not be empty");
        }
        if self.coordination_store.is_empty() {
            anyhow::bail!("coordination_store must not be empty");
        }
        if self.cluster_domain.is_empty() {
            anyhow::bail!("cluster_domain must not be empty");
        }
        if self.overlay_carrier.is_empty() {
            anyhow::bail!("overlay_carrier must not be empty");
        }
        if self.keepalive_interval_secs == 0 {
            anyhow::bail!("keepalive_interval_secs must be positive");
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_test(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            coordination_store: "zk1:2181/pvc".to_string(),
            coordinator: false,
            cluster_domain: "pvc.local".to_string(),
            overlay_carrier: "eth1".to_string(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            fencing_grace_ticks: default_fencing_grace_ticks(),
            oob: std::collections::HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            node_name = "hv1"
            coordination_store = "zk1:2181/pvc"
            cluster_domain = "pvc.local"
            overlay_carrier = "eth1"
        "#;
        let config: NodeConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.keepalive_interval_secs, 5);
        assert_eq!(config.fencing_grace_ticks, 6);
        assert!(!config.coordinator);
    }

    #[test]
    fn rejects_empty_node_name() {
        let toml = r#"
            node_name = ""
            coordination_store = "zk1:2181/pvc"
            cluster_domain = "pvc.local"
            overlay_carrier = "eth1"
        "#;
        let config: NodeConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
