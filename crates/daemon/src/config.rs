//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Names of the kernel objects this agent owns
    pub network: NetworkConfig,

    /// WireGuard mesh configuration
    pub wireguard: WireguardConfig,

    /// External tool configuration
    pub tools: ToolsConfig,

    /// Re-convergence configuration
    pub reconcile: ReconcileConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: netplane_common::default_store_path(),
            network: NetworkConfig::default(),
            wireguard: WireguardConfig::default(),
            tools: ToolsConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// Names of the managed network objects
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Mesh interface name (at most 15 bytes)
    pub wireguard_interface: String,

    /// Container runtime network name
    pub container_network: String,

    /// Prefix of the managed firewall chains
    pub chain_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wireguard_interface: "netplane_wg".to_string(),
            container_network: "netplane_bridge".to_string(),
            chain_prefix: "NETPLANE".to_string(),
        }
    }
}

/// WireGuard peer parameters shared by every peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireguardConfig {
    /// Persistent keepalive attached to every peer
    pub persistent_keepalive_secs: u16,

    /// UDP port peers listen on
    pub peer_port: u16,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            persistent_keepalive_secs: 10,
            peer_port: 51820,
        }
    }
}

/// Binaries used to drive the kernel and the container runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub iptables: String,
    pub ip: String,
    pub wg: String,
    /// Container runtime CLI; auto-detected (podman, then docker) when unset
    pub container_runtime: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            iptables: "iptables".to_string(),
            ip: "ip".to_string(),
            wg: "wg".to_string(),
            container_runtime: None,
        }
    }
}

/// Periodic re-convergence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Seconds between replays of chains, structural rules, routes and rules.
    /// Zero disables the loop.
    pub resync_interval_secs: u64,
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject names the kernel would refuse later
    pub fn validate(&self) -> netplane_common::Result<()> {
        use netplane_common::Error;

        let iface = &self.network.wireguard_interface;
        if iface.is_empty() || iface.len() > 15 || iface.contains(['/', ' ']) {
            return Err(Error::InvalidConfig(format!(
                "invalid wireguard interface name '{}'",
                iface
            )));
        }
        if self.network.container_network.is_empty() {
            return Err(Error::InvalidConfig("container network name is empty".to_string()));
        }
        // "<prefix>_NAT_POSTROUTING" must fit the 28 character chain name limit
        let prefix = &self.network.chain_prefix;
        if prefix.is_empty() || prefix.len() + "_NAT_POSTROUTING".len() > 28 {
            return Err(Error::InvalidConfig(format!(
                "chain prefix '{}' must be 1..=12 characters",
                prefix
            )));
        }
        if self.wireguard.peer_port == 0 {
            return Err(Error::InvalidConfig("wireguard peer port must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }
}
