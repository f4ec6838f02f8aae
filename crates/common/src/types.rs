//! Core types for netplane
//!
//! Records persisted by the agent, and the validation each of them must pass
//! before it is allowed anywhere near the kernel.

use crate::crypto::WgKey;
use crate::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

/// Tables a firewall rule may target
pub const FIREWALL_TABLES: &[&str] = &["filter", "nat", "mangle", "raw", "security"];

// ============================================================================
// Node configuration
// ============================================================================

/// Role of this node in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Coordinator,
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coordinator => write!(f, "coordinator"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "coordinator" => Ok(Self::Coordinator),
            "worker" => Ok(Self::Worker),
            _ => Err(Error::validation(format!("unknown node role: {}", s))),
        }
    }
}

/// Local WireGuard interface parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardSettings {
    /// Base64 private key
    pub private_key: String,
    /// Interface address with prefix, e.g. `10.10.0.1/24`
    pub address: String,
    pub listen_port: u16,
    pub mtu: u32,
}

/// Container bridge network parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub subnet: String,
    pub gateway: String,
    /// Host-side bridge interface name assigned by the container runtime.
    /// Only ever written by bridge synchronisation.
    #[serde(default)]
    pub bridge_id: Option<String>,
    /// Mesh interface the bridge's forwarding rules were installed against
    #[serde(default)]
    pub mesh_interface: Option<String>,
}

/// How a worker reaches the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorLink {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
}

/// The singleton node network record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeNetworkConfig {
    pub role: NodeRole,
    pub wireguard: WireguardSettings,
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub coordinator: Option<CoordinatorLink>,
}

impl NodeNetworkConfig {
    /// Validate provisioning inputs
    pub fn validate(&self) -> Result<()> {
        WgKey::parse(&self.wireguard.private_key)?;
        let address = parse_cidr(&self.wireguard.address)?;
        if address.ip() == address.network() && address.prefix() < max_prefix(&address) {
            return Err(Error::validation(format!(
                "wireguard address {} is a network address, expected a host address",
                self.wireguard.address
            )));
        }
        if self.wireguard.listen_port == 0 {
            return Err(Error::validation("wireguard listen port must be non-zero"));
        }
        if !(1280..=9000).contains(&self.wireguard.mtu) {
            return Err(Error::validation(format!(
                "wireguard MTU {} out of range 1280..=9000",
                self.wireguard.mtu
            )));
        }

        let subnet = parse_network_cidr(&self.bridge.subnet)?;
        let gateway = parse_ip(&self.bridge.gateway)?;
        if !subnet.contains(gateway) {
            return Err(Error::validation(format!(
                "bridge gateway {} is outside subnet {}",
                self.bridge.gateway, self.bridge.subnet
            )));
        }

        match (self.role, &self.coordinator) {
            (NodeRole::Worker, None) => {
                return Err(Error::validation("worker nodes require a coordinator link"))
            }
            (NodeRole::Coordinator, Some(_)) => {
                return Err(Error::validation(
                    "coordinator nodes must not carry a coordinator link",
                ))
            }
            (NodeRole::Worker, Some(link)) => {
                WgKey::parse(&link.public_key)?;
                parse_ip(&link.endpoint)?;
                parse_allowed_ips(&link.allowed_ips)?;
            }
            (NodeRole::Coordinator, None) => {}
        }

        Ok(())
    }

    /// Public key derived from the local private key
    pub fn public_key(&self) -> Result<String> {
        crate::crypto::derive_public_key(&self.wireguard.private_key)
    }

    /// Implicit coordinator peer; present only on workers
    pub fn coordinator_peer(&self) -> Option<WireguardPeer> {
        match (self.role, &self.coordinator) {
            (NodeRole::Worker, Some(link)) => Some(WireguardPeer {
                public_key: link.public_key.clone(),
                allowed_ips: link.allowed_ips.clone(),
                endpoint_ip: Some(link.endpoint.clone()),
            }),
            _ => None,
        }
    }
}

// ============================================================================
// WireGuard peers
// ============================================================================

/// A registered mesh peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardPeer {
    pub public_key: String,
    /// Comma separated CIDR list
    pub allowed_ips: String,
    #[serde(default)]
    pub endpoint_ip: Option<String>,
}

impl WireguardPeer {
    pub fn validate(&self) -> Result<()> {
        WgKey::parse(&self.public_key)?;
        parse_allowed_ips(&self.allowed_ips)?;
        if let Some(endpoint) = &self.endpoint_ip {
            parse_ip(endpoint)?;
        }
        Ok(())
    }

    pub fn allowed_networks(&self) -> Result<Vec<IpNetwork>> {
        parse_allowed_ips(&self.allowed_ips)
    }

    pub fn endpoint(&self) -> Result<Option<IpAddr>> {
        self.endpoint_ip.as_deref().map(parse_ip).transpose()
    }
}

/// Endpoint update request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEndpointUpdate {
    pub endpoint_ip: String,
}

// ============================================================================
// Static routes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    /// Destination network, e.g. `192.168.50.0/24`
    pub destination: String,
    pub gateway: String,
}

impl StaticRoute {
    pub fn validate(&self) -> Result<()> {
        let destination = parse_network_cidr(&self.destination)?;
        let gateway = parse_ip(&self.gateway)?;
        if destination.is_ipv4() != gateway.is_ipv4() {
            return Err(Error::validation(format!(
                "gateway {} and destination {} are different address families",
                self.gateway, self.destination
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Firewall rules
// ============================================================================

/// A persisted ad-hoc firewall rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub uuid: String,
    pub table: String,
    pub chain: String,
    pub args: Vec<String>,
}

impl FirewallRule {
    pub fn validate(&self) -> Result<()> {
        Uuid::parse_str(&self.uuid)
            .map_err(|e| Error::validation(format!("invalid rule uuid {}: {}", self.uuid, e)))?;
        if !FIREWALL_TABLES.contains(&self.table.as_str()) {
            return Err(Error::validation(format!(
                "unknown firewall table '{}', expected one of {}",
                self.table,
                FIREWALL_TABLES.join(", ")
            )));
        }
        if self.chain.is_empty() || self.chain.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!(
                "invalid chain name '{}'",
                self.chain
            )));
        }
        if self.args.is_empty() {
            return Err(Error::validation("rule args must not be empty"));
        }
        Ok(())
    }
}

/// Firewall rule creation request. `args` is a JSON array of strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFirewallRule {
    #[serde(default)]
    pub uuid: Option<String>,
    pub table: String,
    pub chain: String,
    pub args: String,
}

impl NewFirewallRule {
    /// Validate the request and turn it into a rule record
    pub fn into_rule(self) -> Result<FirewallRule> {
        let args: Vec<String> = serde_json::from_str(&self.args)
            .map_err(|e| Error::validation(format!("rule args must be a JSON string array: {}", e)))?;
        let rule = FirewallRule {
            uuid: self.uuid.unwrap_or_else(|| Uuid::new_v4().to_string()),
            table: self.table,
            chain: self.chain,
            args,
        };
        rule.validate()?;
        Ok(rule)
    }
}

// ============================================================================
// Parsing helpers
// ============================================================================

fn max_prefix(network: &IpNetwork) -> u8 {
    if network.is_ipv4() {
        32
    } else {
        128
    }
}

/// Parse a bare IP address
pub fn parse_ip(s: &str) -> Result<IpAddr> {
    s.trim()
        .parse::<IpAddr>()
        .map_err(|_| Error::validation(format!("invalid IP address: {}", s)))
}

/// Parse an explicit `addr/prefix` CIDR. Host bits may be set.
pub fn parse_cidr(s: &str) -> Result<IpNetwork> {
    let s = s.trim();
    if !s.contains('/') {
        return Err(Error::validation(format!("missing prefix length in CIDR: {}", s)));
    }
    IpNetwork::from_str(s).map_err(|e| Error::validation(format!("invalid CIDR {}: {}", s, e)))
}

/// Parse a CIDR that must name a network (no host bits set)
pub fn parse_network_cidr(s: &str) -> Result<IpNetwork> {
    let network = parse_cidr(s)?;
    if network.ip() != network.network() {
        return Err(Error::validation(format!(
            "{} has host bits set; did you mean {}/{}?",
            s.trim(),
            network.network(),
            network.prefix()
        )));
    }
    Ok(network)
}

/// Parse a comma separated allowed-IPs list
pub fn parse_allowed_ips(s: &str) -> Result<Vec<IpNetwork>> {
    let networks = s
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_cidr)
        .collect::<Result<Vec<_>>>()?;
    if networks.is_empty() {
        return Err(Error::validation("allowed IPs must not be empty"));
    }
    Ok(networks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "3ISIkdS5eyvYh2PY0jv4NZZAR6SzUBonkG36JHNa7nQ=";
    const PRIVATE: &str = "SK+Ao+yS+6mMrrrfxkgyGPGtuuoRxj3af4CtG3/nP08=";

    fn worker_config() -> NodeNetworkConfig {
        NodeNetworkConfig {
            role: NodeRole::Worker,
            wireguard: WireguardSettings {
                private_key: PRIVATE.to_string(),
                address: "10.10.0.2/24".to_string(),
                listen_port: 51820,
                mtu: 1420,
            },
            bridge: BridgeSettings {
                subnet: "10.0.2.0/24".to_string(),
                gateway: "10.0.2.1".to_string(),
                bridge_id: None,
                mesh_interface: None,
            },
            coordinator: Some(CoordinatorLink {
                public_key: KEY_A.to_string(),
                endpoint: "49.13.204.35".to_string(),
                allowed_ips: "10.10.0.1/32, 10.0.1.0/24".to_string(),
            }),
        }
    }

    #[test]
    fn test_allowed_ips_parsing() {
        let nets = parse_allowed_ips("10.10.0.2/32, 10.0.2.0/24").unwrap();
        assert_eq!(nets.len(), 2);
        assert_eq!(nets[1].prefix(), 24);

        assert!(parse_allowed_ips("").unwrap_err().is_validation());
        assert!(parse_allowed_ips("10.10.0.2").unwrap_err().is_validation());
        assert!(parse_allowed_ips("10.10.0.2/33").unwrap_err().is_validation());
    }

    #[test]
    fn test_node_config_validation() {
        let config = worker_config();
        config.validate().unwrap();
        assert_eq!(config.coordinator_peer().unwrap().public_key, KEY_A);

        let mut bad_gateway = worker_config();
        bad_gateway.bridge.gateway = "10.0.3.1".to_string();
        assert!(bad_gateway.validate().unwrap_err().is_validation());

        let mut orphan_worker = worker_config();
        orphan_worker.coordinator = None;
        assert!(orphan_worker.validate().unwrap_err().is_validation());

        let mut coordinator = worker_config();
        coordinator.role = NodeRole::Coordinator;
        coordinator.coordinator = None;
        coordinator.validate().unwrap();
        assert!(coordinator.coordinator_peer().is_none());
    }

    #[test]
    fn test_static_route_validation() {
        let route = StaticRoute {
            destination: "192.168.50.0/24".to_string(),
            gateway: "10.0.1.5".to_string(),
        };
        route.validate().unwrap();

        let host_bits = StaticRoute {
            destination: "192.168.50.7/24".to_string(),
            ..route.clone()
        };
        assert!(host_bits.validate().unwrap_err().is_validation());

        let mixed = StaticRoute {
            gateway: "fd00::1".to_string(),
            ..route
        };
        assert!(mixed.validate().unwrap_err().is_validation());
    }

    #[test]
    fn test_firewall_rule_request() {
        let empty = NewFirewallRule {
            uuid: None,
            table: "filter".to_string(),
            chain: "INPUT".to_string(),
            args: "[]".to_string(),
        };
        assert!(empty.into_rule().unwrap_err().is_validation());

        let rule = NewFirewallRule {
            uuid: None,
            table: "filter".to_string(),
            chain: "NETPLANE_FILTER_INPUT".to_string(),
            args: r#"["-p","tcp","--dport","22","-j","ACCEPT"]"#.to_string(),
        }
        .into_rule()
        .unwrap();
        assert_eq!(rule.args.len(), 6);
        assert!(Uuid::parse_str(&rule.uuid).is_ok());

        let bad_table = NewFirewallRule {
            uuid: None,
            table: "bogus".to_string(),
            chain: "INPUT".to_string(),
            args: r#"["-j","ACCEPT"]"#.to_string(),
        };
        assert!(bad_table.into_rule().unwrap_err().is_validation());
    }
}
