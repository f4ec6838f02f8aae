//! Drift detection: compare persisted intent with live kernel state.
//! Read-only; nothing here takes the mutation lock or changes the kernel.

use super::chains::return_rule;
use super::NetworkReconciler;
use netplane_common::types::{parse_cidr, parse_network_cidr};
use netplane_common::{store, Result, WgKey};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Drift detector for the network plane
pub struct DriftDetector {
    reconciler: Arc<NetworkReconciler>,
}

/// Drift report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    pub resource_type: String,
    pub resource_id: String,
    pub drift_type: DriftType,
    pub message: String,
}

/// Types of drift
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftType {
    ResourceMissing,
    ConfigMismatch,
    UnexpectedResource,
    InvalidRecord,
}

impl std::fmt::Display for DriftType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ResourceMissing => "missing",
            Self::ConfigMismatch => "mismatch",
            Self::UnexpectedResource => "unexpected",
            Self::InvalidRecord => "invalid",
        };
        f.pad(s)
    }
}

fn report(
    resource_type: &str,
    resource_id: impl Into<String>,
    drift_type: DriftType,
    message: impl Into<String>,
) -> DriftReport {
    DriftReport {
        resource_type: resource_type.to_string(),
        resource_id: resource_id.into(),
        drift_type,
        message: message.into(),
    }
}

impl DriftDetector {
    pub fn new(reconciler: Arc<NetworkReconciler>) -> Self {
        Self { reconciler }
    }

    /// Detect drift across chains, bridge, mesh, routes and rules
    pub fn detect_all(&self) -> Result<Vec<DriftReport>> {
        let mut reports = Vec::new();
        self.detect_chains(&mut reports)?;
        self.detect_bridge(&mut reports)?;
        self.detect_mesh(&mut reports)?;
        self.detect_routes(&mut reports)?;
        self.detect_rules(&mut reports)?;
        Ok(reports)
    }

    fn detect_chains(&self, reports: &mut Vec<DriftReport>) -> Result<()> {
        let filter = &self.reconciler.kernel.filter;
        for chain in self.reconciler.managed_chains() {
            let id = format!("{}/{}", chain.table, chain.name);
            if !filter.chain_exists(chain.table, &chain.name)? {
                reports.push(report(
                    "chain",
                    id,
                    DriftType::ResourceMissing,
                    "chain does not exist",
                ));
                continue;
            }
            let rules = filter.list_rules(chain.table, &chain.name)?;
            if rules.last() != Some(&return_rule()) {
                reports.push(report(
                    "chain",
                    id.clone(),
                    DriftType::ConfigMismatch,
                    "chain does not end in RETURN",
                ));
            }
            if !filter.rule_exists(chain.table, chain.parent, &chain.jump())? {
                reports.push(report(
                    "chain",
                    id,
                    DriftType::ResourceMissing,
                    format!("no jump from {}", chain.parent),
                ));
            }
        }
        Ok(())
    }

    fn detect_bridge(&self, reports: &mut Vec<DriftReport>) -> Result<()> {
        let reconciler = &self.reconciler;
        let node = reconciler.db.read(store::node::require)?;
        let name = &reconciler.config.network.container_network;

        let live = match reconciler.kernel.networks.inspect_network(name)? {
            Some(info) => Some(info.bridge_identity()?),
            None => {
                reports.push(report(
                    "bridge_network",
                    name.as_str(),
                    DriftType::ResourceMissing,
                    "container network does not exist",
                ));
                None
            }
        };

        let Some(persisted) = node.bridge.bridge_id.as_deref() else {
            reports.push(report(
                "bridge_network",
                name.as_str(),
                DriftType::ResourceMissing,
                "no bridge identity recorded; bridge was never synchronised",
            ));
            return Ok(());
        };

        if let Some(live) = &live {
            if live != persisted {
                reports.push(report(
                    "bridge_network",
                    name.as_str(),
                    DriftType::ConfigMismatch,
                    format!("recorded bridge {} but runtime reports {}", persisted, live),
                ));
            }
        }

        let mesh = &reconciler.config.network.wireguard_interface;
        if let Some(recorded) = node.bridge.mesh_interface.as_deref() {
            if recorded != mesh {
                reports.push(report(
                    "bridge_network",
                    name.as_str(),
                    DriftType::ConfigMismatch,
                    format!(
                        "forwarding rules bound to {} but mesh interface is {}",
                        recorded, mesh
                    ),
                ));
            }
        }

        let filter = &reconciler.kernel.filter;
        for rule in reconciler.structural_rules_for(&node, persisted) {
            if !filter.rule_exists(rule.table, &rule.chain, &rule.args)? {
                reports.push(report(
                    "structural_rule",
                    format!("{}/{}", rule.table, rule.chain),
                    DriftType::ResourceMissing,
                    rule.args.join(" "),
                ));
            }
        }
        Ok(())
    }

    fn detect_mesh(&self, reports: &mut Vec<DriftReport>) -> Result<()> {
        let reconciler = &self.reconciler;
        let iface = &reconciler.config.network.wireguard_interface;
        let Some(state) = reconciler.kernel.ip.link_state(iface)? else {
            reports.push(report(
                "wireguard_interface",
                iface.as_str(),
                DriftType::ResourceMissing,
                "interface does not exist",
            ));
            return Ok(());
        };

        let node = reconciler.db.read(store::node::require)?;
        if let Ok(address) = parse_cidr(&node.wireguard.address) {
            if !state.addresses.contains(&address) {
                reports.push(report(
                    "wireguard_interface",
                    iface.as_str(),
                    DriftType::ConfigMismatch,
                    format!("interface does not carry {}", address),
                ));
            }
        }
        if !state.up {
            reports.push(report(
                "wireguard_interface",
                iface.as_str(),
                DriftType::ConfigMismatch,
                "interface is down",
            ));
        }
        let mut desired = BTreeSet::new();
        for peer in reconciler
            .db
            .read(store::peers::list)?
            .into_iter()
            .chain(node.coordinator_peer())
        {
            match WgKey::parse(&peer.public_key) {
                Ok(key) => {
                    desired.insert(key.to_base64());
                }
                Err(e) => reports.push(report(
                    "wireguard_peer",
                    peer.public_key,
                    DriftType::InvalidRecord,
                    e.to_string(),
                )),
            }
        }

        let live: BTreeSet<String> = reconciler
            .kernel
            .wireguard
            .device_peers(iface)?
            .into_iter()
            .collect();

        for key in desired.difference(&live) {
            reports.push(report(
                "wireguard_peer",
                key.as_str(),
                DriftType::ResourceMissing,
                "peer not configured on the device",
            ));
        }
        for key in live.difference(&desired) {
            reports.push(report(
                "wireguard_peer",
                key.as_str(),
                DriftType::UnexpectedResource,
                "device carries a peer that is not registered",
            ));
        }
        Ok(())
    }

    fn detect_routes(&self, reports: &mut Vec<DriftReport>) -> Result<()> {
        let reconciler = &self.reconciler;
        for route in reconciler.db.read(store::routes::list)? {
            let destination = match parse_network_cidr(&route.destination) {
                Ok(destination) => destination,
                Err(e) => {
                    reports.push(report(
                        "static_route",
                        route.destination,
                        DriftType::InvalidRecord,
                        e.to_string(),
                    ));
                    continue;
                }
            };
            match reconciler.kernel.ip.lookup_route(&destination)? {
                None => reports.push(report(
                    "static_route",
                    route.destination,
                    DriftType::ResourceMissing,
                    "route absent from the routing table",
                )),
                Some(live) => {
                    let live_gateway = live.gateway.map(|gw| gw.to_string());
                    if live_gateway.as_deref() != Some(route.gateway.as_str()) {
                        reports.push(report(
                            "static_route",
                            route.destination,
                            DriftType::ConfigMismatch,
                            format!(
                                "kernel routes via {}, recorded gateway is {}",
                                live_gateway.as_deref().unwrap_or("no gateway"),
                                route.gateway
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn detect_rules(&self, reports: &mut Vec<DriftReport>) -> Result<()> {
        let reconciler = &self.reconciler;
        for row in reconciler.db.read(store::rules::list)? {
            let rule = match row {
                Ok(rule) => rule,
                Err(e) => {
                    reports.push(report(
                        "firewall_rule",
                        "?",
                        DriftType::InvalidRecord,
                        e.to_string(),
                    ));
                    continue;
                }
            };
            if !reconciler
                .kernel
                .filter
                .rule_exists(&rule.table, &rule.chain, &rule.args)?
            {
                reports.push(report(
                    "firewall_rule",
                    rule.uuid,
                    DriftType::ResourceMissing,
                    format!("{}/{}: {}", rule.table, rule.chain, rule.args.join(" ")),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use netplane_common::{NewFirewallRule, StaticRoute, WireguardPeer};

    #[test]
    fn test_converged_plane_has_no_drift() {
        let h = harness(worker());
        h.reconciler.boot().unwrap();
        h.reconciler
            .create_peer(WireguardPeer {
                public_key: PEER_A.to_string(),
                allowed_ips: "10.10.0.3/32".to_string(),
                endpoint_ip: None,
            })
            .unwrap();
        h.reconciler
            .create_route(StaticRoute {
                destination: "192.168.50.0/24".to_string(),
                gateway: "10.0.2.5".to_string(),
            })
            .unwrap();

        let reconciler = Arc::new(h.reconciler);
        let reports = DriftDetector::new(reconciler).detect_all().unwrap();
        assert!(reports.is_empty(), "unexpected drift: {:?}", reports);
    }

    #[test]
    fn test_detects_missing_state() {
        let h = harness(coordinator());
        h.reconciler.boot().unwrap();
        let rule = h
            .reconciler
            .create_rule(NewFirewallRule {
                uuid: None,
                table: "filter".to_string(),
                chain: "NETPLANE_FILTER_INPUT".to_string(),
                args: r#"["-p","udp","--dport","51820","-j","ACCEPT"]"#.to_string(),
            })
            .unwrap();
        h.reconciler
            .create_route(StaticRoute {
                destination: "192.168.50.0/24".to_string(),
                gateway: "10.0.1.5".to_string(),
            })
            .unwrap();

        // Wipe kernel state behind the agent's back
        h.kernel.filter.remove_chain("filter", "NETPLANE_FILTER_INPUT");
        h.kernel.filter.remove_chain("filter", "NETPLANE_FILTER_FORWARD");
        h.kernel.ip.routes.lock().clear();
        h.kernel.ip.links.lock().clear();

        let reports = DriftDetector::new(Arc::new(h.reconciler))
            .detect_all()
            .unwrap();

        let has = |resource_type: &str, drift_type: DriftType| {
            reports
                .iter()
                .any(|r| r.resource_type == resource_type && r.drift_type == drift_type)
        };
        assert!(has("chain", DriftType::ResourceMissing));
        assert!(has("structural_rule", DriftType::ResourceMissing));
        assert!(has("wireguard_interface", DriftType::ResourceMissing));
        assert!(has("static_route", DriftType::ResourceMissing));
        assert!(reports
            .iter()
            .any(|r| r.resource_type == "firewall_rule" && r.resource_id == rule.uuid));
    }
}
