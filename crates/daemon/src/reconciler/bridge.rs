//! Container bridge network and the firewall rules derived from it

use super::NetworkReconciler;
use netplane_common::types::{parse_ip, parse_network_cidr};
use netplane_common::{store, Error, NodeNetworkConfig, Result};
use tracing::{debug, info};

/// A rule whose existence follows from the bridge identity. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralRule {
    pub table: &'static str,
    pub chain: String,
    pub args: Vec<String>,
}

fn rule(table: &'static str, chain: &str, args: &[&str]) -> StructuralRule {
    StructuralRule {
        table,
        chain: chain.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
    }
}

/// Rules binding bridge `bridge` to the mesh interface `mesh` and
/// masquerading traffic from `subnet` that leaves through another interface.
pub fn structural_rules(
    bridge: &str,
    mesh: &str,
    subnet: &str,
    forward_chain: &str,
    postrouting_chain: &str,
) -> Vec<StructuralRule> {
    vec![
        rule(
            "filter",
            forward_chain,
            &[
                "-o",
                bridge,
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
        ),
        rule(
            "filter",
            forward_chain,
            &["-i", bridge, "!", "-o", bridge, "-j", "ACCEPT"],
        ),
        rule(
            "nat",
            postrouting_chain,
            &["-s", subnet, "!", "-o", bridge, "-j", "MASQUERADE"],
        ),
        rule(
            "filter",
            forward_chain,
            &["-i", bridge, "-o", mesh, "-j", "ACCEPT"],
        ),
        rule(
            "filter",
            forward_chain,
            &["-i", mesh, "-o", bridge, "-j", "ACCEPT"],
        ),
    ]
}

impl NetworkReconciler {
    /// Structural rules for `bridge` under this node's configuration
    pub fn structural_rules_for(
        &self,
        node: &NodeNetworkConfig,
        bridge: &str,
    ) -> Vec<StructuralRule> {
        structural_rules(
            bridge,
            &self.config.network.wireguard_interface,
            &node.bridge.subnet,
            &self.chain_name("filter", "FORWARD"),
            &self.chain_name("nat", "POSTROUTING"),
        )
    }

    /// Structural rules as last installed: the recorded bridge identity bound
    /// to the recorded mesh interface. None before the first sync.
    pub fn recorded_structural_rules(
        &self,
        node: &NodeNetworkConfig,
    ) -> Option<Vec<StructuralRule>> {
        let bridge = node.bridge.bridge_id.as_deref()?;
        let mesh = node
            .bridge
            .mesh_interface
            .as_deref()
            .unwrap_or(&self.config.network.wireguard_interface);
        Some(structural_rules(
            bridge,
            mesh,
            &node.bridge.subnet,
            &self.chain_name("filter", "FORWARD"),
            &self.chain_name("nat", "POSTROUTING"),
        ))
    }

    /// Ensure the bridge network exists and the structural rules match its
    /// current identity. Returns that identity.
    pub fn sync_bridge(&self) -> Result<String> {
        let _guard = self.mutations.lock();
        self.sync_bridge_locked()
    }

    pub(crate) fn sync_bridge_locked(&self) -> Result<String> {
        let node = self.db.read(store::node::require)?;
        let name = &self.config.network.container_network;
        let networks = &self.kernel.networks;

        let info = match networks.inspect_network(name)? {
            Some(info) => info,
            None => {
                info!("Bridge network {} missing, creating it", name);
                networks.create_network(name, &node.bridge.subnet, &node.bridge.gateway)?;
                networks.inspect_network(name)?.ok_or_else(|| {
                    Error::external(
                        "network inspect",
                        format!("network {} not found after creation", name),
                    )
                })?
            }
        };

        // A network with another address plan belongs to someone else's intent
        let want_subnet = parse_network_cidr(&node.bridge.subnet)?;
        let want_gateway = parse_ip(&node.bridge.gateway)?;
        if let Some(subnet) = &info.subnet {
            if parse_network_cidr(subnet).ok() != Some(want_subnet) {
                return Err(Error::external(
                    "bridge sync",
                    format!(
                        "network {} has subnet {}, configured subnet is {}",
                        name, subnet, node.bridge.subnet
                    ),
                ));
            }
        }
        if let Some(gateway) = &info.gateway {
            if parse_ip(gateway).ok() != Some(want_gateway) {
                return Err(Error::external(
                    "bridge sync",
                    format!(
                        "network {} has gateway {}, configured gateway is {}",
                        name, gateway, node.bridge.gateway
                    ),
                ));
            }
        }

        let bridge_id = info.bridge_identity()?;
        let mesh = &self.config.network.wireguard_interface;
        let filter = &self.kernel.filter;
        let desired = self.structural_rules_for(&node, &bridge_id);

        if let Some(recorded) = self.recorded_structural_rules(&node) {
            let stale: Vec<_> = recorded.into_iter().filter(|r| !desired.contains(r)).collect();
            if !stale.is_empty() {
                info!(
                    "Bridge binding changed {}/{} -> {}/{}, removing {} stale rules",
                    node.bridge.bridge_id.as_deref().unwrap_or("-"),
                    node.bridge.mesh_interface.as_deref().unwrap_or(mesh),
                    bridge_id,
                    mesh,
                    stale.len()
                );
            }
            for rule in stale {
                filter.delete_if_exists(rule.table, &rule.chain, &rule.args)?;
            }
        }

        if node.bridge.bridge_id.as_deref() != Some(bridge_id.as_str())
            || node.bridge.mesh_interface.as_deref() != Some(mesh.as_str())
        {
            self.db
                .write(|conn| store::node::set_bridge_id(conn, &bridge_id, mesh))?;
        }

        let mut added = 0;
        for rule in desired {
            if self
                .insert_before_return(rule.table, &rule.chain, &rule.args)?
                .changed()
            {
                added += 1;
            }
        }
        debug!("Bridge {} in sync ({} structural rules added)", bridge_id, added);

        Ok(bridge_id)
    }
}
