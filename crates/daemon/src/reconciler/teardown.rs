//! Removing the network plane from the host

use super::NetworkReconciler;
use netplane_common::types::parse_network_cidr;
use netplane_common::{store, Result};
use tracing::{info, warn};

/// What teardown removed, and what it could not
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub network_removed: bool,
    pub link_removed: bool,
    pub chains_removed: usize,
    pub routes_removed: usize,
    pub rules_removed: usize,
    pub errors: Vec<String>,
}

impl TeardownReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    fn failed(&mut self, what: impl std::fmt::Display, e: impl std::fmt::Display) {
        warn!("Teardown: {}: {}", what, e);
        self.errors.push(format!("{}: {}", what, e));
    }
}

impl NetworkReconciler {
    /// Remove everything boot installs: persisted routes and rules from the
    /// kernel, the managed chains, the mesh interface and the bridge network.
    /// The recorded bridge identity is forgotten; peers, routes and rules stay
    /// persisted so the next boot rebuilds the plane.
    ///
    /// Every step is attempted even when an earlier one fails; failures are
    /// collected in the report.
    pub fn teardown(&self) -> Result<TeardownReport> {
        let _guard = self.mutations.lock();
        let mut report = TeardownReport::default();
        let filter = &self.kernel.filter;

        for route in self.db.read(store::routes::list)? {
            let removed = parse_network_cidr(&route.destination)
                .and_then(|destination| self.kernel.ip.del_route(&destination));
            match removed {
                Ok(outcome) if outcome.changed() => report.routes_removed += 1,
                Ok(_) => {}
                Err(e) => report.failed(format!("route {}", route.destination), e),
            }
        }

        // Rules in managed chains go with their chain
        for rule in self.list_rules()? {
            if self.is_managed_chain(&rule.table, &rule.chain) {
                continue;
            }
            match filter.delete_if_exists(&rule.table, &rule.chain, &rule.args) {
                Ok(outcome) if outcome.changed() => report.rules_removed += 1,
                Ok(_) => {}
                Err(e) => report.failed(format!("firewall rule {}", rule.uuid), e),
            }
        }

        for chain in self.managed_chains() {
            match self.remove_chain(&chain) {
                Ok(outcome) if outcome.changed() => report.chains_removed += 1,
                Ok(_) => {}
                Err(e) => report.failed(format!("chain {}/{}", chain.table, chain.name), e),
            }
        }

        let iface = &self.config.network.wireguard_interface;
        match self.kernel.ip.del_link(iface) {
            Ok(outcome) => report.link_removed = outcome.changed(),
            Err(e) => report.failed(format!("interface {}", iface), e),
        }

        let network = &self.config.network.container_network;
        match self.kernel.networks.remove_network(network) {
            Ok(outcome) => report.network_removed = outcome.changed(),
            Err(e) => report.failed(format!("network {}", network), e),
        }

        self.db.write(store::node::clear_bridge_id)?;

        if report.is_complete() {
            info!(
                "Network plane removed ({} chains, {} routes, {} rules)",
                report.chains_removed, report.routes_removed, report.rules_removed
            );
        } else {
            warn!(
                "Network plane partly removed; {} step(s) failed",
                report.errors.len()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::kernel::{ContainerNetworks, PacketFilter};
    use netplane_common::{NewFirewallRule, StaticRoute, WireguardPeer};
    use std::sync::atomic::Ordering;

    fn built_worker() -> Harness {
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
        h.reconciler
            .create_rule(NewFirewallRule {
                uuid: None,
                table: "filter".to_string(),
                chain: "INPUT".to_string(),
                args: r#"["-p","udp","--dport","51820","-j","ACCEPT"]"#.to_string(),
            })
            .unwrap();
        h.reconciler
            .create_rule(NewFirewallRule {
                uuid: None,
                table: "filter".to_string(),
                chain: "NETPLANE_FILTER_INPUT".to_string(),
                args: r#"["-p","tcp","--dport","22","-j","ACCEPT"]"#.to_string(),
            })
            .unwrap();
        h
    }

    #[test]
    fn test_teardown_removes_everything_boot_installs() {
        let h = built_worker();
        let network = h.reconciler.config().network.container_network.clone();

        let report = h.reconciler.teardown().unwrap();
        assert!(report.is_complete(), "{:?}", report.errors);
        assert_eq!(report.chains_removed, 7);
        assert_eq!(report.routes_removed, 1);
        assert_eq!(report.rules_removed, 1);
        assert!(report.link_removed);
        assert!(report.network_removed);

        for chain in h.reconciler.managed_chains() {
            assert!(!h.kernel.filter.chain_exists(chain.table, &chain.name).unwrap());
            assert!(h.kernel.filter.rules(chain.table, chain.parent).is_empty());
        }
        assert!(h.kernel.ip.links.lock().is_empty());
        assert!(h.kernel.ip.route_table().is_empty());
        assert!(h.kernel.networks.inspect_network(&network).unwrap().is_none());

        // Intent survives; only the observed bridge is forgotten
        let node = h.reconciler.db().read(store::node::require).unwrap();
        assert_eq!(node.bridge.bridge_id, None);
        assert_eq!(node.bridge.mesh_interface, None);
        assert_eq!(h.reconciler.list_peers().unwrap().len(), 1);
        assert_eq!(h.reconciler.list_routes().unwrap().len(), 1);
        assert_eq!(h.reconciler.list_rules().unwrap().len(), 2);
    }

    #[test]
    fn test_boot_after_teardown_rebuilds() {
        let h = built_worker();
        h.reconciler.teardown().unwrap();

        let report = h.reconciler.boot().unwrap();
        assert!(!report.is_degraded());
        assert_eq!(report.mesh_peers, Some(2));
        assert_eq!(report.routes.applied, 1);
        assert_eq!(report.rules.applied, 2);
        assert!(h.kernel.filter.contains(
            "filter",
            "NETPLANE_FILTER_INPUT",
            &["-p", "tcp", "--dport", "22", "-j", "ACCEPT"]
        ));
    }

    #[test]
    fn test_teardown_twice_is_harmless() {
        let h = built_worker();
        h.reconciler.teardown().unwrap();

        let report = h.reconciler.teardown().unwrap();
        assert!(report.is_complete());
        assert_eq!(report.chains_removed, 0);
        assert!(!report.link_removed);
        assert!(!report.network_removed);
    }

    #[test]
    fn test_teardown_continues_past_failures() {
        let h = built_worker();
        h.kernel.networks.fail_mutations.store(true, Ordering::SeqCst);

        let report = h.reconciler.teardown().unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.errors.len(), 1);
        assert!(!report.network_removed);
        assert_eq!(report.chains_removed, 7);
        assert!(report.link_removed);
    }
}
