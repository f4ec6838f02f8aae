//! WireGuard mesh interface and peers

use super::NetworkReconciler;
use crate::kernel::{DeviceConfig, Outcome, PeerConfig};
use netplane_common::types::{parse_cidr, parse_ip};
use netplane_common::{
    store, Error, NodeNetworkConfig, PeerEndpointUpdate, Result, WgKey, WireguardPeer,
};
use rusqlite::Connection;
use std::net::SocketAddr;
use tracing::{info, warn};

/// What to do with a peer record that does not parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPolicy {
    /// Fail the whole reconfiguration
    Strict,
    /// Log it and configure the rest
    SkipInvalid,
}

impl NetworkReconciler {
    /// Create the mesh interface if it does not exist yet, and make sure it
    /// carries its address and is up. An existing interface is repaired in
    /// place, never recreated.
    pub fn ensure_interface(&self) -> Result<Outcome> {
        let _guard = self.mutations.lock();
        let node = self.db.read(store::node::require)?;
        self.ensure_interface_locked(&node)
    }

    pub(crate) fn ensure_interface_locked(&self, node: &NodeNetworkConfig) -> Result<Outcome> {
        let iface = &self.config.network.wireguard_interface;
        let ip = &self.kernel.ip;
        let address = parse_cidr(&node.wireguard.address)?;

        if let Some(state) = ip.link_state(iface)? {
            let mut outcome = Outcome::Unchanged;
            if !state.addresses.contains(&address) {
                warn!("WireGuard interface {} lacks {}, adding it", iface, address);
                ip.add_address(iface, &address)?;
                outcome = Outcome::Changed;
            }
            if !state.up {
                warn!("WireGuard interface {} is down, bringing it up", iface);
                ip.set_link_up(iface)?;
                outcome = Outcome::Changed;
            }
            return Ok(outcome);
        }

        ip.add_wireguard_link(iface, node.wireguard.mtu)?;
        let configured = ip
            .add_address(iface, &address)
            .and_then(|_| ip.set_link_up(iface));
        if let Err(e) = configured {
            // A half-configured link must not survive; the next attempt starts over
            if let Err(cleanup) = ip.del_link(iface) {
                warn!("Failed to remove WireGuard interface {}: {}", iface, cleanup);
            }
            return Err(e);
        }
        info!(
            "Created WireGuard interface {} ({}, mtu {})",
            iface, address, node.wireguard.mtu
        );
        Ok(Outcome::Changed)
    }

    fn peer_config(&self, peer: &WireguardPeer) -> Result<PeerConfig> {
        Ok(PeerConfig {
            public_key: WgKey::parse(&peer.public_key)?,
            allowed_ips: peer.allowed_networks()?,
            endpoint: peer
                .endpoint()?
                .map(|ip| SocketAddr::new(ip, self.config.wireguard.peer_port)),
            persistent_keepalive: self.config.wireguard.persistent_keepalive_secs,
        })
    }

    /// Registered peers plus the coordinator on workers, as read through `conn`
    fn desired_peers(
        &self,
        conn: &Connection,
        node: &NodeNetworkConfig,
        policy: PeerPolicy,
    ) -> Result<Vec<PeerConfig>> {
        let records = store::peers::list(conn)?
            .into_iter()
            .chain(node.coordinator_peer());

        let mut peers = Vec::new();
        for record in records {
            match self.peer_config(&record) {
                Ok(peer) => peers.push(peer),
                Err(e) if policy == PeerPolicy::SkipInvalid => {
                    warn!("Skipping peer {}: {}", record.public_key, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(peers)
    }

    /// Push the complete peer set, replacing whatever the device holds.
    /// `conn` decides what is visible: pass the open transaction to include
    /// its uncommitted changes.
    pub(crate) fn reconfigure_peers_with(
        &self,
        conn: &Connection,
        node: &NodeNetworkConfig,
        policy: PeerPolicy,
    ) -> Result<usize> {
        let private_key = WgKey::parse(&node.wireguard.private_key)?;
        let peers = self.desired_peers(conn, node, policy)?;
        let count = peers.len();
        self.kernel.wireguard.configure_device(
            &self.config.network.wireguard_interface,
            &DeviceConfig {
                private_key,
                listen_port: node.wireguard.listen_port,
                peers,
                replace_peers: true,
            },
        )?;
        Ok(count)
    }

    /// Force a full peer reconfiguration from committed state
    pub fn reconfigure_peers(&self) -> Result<usize> {
        let _guard = self.mutations.lock();
        let node = self.db.read(store::node::require)?;
        let count = self
            .db
            .read(|conn| self.reconfigure_peers_with(conn, &node, PeerPolicy::Strict))?;
        info!("Reconfigured {} WireGuard peers", count);
        Ok(count)
    }

    pub fn list_peers(&self) -> Result<Vec<WireguardPeer>> {
        self.db.read(store::peers::list)
    }

    pub fn get_peer(&self, public_key: &str) -> Result<WireguardPeer> {
        self.db
            .read(|conn| store::peers::get(conn, public_key))?
            .ok_or_else(|| Error::not_found("wireguard_peer", public_key))
    }

    /// Register a peer and reconfigure the device before committing
    pub fn create_peer(&self, mut peer: WireguardPeer) -> Result<WireguardPeer> {
        peer.public_key = peer.public_key.trim().to_string();
        peer.endpoint_ip = peer
            .endpoint_ip
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty());
        peer.validate()?;

        let _guard = self.mutations.lock();
        self.db.transaction(|tx| {
            let node = store::node::require(tx)?;
            if peer.public_key == node.public_key()? {
                return Err(Error::validation("peer public key is this node's own key"));
            }
            if let Some(link) = &node.coordinator {
                if peer.public_key == link.public_key.trim() {
                    return Err(Error::validation(
                        "peer public key is the coordinator's key, which is always configured",
                    ));
                }
            }
            if store::peers::exists(tx, &peer.public_key)? {
                return Err(Error::already_exists("wireguard_peer", &peer.public_key));
            }

            store::peers::insert(tx, &peer)?;
            self.reconfigure_peers_with(tx, &node, PeerPolicy::Strict)?;
            Ok(())
        })?;

        info!("Added WireGuard peer {}", peer.public_key);
        Ok(peer)
    }

    pub fn delete_peer(&self, public_key: &str) -> Result<()> {
        let _guard = self.mutations.lock();
        self.db.transaction(|tx| {
            let node = store::node::require(tx)?;
            if !store::peers::delete(tx, public_key)? {
                return Err(Error::not_found("wireguard_peer", public_key));
            }
            self.reconfigure_peers_with(tx, &node, PeerPolicy::Strict)?;
            Ok(())
        })?;

        info!("Removed WireGuard peer {}", public_key);
        Ok(())
    }

    pub fn update_peer_endpoint(
        &self,
        public_key: &str,
        update: PeerEndpointUpdate,
    ) -> Result<WireguardPeer> {
        let endpoint = parse_ip(&update.endpoint_ip)?.to_string();

        let _guard = self.mutations.lock();
        let peer = self.db.transaction(|tx| {
            let node = store::node::require(tx)?;
            if !store::peers::set_endpoint(tx, public_key, &endpoint)? {
                return Err(Error::not_found("wireguard_peer", public_key));
            }
            self.reconfigure_peers_with(tx, &node, PeerPolicy::Strict)?;
            store::peers::get(tx, public_key)?
                .ok_or_else(|| Error::not_found("wireguard_peer", public_key))
        })?;

        info!("Updated endpoint of WireGuard peer {} to {}", public_key, endpoint);
        Ok(peer)
    }
}
