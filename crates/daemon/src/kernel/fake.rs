//! In-memory kernel used by the reconciler tests

use super::*;
use ipnetwork::IpNetwork;
use netplane_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const BUILTIN_CHAINS: &[(&str, &str)] = &[
    ("filter", "INPUT"),
    ("filter", "OUTPUT"),
    ("filter", "FORWARD"),
    ("nat", "PREROUTING"),
    ("nat", "POSTROUTING"),
    ("nat", "INPUT"),
    ("nat", "OUTPUT"),
];

fn injected(op: &str) -> Error {
    Error::external(op, "injected failure")
}

#[derive(Default)]
pub struct FakeFilter {
    chains: Mutex<HashMap<(String, String), Vec<Vec<String>>>>,
    pub calls: AtomicUsize,
    pub fail_mutations: AtomicBool,
}

impl FakeFilter {
    pub fn new() -> Self {
        let filter = Self::default();
        {
            let mut chains = filter.chains.lock();
            for (table, chain) in BUILTIN_CHAINS {
                chains.insert((table.to_string(), chain.to_string()), Vec::new());
            }
        }
        filter
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.chains
            .lock()
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, table: &str, chain: &str, rule: &[&str]) -> bool {
        self.rules(table, chain)
            .iter()
            .any(|r| r.iter().map(String::as_str).eq(rule.iter().copied()))
    }

    pub fn remove_chain(&self, table: &str, chain: &str) {
        self.chains
            .lock()
            .remove(&(table.to_string(), chain.to_string()));
    }

    fn touch(&self, op: &str, mutation: bool) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if mutation && self.fail_mutations.load(Ordering::SeqCst) {
            return Err(injected(op));
        }
        Ok(())
    }

    fn with_chain<T>(
        &self,
        table: &str,
        chain: &str,
        f: impl FnOnce(&mut Vec<Vec<String>>) -> Result<T>,
    ) -> Result<T> {
        let mut chains = self.chains.lock();
        match chains.get_mut(&(table.to_string(), chain.to_string())) {
            Some(rules) => f(rules),
            None => Err(Error::external(
                format!("iptables -t {} {}", table, chain),
                "No chain/target/match by that name.",
            )),
        }
    }
}

impl PacketFilter for FakeFilter {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        self.touch("chain_exists", false)?;
        Ok(self
            .chains
            .lock()
            .contains_key(&(table.to_string(), chain.to_string())))
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.touch("new_chain", true)?;
        let mut chains = self.chains.lock();
        let key = (table.to_string(), chain.to_string());
        if chains.contains_key(&key) {
            return Err(Error::external("iptables -N", "Chain already exists."));
        }
        chains.insert(key, Vec::new());
        Ok(())
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.touch("flush_chain", true)?;
        self.with_chain(table, chain, |rules| {
            rules.clear();
            Ok(())
        })
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.touch("delete_chain", true)?;
        let mut chains = self.chains.lock();
        let key = (table.to_string(), chain.to_string());
        match chains.get(&key) {
            None => {
                return Err(Error::external(
                    "iptables -X",
                    "No chain/target/match by that name.",
                ))
            }
            Some(rules) if !rules.is_empty() => {
                return Err(Error::external("iptables -X", "Directory not empty"))
            }
            Some(_) => {}
        }
        let referenced = chains
            .iter()
            .filter(|((t, _), _)| t == table)
            .flat_map(|(_, rules)| rules.iter())
            .any(|rule| rule.windows(2).any(|w| w[0] == "-j" && w[1] == chain));
        if referenced {
            return Err(Error::external("iptables -X", "Too many links"));
        }
        chains.remove(&key);
        Ok(())
    }

    fn rule_exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool> {
        self.touch("rule_exists", false)?;
        Ok(self
            .chains
            .lock()
            .get(&(table.to_string(), chain.to_string()))
            .map_or(false, |rules| rules.iter().any(|r| r == rule)))
    }

    fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        self.touch("append", true)?;
        self.with_chain(table, chain, |rules| {
            rules.push(rule.to_vec());
            Ok(())
        })
    }

    fn insert(&self, table: &str, chain: &str, position: usize, rule: &[String]) -> Result<()> {
        self.touch("insert", true)?;
        self.with_chain(table, chain, |rules| {
            if position == 0 || position > rules.len() + 1 {
                return Err(Error::external("iptables -I", "Index of insertion too big."));
            }
            rules.insert(position - 1, rule.to_vec());
            Ok(())
        })
    }

    fn delete(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        self.touch("delete", true)?;
        self.with_chain(table, chain, |rules| {
            match rules.iter().position(|r| r == rule) {
                Some(index) => {
                    rules.remove(index);
                    Ok(())
                }
                None => Err(Error::external("iptables -D", "Bad rule")),
            }
        })
    }

    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<Vec<String>>> {
        self.touch("list_rules", false)?;
        self.with_chain(table, chain, |rules| Ok(rules.clone()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeLink {
    pub mtu: u32,
    pub addresses: Vec<IpNetwork>,
    pub up: bool,
}

#[derive(Default)]
pub struct FakeIp {
    pub links: Mutex<HashMap<String, FakeLink>>,
    pub routes: Mutex<BTreeMap<String, IpAddr>>,
    pub calls: AtomicUsize,
    pub fail_mutations: AtomicBool,
    /// Fail only the named operation, e.g. "add_address"
    pub fail_op: Mutex<Option<&'static str>>,
}

impl FakeIp {
    pub fn route_table(&self) -> Vec<(String, IpAddr)> {
        self.routes
            .lock()
            .iter()
            .map(|(dst, gw)| (dst.clone(), *gw))
            .collect()
    }

    fn touch(&self, op: &str, mutation: bool) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if mutation && self.fail_mutations.load(Ordering::SeqCst) {
            return Err(injected(op));
        }
        if *self.fail_op.lock() == Some(op) {
            return Err(injected(op));
        }
        Ok(())
    }
}

impl IpRoute for FakeIp {
    fn link_exists(&self, name: &str) -> Result<bool> {
        self.touch("link_exists", false)?;
        Ok(self.links.lock().contains_key(name))
    }

    fn link_state(&self, name: &str) -> Result<Option<LinkState>> {
        self.touch("link_state", false)?;
        Ok(self.links.lock().get(name).map(|link| LinkState {
            up: link.up,
            addresses: link.addresses.clone(),
        }))
    }

    fn del_link(&self, name: &str) -> Result<Outcome> {
        self.touch("del_link", true)?;
        match self.links.lock().remove(name) {
            Some(_) => Ok(Outcome::Changed),
            None => Ok(Outcome::Unchanged),
        }
    }

    fn add_wireguard_link(&self, name: &str, mtu: u32) -> Result<()> {
        self.touch("add_wireguard_link", true)?;
        let mut links = self.links.lock();
        if links.contains_key(name) {
            return Err(Error::external("ip link add", "File exists"));
        }
        links.insert(
            name.to_string(),
            FakeLink {
                mtu,
                ..Default::default()
            },
        );
        Ok(())
    }

    fn add_address(&self, name: &str, address: &IpNetwork) -> Result<()> {
        self.touch("add_address", true)?;
        let mut links = self.links.lock();
        let link = links
            .get_mut(name)
            .ok_or_else(|| Error::external("ip address add", "Cannot find device"))?;
        link.addresses.push(*address);
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> Result<()> {
        self.touch("set_link_up", true)?;
        let mut links = self.links.lock();
        let link = links
            .get_mut(name)
            .ok_or_else(|| Error::external("ip link set", "Cannot find device"))?;
        link.up = true;
        Ok(())
    }

    fn lookup_route(&self, destination: &IpNetwork) -> Result<Option<RouteEntry>> {
        self.touch("lookup_route", false)?;
        Ok(self
            .routes
            .lock()
            .get(&destination.to_string())
            .map(|gateway| RouteEntry {
                destination: *destination,
                gateway: Some(*gateway),
            }))
    }

    fn add_route(&self, destination: &IpNetwork, gateway: IpAddr) -> Result<Outcome> {
        self.touch("add_route", true)?;
        let mut routes = self.routes.lock();
        let key = destination.to_string();
        if routes.contains_key(&key) {
            return Ok(Outcome::Unchanged);
        }
        routes.insert(key, gateway);
        Ok(Outcome::Changed)
    }

    fn del_route(&self, destination: &IpNetwork) -> Result<Outcome> {
        self.touch("del_route", true)?;
        match self.routes.lock().remove(&destination.to_string()) {
            Some(_) => Ok(Outcome::Changed),
            None => Ok(Outcome::Unchanged),
        }
    }
}

#[derive(Default)]
pub struct FakeWireguard {
    devices: Mutex<HashMap<String, DeviceConfig>>,
    pub configure_calls: AtomicUsize,
    pub fail_mutations: AtomicBool,
}

impl FakeWireguard {
    pub fn device(&self, interface: &str) -> Option<DeviceConfig> {
        self.devices.lock().get(interface).cloned()
    }

    /// Sorted base64 peer keys on the device
    pub fn peer_keys(&self, interface: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .device(interface)
            .map(|d| d.peers.iter().map(|p| p.public_key.to_base64()).collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl WireguardControl for FakeWireguard {
    fn configure_device(&self, interface: &str, config: &DeviceConfig) -> Result<()> {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(injected("wg setconf"));
        }
        let mut devices = self.devices.lock();
        match devices.get_mut(interface) {
            Some(existing) if !config.replace_peers => {
                existing.private_key = config.private_key.clone();
                existing.listen_port = config.listen_port;
                for peer in &config.peers {
                    existing.peers.retain(|p| p.public_key != peer.public_key);
                    existing.peers.push(peer.clone());
                }
            }
            _ => {
                devices.insert(interface.to_string(), config.clone());
            }
        }
        Ok(())
    }

    fn device_peers(&self, interface: &str) -> Result<Vec<String>> {
        Ok(self.peer_keys(interface))
    }
}

#[derive(Default)]
pub struct FakeNetworks {
    networks: Mutex<HashMap<String, NetworkInfo>>,
    next_id: AtomicUsize,
    pub creates: AtomicUsize,
    pub fail_mutations: AtomicBool,
}

impl FakeNetworks {
    /// Replace the named network, as if it had been recreated out of band
    pub fn set_network(&self, name: &str, id: &str, subnet: &str, gateway: &str) {
        self.networks.lock().insert(
            name.to_string(),
            NetworkInfo {
                id: id.to_string(),
                subnet: Some(subnet.to_string()),
                gateway: Some(gateway.to_string()),
                interface: None,
            },
        );
    }
}

impl ContainerNetworks for FakeNetworks {
    fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        Ok(self.networks.lock().get(name).cloned())
    }

    fn create_network(&self, name: &str, subnet: &str, gateway: &str) -> Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(injected("network create"));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{:012x}{}", n, "f".repeat(52));
        self.set_network(name, &id, subnet, gateway);
        Ok(())
    }

    fn remove_network(&self, name: &str) -> Result<Outcome> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(injected("network rm"));
        }
        match self.networks.lock().remove(name) {
            Some(_) => Ok(Outcome::Changed),
            None => Ok(Outcome::Unchanged),
        }
    }
}

/// Fakes plus the handles wired to them
pub struct FakeKernel {
    pub filter: Arc<FakeFilter>,
    pub ip: Arc<FakeIp>,
    pub wireguard: Arc<FakeWireguard>,
    pub networks: Arc<FakeNetworks>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self {
            filter: Arc::new(FakeFilter::new()),
            ip: Arc::new(FakeIp::default()),
            wireguard: Arc::new(FakeWireguard::default()),
            networks: Arc::new(FakeNetworks::default()),
        }
    }

    pub fn handles(&self) -> KernelHandles {
        KernelHandles {
            filter: self.filter.clone(),
            ip: self.ip.clone(),
            wireguard: self.wireguard.clone(),
            networks: self.networks.clone(),
        }
    }
}
