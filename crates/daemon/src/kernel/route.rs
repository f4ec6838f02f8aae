//! Link, address and route management via `ip`

use super::exec::Tool;
use super::Outcome;
use ipnetwork::IpNetwork;
use netplane_common::{Error, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use tracing::debug;

/// A main-table route as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
}

/// Administrative state and addresses of a link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    pub up: bool,
    pub addresses: Vec<IpNetwork>,
}

/// Link, address and routing-table management.
///
/// Routes are identified by destination alone: adding a destination that is
/// already routed is a no-op, as is removing one that is not.
pub trait IpRoute: Send + Sync {
    fn link_exists(&self, name: &str) -> Result<bool>;

    /// None when the link does not exist
    fn link_state(&self, name: &str) -> Result<Option<LinkState>>;

    fn add_wireguard_link(&self, name: &str, mtu: u32) -> Result<()>;

    fn del_link(&self, name: &str) -> Result<Outcome>;

    fn add_address(&self, name: &str, address: &IpNetwork) -> Result<()>;

    fn set_link_up(&self, name: &str) -> Result<()>;

    fn lookup_route(&self, destination: &IpNetwork) -> Result<Option<RouteEntry>>;

    fn add_route(&self, destination: &IpNetwork, gateway: IpAddr) -> Result<Outcome>;

    fn del_route(&self, destination: &IpNetwork) -> Result<Outcome>;
}

/// `ip` (iproute2) CLI backend
pub struct IpCommand {
    tool: Tool,
    sysfs_net: PathBuf,
}

#[derive(Deserialize)]
struct JsonLink {
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    addr_info: Vec<JsonAddress>,
}

#[derive(Deserialize)]
struct JsonAddress {
    local: String,
    prefixlen: u8,
}

#[derive(Deserialize)]
struct JsonRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
}

impl IpCommand {
    pub fn new(program: &str) -> Self {
        Self {
            tool: Tool::new(program),
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }

    fn family_flag(destination: &IpNetwork) -> &'static str {
        if destination.is_ipv4() {
            "-4"
        } else {
            "-6"
        }
    }
}

impl IpRoute for IpCommand {
    fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.sysfs_net.join(name).exists())
    }

    fn link_state(&self, name: &str) -> Result<Option<LinkState>> {
        if !self.link_exists(name)? {
            return Ok(None);
        }
        let stdout = self
            .tool
            .run_checked(&["-json", "address", "show", "dev", name])?;
        parse_link_json(&stdout).map(Some)
    }

    fn del_link(&self, name: &str) -> Result<Outcome> {
        if !self.link_exists(name)? {
            return Ok(Outcome::Unchanged);
        }
        debug!("Deleting link {}", name);
        self.tool.run_checked(&["link", "del", "dev", name])?;
        Ok(Outcome::Changed)
    }

    fn add_wireguard_link(&self, name: &str, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        self.tool
            .run_checked(&["link", "add", "dev", name, "mtu", &mtu, "type", "wireguard"])?;
        Ok(())
    }

    fn add_address(&self, name: &str, address: &IpNetwork) -> Result<()> {
        let address = address.to_string();
        self.tool
            .run_checked(&["address", "add", &address, "dev", name])?;
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> Result<()> {
        self.tool.run_checked(&["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn lookup_route(&self, destination: &IpNetwork) -> Result<Option<RouteEntry>> {
        let dst = destination.to_string();
        let stdout = self.tool.run_checked(&[
            Self::family_flag(destination),
            "-json",
            "route",
            "show",
            "exact",
            &dst,
        ])?;
        parse_route_json(&stdout, destination)
    }

    fn add_route(&self, destination: &IpNetwork, gateway: IpAddr) -> Result<Outcome> {
        if self.lookup_route(destination)?.is_some() {
            return Ok(Outcome::Unchanged);
        }
        debug!("Adding route {} via {}", destination, gateway);
        let dst = destination.to_string();
        let via = gateway.to_string();
        self.tool.run_checked(&["route", "add", &dst, "via", &via])?;
        Ok(Outcome::Changed)
    }

    fn del_route(&self, destination: &IpNetwork) -> Result<Outcome> {
        if self.lookup_route(destination)?.is_none() {
            return Ok(Outcome::Unchanged);
        }
        debug!("Removing route {}", destination);
        let dst = destination.to_string();
        self.tool.run_checked(&["route", "del", &dst])?;
        Ok(Outcome::Changed)
    }
}

/// Read the state of a single link out of `ip -json address show dev` output
pub fn parse_link_json(json: &str) -> Result<LinkState> {
    let links: Vec<JsonLink> = serde_json::from_str(json)?;
    let link = links
        .into_iter()
        .next()
        .ok_or_else(|| Error::external("ip address show", "no link in output"))?;
    let addresses = link
        .addr_info
        .iter()
        .map(|a| {
            a.local
                .parse::<IpAddr>()
                .ok()
                .and_then(|ip| IpNetwork::new(ip, a.prefixlen).ok())
                .ok_or_else(|| {
                    Error::external(
                        "ip address show",
                        format!("bad address in output: {}/{}", a.local, a.prefixlen),
                    )
                })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LinkState {
        up: link.flags.iter().any(|f| f == "UP"),
        addresses,
    })
}

/// Pick the route for `destination` out of `ip -json route show exact` output
pub fn parse_route_json(json: &str, destination: &IpNetwork) -> Result<Option<RouteEntry>> {
    if json.trim().is_empty() {
        return Ok(None);
    }
    let routes: Vec<JsonRoute> = serde_json::from_str(json)?;
    for route in routes {
        // The default route is printed as "default", host routes without a
        // prefix length
        let dst = if route.dst == "default" {
            let any: IpAddr = if destination.is_ipv4() {
                Ipv4Addr::UNSPECIFIED.into()
            } else {
                Ipv6Addr::UNSPECIFIED.into()
            };
            IpNetwork::new(any, 0).ok()
        } else if route.dst.contains('/') {
            route.dst.parse::<IpNetwork>().ok()
        } else {
            route.dst.parse::<IpAddr>().ok().and_then(|ip| {
                let prefix = if ip.is_ipv4() { 32 } else { 128 };
                IpNetwork::new(ip, prefix).ok()
            })
        };
        let Some(dst) = dst else {
            continue;
        };
        if dst.network() == destination.network() && dst.prefix() == destination.prefix() {
            let gateway = route
                .gateway
                .map(|gw| {
                    gw.parse::<IpAddr>().map_err(|_| {
                        Error::external("ip route show", format!("bad gateway in output: {}", gw))
                    })
                })
                .transpose()?;
            return Ok(Some(RouteEntry {
                destination: dst,
                gateway,
            }));
        }
    }
    Ok(None)
}
