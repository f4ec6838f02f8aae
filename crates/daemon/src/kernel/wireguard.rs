//! WireGuard device configuration via `wg`

use super::exec::Tool;
use ipnetwork::IpNetwork;
use netplane_common::{Result, WgKey};
use std::fmt::Write as _;
use std::net::SocketAddr;
use tracing::debug;

/// One peer as pushed to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: WgKey,
    pub allowed_ips: Vec<IpNetwork>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: u16,
}

/// Complete device configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub private_key: WgKey,
    pub listen_port: u16,
    pub peers: Vec<PeerConfig>,
    /// Drop every peer not listed in `peers`
    pub replace_peers: bool,
}

impl DeviceConfig {
    /// Render in the `wg setconf` file format
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[Interface]");
        let _ = writeln!(out, "PrivateKey = {}", self.private_key.to_base64());
        let _ = writeln!(out, "ListenPort = {}", self.listen_port);

        for peer in &self.peers {
            let _ = writeln!(out);
            let _ = writeln!(out, "[Peer]");
            let _ = writeln!(out, "PublicKey = {}", peer.public_key.to_base64());
            let allowed = peer
                .allowed_ips
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "AllowedIPs = {}", allowed);
            if let Some(endpoint) = peer.endpoint {
                let _ = writeln!(out, "Endpoint = {}", endpoint);
            }
            if peer.persistent_keepalive > 0 {
                let _ = writeln!(out, "PersistentKeepalive = {}", peer.persistent_keepalive);
            }
        }
        out
    }
}

/// WireGuard device control
pub trait WireguardControl: Send + Sync {
    fn configure_device(&self, interface: &str, config: &DeviceConfig) -> Result<()>;

    /// Base64 public keys of the peers currently on the device
    fn device_peers(&self, interface: &str) -> Result<Vec<String>>;
}

/// `wg` CLI backend. The rendered config is fed on stdin so key material
/// never touches the filesystem.
pub struct WgCommand {
    tool: Tool,
}

impl WgCommand {
    pub fn new(program: &str) -> Self {
        Self {
            tool: Tool::new(program),
        }
    }
}

impl WireguardControl for WgCommand {
    fn configure_device(&self, interface: &str, config: &DeviceConfig) -> Result<()> {
        // setconf replaces the whole device state, addconf merges into it
        let verb = if config.replace_peers { "setconf" } else { "addconf" };
        debug!(
            "Configuring {} with {} peers ({})",
            interface,
            config.peers.len(),
            verb
        );
        self.tool
            .run_checked_with_stdin(&[verb, interface, "/dev/stdin"], &config.render())?;
        Ok(())
    }

    fn device_peers(&self, interface: &str) -> Result<Vec<String>> {
        let stdout = self.tool.run_checked(&["show", interface, "peers"])?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }
}
