//! Kernel and container-runtime interfaces
//!
//! Each concern sits behind a synchronous trait so reconciliation can hold a
//! database transaction open across kernel calls. Production implementations
//! drive the system tools; tests use the in-memory fakes.

pub mod exec;
pub mod iptables;
pub mod route;
pub mod runtime;
pub mod wireguard;

#[cfg(test)]
pub mod fake;

use crate::config::DaemonConfig;
use netplane_common::Result;
use std::sync::Arc;

pub use iptables::{Iptables, PacketFilter};
pub use route::{IpCommand, IpRoute, LinkState, RouteEntry};
pub use runtime::{ContainerNetworks, NetworkInfo, RuntimeCli};
pub use wireguard::{DeviceConfig, PeerConfig, WgCommand, WireguardControl};

/// Whether an idempotent kernel operation had to change anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Changed,
    Unchanged,
}

impl Outcome {
    pub fn changed(self) -> bool {
        self == Outcome::Changed
    }
}

/// The four kernel-facing handles the reconciler drives
#[derive(Clone)]
pub struct KernelHandles {
    pub filter: Arc<dyn PacketFilter>,
    pub ip: Arc<dyn IpRoute>,
    pub wireguard: Arc<dyn WireguardControl>,
    pub networks: Arc<dyn ContainerNetworks>,
}

impl KernelHandles {
    /// Handles backed by the host's system tools
    pub fn system(config: &DaemonConfig) -> Result<Self> {
        let tools = &config.tools;
        Ok(Self {
            filter: Arc::new(Iptables::new(&tools.iptables)),
            ip: Arc::new(IpCommand::new(&tools.ip)),
            wireguard: Arc::new(WgCommand::new(&tools.wg)),
            networks: Arc::new(RuntimeCli::from_config(tools.container_runtime.as_deref())?),
        })
    }
}
