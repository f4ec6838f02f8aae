//! Container runtime network management via the `docker`/`podman` CLI

use super::exec::Tool;
use super::Outcome;
use netplane_common::{Error, Result};
use serde_json::Value;
use std::process::Command;
use tracing::{debug, info};

/// Container runtime detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    /// Detect available container runtime
    pub fn detect() -> Option<Self> {
        // Check podman first (rootless friendly)
        if Command::new("podman").arg("--version").output().is_ok() {
            return Some(Self::Podman);
        }
        if Command::new("docker").arg("--version").output().is_ok() {
            return Some(Self::Docker);
        }
        None
    }

    /// Get the CLI command name
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

/// A runtime network as inspected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    /// Host-side interface name, when the runtime reports one
    pub interface: Option<String>,
}

impl NetworkInfo {
    /// Host bridge name: the reported interface, else `br-` plus the first
    /// 12 characters of the network id.
    pub fn bridge_identity(&self) -> Result<String> {
        if let Some(interface) = &self.interface {
            return Ok(interface.clone());
        }
        match self.id.get(..12) {
            Some(prefix) => Ok(format!("br-{}", prefix)),
            None => Err(Error::external(
                "network inspect",
                format!("network id '{}' is shorter than 12 characters", self.id),
            )),
        }
    }
}

/// Container-runtime network management
pub trait ContainerNetworks: Send + Sync {
    fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>>;

    /// Create an attachable bridge network with a fixed subnet and gateway
    fn create_network(&self, name: &str, subnet: &str, gateway: &str) -> Result<()>;

    /// Remove the network if it exists
    fn remove_network(&self, name: &str) -> Result<Outcome>;
}

/// CLI backend for docker or podman
pub struct RuntimeCli {
    runtime: ContainerRuntime,
    tool: Tool,
}

impl RuntimeCli {
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self {
            runtime,
            tool: Tool::new(runtime.command()),
        }
    }

    /// Use the configured binary, or detect one
    pub fn from_config(program: Option<&str>) -> Result<Self> {
        match program {
            Some(program) => {
                let runtime = if program.ends_with("podman") {
                    ContainerRuntime::Podman
                } else {
                    ContainerRuntime::Docker
                };
                Ok(Self {
                    runtime,
                    tool: Tool::new(program),
                })
            }
            None => ContainerRuntime::detect().map(Self::new).ok_or_else(|| {
                Error::InvalidConfig("no container runtime found (tried podman, docker)".to_string())
            }),
        }
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    fn network_listed(&self, name: &str) -> Result<bool> {
        let filter = format!("name=^{}$", name);
        let stdout = self.tool.run_checked(&[
            "network",
            "ls",
            "--filter",
            &filter,
            "--format",
            "{{.Name}}",
        ])?;
        Ok(stdout.lines().any(|line| line.trim() == name))
    }
}

impl ContainerNetworks for RuntimeCli {
    fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        if !self.network_listed(name)? {
            return Ok(None);
        }
        let stdout = self
            .tool
            .run_checked(&["network", "inspect", name, "--format", "{{json .}}"])?;
        let value: Value = serde_json::from_str(stdout.trim())?;
        parse_network_json(&value).map(Some)
    }

    fn create_network(&self, name: &str, subnet: &str, gateway: &str) -> Result<()> {
        info!(
            "Creating {} network {} ({} via {})",
            self.runtime.command(),
            name,
            subnet,
            gateway
        );
        let subnet = format!("--subnet={}", subnet);
        let gateway = format!("--gateway={}", gateway);
        let mut args = vec![
            "network",
            "create",
            "--driver",
            "bridge",
            subnet.as_str(),
            gateway.as_str(),
        ];
        if self.runtime == ContainerRuntime::Docker {
            args.push("--attachable");
        }
        args.push(name);
        let stdout = self.tool.run_checked(&args)?;
        debug!("Created network {}: {}", name, stdout.trim());
        Ok(())
    }

    fn remove_network(&self, name: &str) -> Result<Outcome> {
        if !self.network_listed(name)? {
            return Ok(Outcome::Unchanged);
        }
        info!("Removing {} network {}", self.runtime.command(), name);
        self.tool.run_checked(&["network", "rm", name])?;
        Ok(Outcome::Changed)
    }
}

/// Read id, subnet and gateway out of docker or podman inspect output
pub fn parse_network_json(value: &Value) -> Result<NetworkInfo> {
    let field = |upper: &str, lower: &str| {
        value
            .get(upper)
            .or_else(|| value.get(lower))
            .and_then(Value::as_str)
            .map(String::from)
    };

    let id = field("Id", "id")
        .ok_or_else(|| Error::external("network inspect", "output carries no network id"))?;

    // docker: IPAM.Config[0].{Subnet,Gateway}; podman: subnets[0].{subnet,gateway}
    let ipam = value
        .pointer("/IPAM/Config/0")
        .or_else(|| value.pointer("/subnets/0"));
    let ipam_field = |upper: &str, lower: &str| {
        ipam.and_then(|c| c.get(upper).or_else(|| c.get(lower)))
            .and_then(Value::as_str)
            .map(String::from)
    };

    Ok(NetworkInfo {
        id,
        subnet: ipam_field("Subnet", "subnet"),
        gateway: ipam_field("Gateway", "gateway"),
        interface: value
            .get("network_interface")
            .and_then(Value::as_str)
            .map(String::from),
    })
}
