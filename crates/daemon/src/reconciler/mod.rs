//! Network reconciliation
//!
//! `NetworkReconciler` owns the database and the kernel handles, and is the
//! only thing that mutates either. Every structural sequence (bridge sync,
//! peer reconfiguration, route and rule changes, replays) runs under one
//! process-wide mutation lock. Row changes that accompany a kernel change are
//! made inside a write transaction that commits only if the kernel call
//! succeeded.

mod bridge;
mod chains;
mod drift;
mod mesh;
mod routes;
mod rules;
mod teardown;

pub use bridge::{structural_rules, StructuralRule};
pub use chains::ManagedChain;
pub use drift::{DriftDetector, DriftReport, DriftType};
pub use mesh::PeerPolicy;
pub use teardown::TeardownReport;

use crate::config::DaemonConfig;
use crate::kernel::KernelHandles;
use netplane_common::{store, Database, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Per-item results of replaying persisted records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl std::fmt::Display for ReplayStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} applied, {} already present, {} failed",
            self.applied, self.unchanged, self.failed
        )
    }
}

/// What boot managed to bring up
#[derive(Debug, Clone, Default)]
pub struct BootReport {
    pub bridge_id: Option<String>,
    pub bridge_error: Option<String>,
    pub mesh_peers: Option<usize>,
    pub mesh_error: Option<String>,
    pub routes: ReplayStats,
    pub rules: ReplayStats,
}

impl BootReport {
    /// True when any stage failed or any record could not be replayed
    pub fn is_degraded(&self) -> bool {
        self.bridge_error.is_some()
            || self.mesh_error.is_some()
            || self.routes.failed > 0
            || self.rules.failed > 0
    }
}

/// Drives persisted network intent into the kernel
pub struct NetworkReconciler {
    config: DaemonConfig,
    db: Database,
    kernel: KernelHandles,
    /// Serialises structural sequences in this process. Other processes are
    /// kept out by the store lock the binary takes.
    mutations: Mutex<()>,
}

impl NetworkReconciler {
    pub fn new(config: DaemonConfig, db: Database, kernel: KernelHandles) -> Self {
        Self {
            config,
            db,
            kernel,
            mutations: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn kernel(&self) -> &KernelHandles {
        &self.kernel
    }

    /// Bring up the whole network plane.
    ///
    /// Chain setup failing is fatal. Bridge and mesh failures are logged and
    /// reported so routes and rules still converge; individual routes and
    /// rules that fail are logged and skipped.
    pub fn boot(&self) -> Result<BootReport> {
        let _guard = self.mutations.lock();
        let node = self.db.read(store::node::require)?;
        info!("Booting network plane for {} node", node.role);

        self.ensure_chains_locked()?;

        let mut report = BootReport::default();

        match self.sync_bridge_locked() {
            Ok(bridge_id) => report.bridge_id = Some(bridge_id),
            Err(e) => {
                error!("Bridge network synchronisation failed: {}", e);
                report.bridge_error = Some(e.to_string());
            }
        }

        let mesh = self.ensure_interface_locked(&node).and_then(|_| {
            self.db
                .read(|conn| self.reconfigure_peers_with(conn, &node, PeerPolicy::SkipInvalid))
        });
        match mesh {
            Ok(peers) => report.mesh_peers = Some(peers),
            Err(e) => {
                error!("WireGuard mesh setup failed: {}", e);
                report.mesh_error = Some(e.to_string());
            }
        }

        report.routes = self.replay_routes_locked()?;
        report.rules = self.replay_rules_locked()?;

        if report.is_degraded() {
            warn!(
                "Network plane up with failures (routes: {}; rules: {})",
                report.routes, report.rules
            );
        } else {
            info!(
                "Network plane up (routes: {}; rules: {})",
                report.routes, report.rules
            );
        }
        Ok(report)
    }

    /// Re-run the idempotent replays: chains, bridge rules, routes, rules
    pub fn resync(&self) -> Result<()> {
        let _guard = self.mutations.lock();
        self.ensure_chains_locked()?;
        if let Err(e) = self.sync_bridge_locked() {
            warn!("Bridge resync failed: {}", e);
        }
        let routes = self.replay_routes_locked()?;
        let rules = self.replay_rules_locked()?;
        if routes.applied + routes.failed + rules.applied + rules.failed > 0 {
            info!("Resync: routes {}; rules {}", routes, rules);
        }
        Ok(())
    }

    /// Resync forever on the configured interval. Returns immediately when
    /// the interval is zero.
    pub async fn run(self: Arc<Self>) {
        let secs = self.config.reconcile.resync_interval_secs;
        if secs == 0 {
            return;
        }
        info!("Periodic resync every {}s", secs);

        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        // The first tick completes immediately; boot has just converged.
        interval.tick().await;
        loop {
            interval.tick().await;
            let reconciler = self.clone();
            match tokio::task::spawn_blocking(move || reconciler.resync()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Resync error: {}", e),
                Err(e) => error!("Resync task failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::kernel::fake::FakeKernel;
    use netplane_common::types::*;

    pub const PRIVATE: &str = "SK+Ao+yS+6mMrrrfxkgyGPGtuuoRxj3af4CtG3/nP08=";
    pub const COORDINATOR_KEY: &str = "3ISIkdS5eyvYh2PY0jv4NZZAR6SzUBonkG36JHNa7nQ=";
    pub const PEER_A: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
    pub const PEER_B: &str = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";

    pub struct Harness {
        pub _dir: tempfile::TempDir,
        pub kernel: FakeKernel,
        pub reconciler: NetworkReconciler,
    }

    pub fn coordinator() -> NodeNetworkConfig {
        NodeNetworkConfig {
            role: NodeRole::Coordinator,
            wireguard: WireguardSettings {
                private_key: PRIVATE.to_string(),
                address: "10.10.0.1/24".to_string(),
                listen_port: 51820,
                mtu: 1420,
            },
            bridge: BridgeSettings {
                subnet: "10.0.1.0/24".to_string(),
                gateway: "10.0.1.1".to_string(),
                bridge_id: None,
                mesh_interface: None,
            },
            coordinator: None,
        }
    }

    pub fn worker() -> NodeNetworkConfig {
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
                public_key: COORDINATOR_KEY.to_string(),
                endpoint: "49.13.204.35".to_string(),
                allowed_ips: "10.10.0.1/32,10.0.1.0/24".to_string(),
            }),
        }
    }

    pub fn harness(node: NodeNetworkConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_with_readers(dir.path().join("state.db"), 2).unwrap();
        db.write(|conn| store::node::insert(conn, &node)).unwrap();

        let mut config = DaemonConfig::default();
        config.store_path = dir.path().to_path_buf();

        let kernel = FakeKernel::new();
        let reconciler = NetworkReconciler::new(config, db, kernel.handles());
        Harness {
            _dir: dir,
            kernel,
            reconciler,
        }
    }

    pub fn args(rule: &[&str]) -> Vec<String> {
        rule.iter().map(|s| s.to_string()).collect()
    }
}
