//! Static routes

use super::{NetworkReconciler, ReplayStats};
use crate::kernel::Outcome;
use netplane_common::types::{parse_ip, parse_network_cidr};
use netplane_common::{store, Error, Result, StaticRoute};
use tracing::{info, warn};

/// Canonical form used as the route's identity
fn canonical(route: &StaticRoute) -> Result<StaticRoute> {
    route.validate()?;
    Ok(StaticRoute {
        destination: parse_network_cidr(&route.destination)?.to_string(),
        gateway: parse_ip(&route.gateway)?.to_string(),
    })
}

fn destination_key(destination: &str) -> String {
    parse_network_cidr(destination)
        .map(|d| d.to_string())
        .unwrap_or_else(|_| destination.trim().to_string())
}

impl NetworkReconciler {
    pub fn list_routes(&self) -> Result<Vec<StaticRoute>> {
        self.db.read(store::routes::list)
    }

    pub fn get_route(&self, destination: &str) -> Result<StaticRoute> {
        let key = destination_key(destination);
        self.db
            .read(|conn| store::routes::get(conn, &key))?
            .ok_or_else(|| Error::not_found("static_route", key))
    }

    /// Persist a route and add it to the kernel. A kernel route already
    /// present for the destination counts as success.
    pub fn create_route(&self, route: StaticRoute) -> Result<StaticRoute> {
        let route = canonical(&route)?;
        let destination = parse_network_cidr(&route.destination)?;
        let gateway = parse_ip(&route.gateway)?;

        let _guard = self.mutations.lock();
        self.db.transaction(|tx| {
            if store::routes::get(tx, &route.destination)?.is_some() {
                return Err(Error::already_exists("static_route", &route.destination));
            }
            store::routes::insert(tx, &route)?;
            if self.kernel.ip.add_route(&destination, gateway)? == Outcome::Unchanged {
                warn!(
                    "Route to {} already present in the kernel, keeping it",
                    route.destination
                );
            }
            Ok(())
        })?;

        info!("Added route {} via {}", route.destination, route.gateway);
        Ok(route)
    }

    /// Remove a route. Returns false, without touching the kernel, when no
    /// such route is persisted.
    pub fn delete_route(&self, destination: &str) -> Result<bool> {
        let key = destination_key(destination);

        let _guard = self.mutations.lock();
        let removed = self.db.transaction(|tx| {
            if store::routes::get(tx, &key)?.is_none() {
                return Ok(false);
            }
            let network = parse_network_cidr(&key)?;
            store::routes::delete(tx, &key)?;
            self.kernel.ip.del_route(&network)?;
            Ok(true)
        })?;

        if removed {
            info!("Removed route {}", key);
        }
        Ok(removed)
    }

    pub(crate) fn replay_routes_locked(&self) -> Result<ReplayStats> {
        let routes = self.db.read(store::routes::list)?;
        let mut stats = ReplayStats::default();
        for route in routes {
            let applied = parse_network_cidr(&route.destination).and_then(|destination| {
                let gateway = parse_ip(&route.gateway)?;
                self.kernel.ip.add_route(&destination, gateway)
            });
            match applied {
                Ok(Outcome::Changed) => stats.applied += 1,
                Ok(Outcome::Unchanged) => stats.unchanged += 1,
                Err(e) => {
                    warn!("Failed to restore route {}: {}", route.destination, e);
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }
}
