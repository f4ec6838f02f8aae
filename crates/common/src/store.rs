//! Typed queries over the netplane schema
//!
//! Every function takes a plain `&Connection` so the same query runs on a
//! pooled reader, the writer, or inside an open `Transaction` (which derefs
//! to `Connection`).

use crate::types::*;
use crate::{Error, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// Node configuration
// ============================================================================

pub mod node {
    use super::*;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<NodeNetworkConfig> {
        let role: NodeRole = row.get::<_, String>(0)?.parse().map_err(|e: Error| {
            rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
        })?;
        let coordinator = match row.get::<_, Option<String>>(8)? {
            Some(public_key) => Some(CoordinatorLink {
                public_key,
                endpoint: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                allowed_ips: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            }),
            None => None,
        };
        Ok(NodeNetworkConfig {
            role,
            wireguard: WireguardSettings {
                private_key: row.get(1)?,
                address: row.get(2)?,
                listen_port: row.get(3)?,
                mtu: row.get(4)?,
            },
            bridge: BridgeSettings {
                subnet: row.get(5)?,
                gateway: row.get(6)?,
                bridge_id: row.get(7)?,
                mesh_interface: row.get(11)?,
            },
            coordinator,
        })
    }

    /// Load the node configuration, if provisioned
    pub fn get(conn: &Connection) -> Result<Option<NodeNetworkConfig>> {
        Ok(conn
            .query_row(
                "SELECT role, wg_private_key, wg_address, wg_listen_port, wg_mtu,
                        bridge_subnet, bridge_gateway, bridge_id,
                        coordinator_public_key, coordinator_endpoint, coordinator_allowed_ips,
                        bridge_mesh_interface
                 FROM node_config WHERE id = 1",
                [],
                from_row,
            )
            .optional()?)
    }

    /// Load the node configuration or fail with `NotProvisioned`
    pub fn require(conn: &Connection) -> Result<NodeNetworkConfig> {
        get(conn)?.ok_or(Error::NotProvisioned)
    }

    /// Store the configuration for the first time
    pub fn insert(conn: &Connection, config: &NodeNetworkConfig) -> Result<()> {
        if get(conn)?.is_some() {
            return Err(Error::already_exists("node_config", "1"));
        }
        let ts = now();
        let coordinator = config.coordinator.as_ref();
        conn.execute(
            "INSERT INTO node_config (id, role, wg_private_key, wg_address, wg_listen_port, wg_mtu,
                 bridge_subnet, bridge_gateway, bridge_id, bridge_mesh_interface,
                 coordinator_public_key, coordinator_endpoint, coordinator_allowed_ips,
                 created_at, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                config.role.to_string(),
                config.wireguard.private_key,
                config.wireguard.address,
                config.wireguard.listen_port,
                config.wireguard.mtu,
                config.bridge.subnet,
                config.bridge.gateway,
                config.bridge.bridge_id,
                config.bridge.mesh_interface,
                coordinator.map(|c| c.public_key.as_str()),
                coordinator.map(|c| c.endpoint.as_str()),
                coordinator.map(|c| c.allowed_ips.as_str()),
                ts,
            ],
        )?;
        Ok(())
    }

    /// Record the bridge identity most recently observed from the runtime and
    /// the mesh interface its forwarding rules were installed against
    pub fn set_bridge_id(conn: &Connection, bridge_id: &str, mesh_interface: &str) -> Result<()> {
        let rows = conn.execute(
            "UPDATE node_config SET bridge_id = ?1, bridge_mesh_interface = ?2, updated_at = ?3
             WHERE id = 1",
            params![bridge_id, mesh_interface, now()],
        )?;
        if rows == 0 {
            return Err(Error::NotProvisioned);
        }
        Ok(())
    }

    /// Forget the recorded bridge, after its network and rules were removed
    pub fn clear_bridge_id(conn: &Connection) -> Result<()> {
        let rows = conn.execute(
            "UPDATE node_config SET bridge_id = NULL, bridge_mesh_interface = NULL, updated_at = ?1
             WHERE id = 1",
            params![now()],
        )?;
        if rows == 0 {
            return Err(Error::NotProvisioned);
        }
        Ok(())
    }
}

// ============================================================================
// WireGuard peers
// ============================================================================

pub mod peers {
    use super::*;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<WireguardPeer> {
        Ok(WireguardPeer {
            public_key: row.get(0)?,
            allowed_ips: row.get(1)?,
            endpoint_ip: row.get(2)?,
        })
    }

    pub fn list(conn: &Connection) -> Result<Vec<WireguardPeer>> {
        let mut stmt = conn.prepare(
            "SELECT public_key, allowed_ips, endpoint_ip FROM wireguard_peers ORDER BY created_at, public_key",
        )?;
        let rows = stmt.query_map([], from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get(conn: &Connection, public_key: &str) -> Result<Option<WireguardPeer>> {
        Ok(conn
            .query_row(
                "SELECT public_key, allowed_ips, endpoint_ip FROM wireguard_peers WHERE public_key = ?1",
                params![public_key],
                from_row,
            )
            .optional()?)
    }

    pub fn exists(conn: &Connection, public_key: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM wireguard_peers WHERE public_key = ?1",
            params![public_key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn insert(conn: &Connection, peer: &WireguardPeer) -> Result<()> {
        let ts = now();
        conn.execute(
            "INSERT INTO wireguard_peers (public_key, allowed_ips, endpoint_ip, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![peer.public_key, peer.allowed_ips, peer.endpoint_ip, ts],
        )?;
        Ok(())
    }

    /// Returns false when no such peer exists
    pub fn set_endpoint(conn: &Connection, public_key: &str, endpoint_ip: &str) -> Result<bool> {
        let rows = conn.execute(
            "UPDATE wireguard_peers SET endpoint_ip = ?1, updated_at = ?2 WHERE public_key = ?3",
            params![endpoint_ip, now(), public_key],
        )?;
        Ok(rows > 0)
    }

    pub fn delete(conn: &Connection, public_key: &str) -> Result<bool> {
        let rows = conn.execute(
            "DELETE FROM wireguard_peers WHERE public_key = ?1",
            params![public_key],
        )?;
        Ok(rows > 0)
    }
}

// ============================================================================
// Static routes
// ============================================================================

pub mod routes {
    use super::*;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<StaticRoute> {
        Ok(StaticRoute {
            destination: row.get(0)?,
            gateway: row.get(1)?,
        })
    }

    pub fn list(conn: &Connection) -> Result<Vec<StaticRoute>> {
        let mut stmt = conn
            .prepare("SELECT destination, gateway FROM static_routes ORDER BY created_at, destination")?;
        let rows = stmt.query_map([], from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get(conn: &Connection, destination: &str) -> Result<Option<StaticRoute>> {
        Ok(conn
            .query_row(
                "SELECT destination, gateway FROM static_routes WHERE destination = ?1",
                params![destination],
                from_row,
            )
            .optional()?)
    }

    pub fn insert(conn: &Connection, route: &StaticRoute) -> Result<()> {
        conn.execute(
            "INSERT INTO static_routes (destination, gateway, created_at) VALUES (?1, ?2, ?3)",
            params![route.destination, route.gateway, now()],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, destination: &str) -> Result<bool> {
        let rows = conn.execute(
            "DELETE FROM static_routes WHERE destination = ?1",
            params![destination],
        )?;
        Ok(rows > 0)
    }
}

// ============================================================================
// Firewall rules
// ============================================================================

pub mod rules {
    use super::*;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }

    fn parse((uuid, table, chain, args): (String, String, String, String)) -> Result<FirewallRule> {
        Ok(FirewallRule {
            uuid,
            table,
            chain,
            args: serde_json::from_str(&args)?,
        })
    }

    /// All rules in insertion order. A row whose args column does not parse
    /// is returned as an error in its slot so replay can skip just that row.
    pub fn list(conn: &Connection) -> Result<Vec<Result<FirewallRule>>> {
        let mut stmt = conn.prepare(
            "SELECT uuid, table_name, chain, args FROM firewall_rules ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map([], from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(parse(row?));
        }
        Ok(results)
    }

    pub fn get(conn: &Connection, uuid: &str) -> Result<Option<FirewallRule>> {
        let row = conn
            .query_row(
                "SELECT uuid, table_name, chain, args FROM firewall_rules WHERE uuid = ?1",
                params![uuid],
                from_row,
            )
            .optional()?;
        row.map(parse).transpose()
    }

    pub fn insert(conn: &Connection, rule: &FirewallRule) -> Result<()> {
        conn.execute(
            "INSERT INTO firewall_rules (uuid, table_name, chain, args, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                rule.uuid,
                rule.table,
                rule.chain,
                serde_json::to_string(&rule.args)?,
                now()
            ],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, uuid: &str) -> Result<bool> {
        let rows = conn.execute("DELETE FROM firewall_rules WHERE uuid = ?1", params![uuid])?;
        Ok(rows > 0)
    }
}
