//! SQLite database for netplane state persistence
//!
//! One writer connection carries every mutation; a pool of read-only
//! connections serves queries so readers never queue behind a write
//! transaction that is waiting on the kernel.

use crate::Result;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl Database {
    /// Open or create the database at path with a reader pool sized to the
    /// available parallelism.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let readers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .max(4);
        Self::open_with_readers(path, readers)
    }

    /// Open or create the database with an explicit reader pool size
    pub fn open_with_readers(path: impl AsRef<Path>, readers: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = Connection::open(&path)?;
        writer.busy_timeout(BUSY_TIMEOUT)?;

        // WAL lets the read pool see committed state while a write is open
        writer.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA temp_store=MEMORY; PRAGMA foreign_keys=ON;",
        )?;
        init_schema(&writer)?;

        let readers = (0..readers.max(1))
            .map(|_| {
                let conn = Connection::open_with_flags(
                    &path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.execute_batch("PRAGMA query_only=ON;")?;
                Ok(Mutex::new(conn))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Opened database at {:?} ({} read connections)",
            path,
            readers.len()
        );

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                path,
                writer: Mutex::new(writer),
                readers,
                next_reader: AtomicUsize::new(0),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Run a read-only query on a pooled connection
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let readers = &self.inner.readers;
        let start = self.inner.next_reader.fetch_add(1, Ordering::Relaxed) % readers.len();

        // Prefer an idle connection, otherwise queue on the round-robin pick.
        for offset in 0..readers.len() {
            if let Some(conn) = readers[(start + offset) % readers.len()].try_lock() {
                return f(&conn);
            }
        }
        let conn = readers[start].lock();
        f(&conn)
    }

    /// Run a single autocommit statement batch on the writer connection
    pub fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.inner.writer.lock();
        f(&conn)
    }

    /// Run `f` inside an immediate write transaction.
    ///
    /// The transaction commits only when `f` returns `Ok`; any error rolls it
    /// back, so callers can interleave kernel calls with row changes and rely
    /// on the row changes disappearing when the kernel call fails.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.inner.writer.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                debug!("Rolling back transaction: {}", e);
                // Dropping the transaction rolls back; surface the original error.
                drop(tx);
                Err(e)
            }
        }
    }
}

/// Initialize database schema
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Singleton node network configuration
        CREATE TABLE IF NOT EXISTS node_config (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            role TEXT NOT NULL,
            wg_private_key TEXT NOT NULL,
            wg_address TEXT NOT NULL,
            wg_listen_port INTEGER NOT NULL,
            wg_mtu INTEGER NOT NULL,
            bridge_subnet TEXT NOT NULL,
            bridge_gateway TEXT NOT NULL,
            bridge_id TEXT,
            bridge_mesh_interface TEXT,
            coordinator_public_key TEXT,
            coordinator_endpoint TEXT,
            coordinator_allowed_ips TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Mesh peers
        CREATE TABLE IF NOT EXISTS wireguard_peers (
            public_key TEXT PRIMARY KEY,
            allowed_ips TEXT NOT NULL,
            endpoint_ip TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Static routes
        CREATE TABLE IF NOT EXISTS static_routes (
            destination TEXT PRIMARY KEY,
            gateway TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        -- Ad-hoc firewall rules
        CREATE TABLE IF NOT EXISTS firewall_rules (
            uuid TEXT PRIMARY KEY,
            table_name TEXT NOT NULL,
            chain TEXT NOT NULL,
            args TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_firewall_rules_chain ON firewall_rules(table_name, chain);
        "#,
    )?;

    debug!("Database schema initialized");
    Ok(())
}
