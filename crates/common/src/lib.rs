//! netplane Common Library
//!
//! Shared types, WireGuard key handling and SQLite persistence for the
//! netplane node agent.

pub mod crypto;
pub mod db;
pub mod error;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use crypto::{generate_keypair, WgKey, WgKeyPair};
pub use db::Database;
pub use error::{Error, Result};
pub use types::*;

/// netplane version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/netplane")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}
