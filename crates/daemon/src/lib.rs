//! netplane daemon library
//!
//! Configuration, kernel interface adapters and the network reconciler
//! behind the `netplaned` binary.

pub mod config;
pub mod kernel;
pub mod lock;
pub mod reconciler;

pub use config::DaemonConfig;
pub use kernel::KernelHandles;
pub use lock::StoreLock;
pub use reconciler::{BootReport, DriftDetector, NetworkReconciler, TeardownReport};
