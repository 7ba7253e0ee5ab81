//! taskfarm - distributed task execution and instrumentation
//!
//! A worker-pool control plane, a task-distribution façade ([`Starmap`])
//! over in-process, process-pool, worker-pool and cluster backends, and a
//! hierarchical performance [`Monitor`] persisted to a SQLite store.
//!
//! [`Starmap`]: starmap::Starmap
//! [`Monitor`]: monitor::Monitor

pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod memory;
pub mod monitor;
pub mod output;
pub mod paths;
pub mod protocol;
pub mod starmap;
pub mod store;
pub mod streamer;
pub mod task;
pub mod theme;
pub mod transport;
pub mod version;
pub mod worker;

pub use config::{Config, Distribute};
pub use error::{FarmError, Result};
