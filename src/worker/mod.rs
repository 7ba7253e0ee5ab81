//! Worker processes, the pools that group them, and the master that
//! manages pools across hosts.
//!
//! # Features
//!
//! - **Crash-proof workers**: every task runs behind the safely-call boundary
//! - **Liveness markers**: one file per running task, listed by `get_executing`
//! - **Pluggable launch**: local, ssh and slurm launchers
//! - **Process pool**: stdio workers owned by a single submitter

pub mod launcher;
pub mod master;
pub mod namer;
pub mod pool;
pub mod proc;
pub mod signals;
pub mod worker_main;

pub use launcher::{LocalLauncher, ProcessLauncher, SlurmLauncher, SshLauncher, launcher_for};
pub use master::WorkerMaster;
pub use namer::{NoopNamer, ProcessNamer, platform_namer};
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use worker_main::{WorkerOptions, run_socket_worker, run_stdio_worker};
