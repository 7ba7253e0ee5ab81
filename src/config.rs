//! Runtime configuration.
//!
//! A [`Config`] is built once at process start, from the environment or
//! from CLI flags, and passed by reference to [`WorkerMaster`] and
//! [`Starmap`].
//!
//! [`WorkerMaster`]: crate::worker::master::WorkerMaster
//! [`Starmap`]: crate::starmap::Starmap

use crate::error::{FarmError, Result};
use crate::memory::{MemoryLimits, MemorySize};
use crate::transport::Endpoint;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CTRL_PORT: u16 = 1909;
pub const DEFAULT_TASK_IN_PORT: u16 = 1910;
pub const DEFAULT_TASK_OUT_PORT: u16 = 1911;
pub const DEFAULT_MASTER_HOST: &str = "127.0.0.1";

/// Where the tasks of a Starmap are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Distribute {
    /// Synchronously, in the submitting process.
    No,
    /// On a pool of threads in the submitting process.
    ThreadPool,
    /// In worker subprocesses of this host.
    #[default]
    ProcessPool,
    /// Through the Streamer, on pools managed by a WorkerMaster.
    Zmq,
    /// On workers launched as cluster jobs.
    Slurm,
}

impl Distribute {
    /// Whether tasks go to externally managed worker pools.
    pub fn uses_worker_master(self) -> bool {
        matches!(self, Self::Zmq | Self::Slurm)
    }
}

impl FromStr for Distribute {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "no" => Ok(Self::No),
            "threadpool" => Ok(Self::ThreadPool),
            "processpool" => Ok(Self::ProcessPool),
            "zmq" => Ok(Self::Zmq),
            "slurm" => Ok(Self::Slurm),
            other => Err(FarmError::InvalidConfig(format!(
                "unknown distribute mode '{}'. Valid options: no, threadpool, processpool, zmq, slurm",
                other
            ))),
        }
    }
}

impl fmt::Display for Distribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::No => "no",
            Self::ThreadPool => "threadpool",
            Self::ProcessPool => "processpool",
            Self::Zmq => "zmq",
            Self::Slurm => "slurm",
        })
    }
}

/// One worker pool target: a host and the number of cores to use there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCores {
    pub host: String,
    /// Non-positive means all cores of the host.
    pub cores: i32,
}

impl HostCores {
    pub fn new(host: impl Into<String>, cores: i32) -> Self {
        Self {
            host: host.into(),
            cores,
        }
    }

    /// Parse `"127.0.0.1 -1,host2 8"`.
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        s.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                let mut parts = item.split_whitespace();
                let host = parts.next().unwrap_or_default();
                let cores = match parts.next() {
                    Some(c) => c.parse().map_err(|_| {
                        FarmError::InvalidConfig(format!("invalid core count in '{}'", item))
                    })?,
                    None => -1,
                };
                if parts.next().is_some() {
                    return Err(FarmError::InvalidConfig(format!(
                        "expected '<host> <cores>', got '{}'",
                        item
                    )));
                }
                Ok(Self::new(host, cores))
            })
            .collect()
    }

    /// Core count for a pool on this host, resolving "all cores" locally.
    pub fn resolved_cores(&self) -> usize {
        if self.cores > 0 {
            self.cores as usize
        } else {
            available_cores()
        }
    }
}

/// Number of cores of this machine.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Explicit runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub distribute: Distribute,
    pub master_host: String,
    pub ctrl_port: u16,
    pub task_in_port: u16,
    pub task_out_port: u16,
    pub host_cores: Vec<HostCores>,
    /// Path of the taskfarm binary on remote hosts.
    pub remote_program: Option<String>,
    /// Binary used to spawn local pools and workers.
    pub worker_program: Option<PathBuf>,
    /// Size of the process pool (defaults to all cores).
    pub num_cores: Option<usize>,
    pub memory: MemoryLimits,
    /// Tasks running longer than this are flagged, never preempted.
    pub task_duration_budget: Option<Duration>,
    pub slurm_command: String,
    pub slurm_max_jobs: usize,
    /// How long a slurm batch waits for its first worker.
    pub slurm_startup_timeout: Duration,
    /// Performance store written by Starmap telemetry.
    pub store_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            distribute: Distribute::default(),
            master_host: DEFAULT_MASTER_HOST.to_string(),
            ctrl_port: DEFAULT_CTRL_PORT,
            task_in_port: DEFAULT_TASK_IN_PORT,
            task_out_port: DEFAULT_TASK_OUT_PORT,
            host_cores: vec![HostCores::new(DEFAULT_MASTER_HOST, -1)],
            remote_program: None,
            worker_program: None,
            num_cores: None,
            memory: MemoryLimits::default(),
            task_duration_budget: None,
            slurm_command: "srun".to_string(),
            slurm_max_jobs: 16,
            slurm_startup_timeout: Duration::from_secs(120),
            store_path: None,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FarmError::InvalidConfig(format!("invalid value for {}: '{}'", name, raw))),
        None => Ok(None),
    }
}

impl Config {
    /// Defaults overridden by `TASKFARM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(mode) = env_var("TASKFARM_DISTRIBUTE") {
            config.distribute = mode.parse()?;
        }
        if let Some(host) = env_var("TASKFARM_MASTER_HOST") {
            config.master_host = host;
        }
        if let Some(port) = parse_env("TASKFARM_CTRL_PORT")? {
            config.ctrl_port = port;
        }
        if let Some(port) = parse_env("TASKFARM_TASK_IN_PORT")? {
            config.task_in_port = port;
        }
        if let Some(port) = parse_env("TASKFARM_TASK_OUT_PORT")? {
            config.task_out_port = port;
        }
        if let Some(list) = env_var("TASKFARM_HOST_CORES") {
            config.host_cores = HostCores::parse_list(&list)?;
        }
        config.remote_program = env_var("TASKFARM_REMOTE_PROGRAM");
        config.worker_program = env_var("TASKFARM_WORKER_PROGRAM").map(PathBuf::from);
        config.num_cores = parse_env("TASKFARM_NUM_CORES")?;
        if let Some(soft) = parse_env("TASKFARM_SOFT_MEM_LIMIT")? {
            config.memory.soft_percent = soft;
        }
        if let Some(hard) = parse_env("TASKFARM_HARD_MEM_LIMIT")? {
            config.memory.hard_percent = hard;
        }
        config.memory.ceiling = parse_env::<MemorySize>("TASKFARM_MEMORY_CEILING")?;
        config.task_duration_budget =
            parse_env::<f64>("TASKFARM_TASK_DURATION_BUDGET")?.map(Duration::from_secs_f64);
        if let Some(cmd) = env_var("TASKFARM_SLURM_COMMAND") {
            config.slurm_command = cmd;
        }
        if let Some(jobs) = parse_env("TASKFARM_SLURM_MAX_JOBS")? {
            config.slurm_max_jobs = jobs;
        }
        config.store_path = env_var("TASKFARM_STORE").map(PathBuf::from);
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.memory.soft_percent > self.memory.hard_percent {
            return Err(FarmError::InvalidConfig(format!(
                "soft memory limit {}% above hard limit {}%",
                self.memory.soft_percent, self.memory.hard_percent
            )));
        }
        if self.host_cores.is_empty() {
            return Err(FarmError::InvalidConfig("no worker hosts configured".into()));
        }
        if self.num_cores == Some(0) {
            return Err(FarmError::InvalidConfig("num_cores must be positive".into()));
        }
        Ok(())
    }

    pub fn with_distribute(mut self, distribute: Distribute) -> Self {
        self.distribute = distribute;
        self
    }

    pub fn with_master_host(mut self, host: impl Into<String>) -> Self {
        self.master_host = host.into();
        self
    }

    pub fn with_ports(mut self, ctrl: u16, task_in: u16, task_out: u16) -> Self {
        self.ctrl_port = ctrl;
        self.task_in_port = task_in;
        self.task_out_port = task_out;
        self
    }

    pub fn with_host_cores(mut self, host_cores: Vec<HostCores>) -> Self {
        self.host_cores = host_cores;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_num_cores(mut self, cores: usize) -> Self {
        self.num_cores = Some(cores);
        self
    }

    pub fn with_memory(mut self, memory: MemoryLimits) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_task_duration_budget(mut self, budget: Duration) -> Self {
        self.task_duration_budget = Some(budget);
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Where producers push tasks into the Streamer.
    pub fn task_in_url(&self) -> Endpoint {
        Endpoint::new(&self.master_host, self.task_in_port)
    }

    /// Where worker pools pull tasks from the Streamer.
    pub fn task_out_url(&self) -> Endpoint {
        Endpoint::new(&self.master_host, self.task_out_port)
    }

    /// Control endpoint of the pool on `host`.
    pub fn ctrl_url(&self, host: &str) -> Endpoint {
        Endpoint::new(host, self.ctrl_port)
    }

    /// Program spawned for local pools and workers.
    pub fn worker_program(&self) -> Result<PathBuf> {
        match &self.worker_program {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    /// Program invoked on a remote host.
    pub fn remote_program(&self) -> String {
        self.remote_program
            .clone()
            .unwrap_or_else(|| "taskfarm".to_string())
    }

    /// Size of the local process pool.
    pub fn pool_size(&self) -> usize {
        self.num_cores.unwrap_or_else(available_cores).max(1)
    }
}
