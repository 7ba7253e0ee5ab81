//! Command-line interface definitions using clap.

use crate::config::{
    Config, DEFAULT_CTRL_PORT, DEFAULT_MASTER_HOST, DEFAULT_TASK_IN_PORT, DEFAULT_TASK_OUT_PORT,
    Distribute, HostCores,
};
use crate::logging::LogFormat;
use crate::memory::{DEFAULT_HARD_PERCENT, DEFAULT_SOFT_PERCENT, MemoryLimits, MemorySize};
use crate::output::OutputFormat;
use crate::paths;
use crate::transport::Endpoint;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Distributed task execution and worker-pool control.
#[derive(Parser, Debug)]
#[command(name = "taskfarm")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub farm: FarmArgs,

    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(
        long,
        global = true,
        env = "NO_COLOR",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub no_color: bool,

    /// Log format: pretty, compact or json.
    #[arg(long, global = true, env = "TASKFARM_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true, env = "TASKFARM_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Settings that make up the runtime [`Config`].
#[derive(Args, Debug, Clone)]
pub struct FarmArgs {
    /// Where tasks run: no, threadpool, processpool, zmq or slurm.
    #[arg(long, global = true, env = "TASKFARM_DISTRIBUTE", default_value = "processpool", value_parser = parse_distribute)]
    pub distribute: Distribute,

    /// Host running the Streamer.
    #[arg(long, global = true, env = "TASKFARM_MASTER_HOST", default_value = DEFAULT_MASTER_HOST)]
    pub master_host: String,

    /// Control port of the worker pools.
    #[arg(long, global = true, env = "TASKFARM_CTRL_PORT", default_value_t = DEFAULT_CTRL_PORT)]
    pub ctrl_port: u16,

    /// Port where submitters push tasks into the Streamer.
    #[arg(long, global = true, env = "TASKFARM_TASK_IN_PORT", default_value_t = DEFAULT_TASK_IN_PORT)]
    pub task_in_port: u16,

    /// Port where worker pools pull tasks from the Streamer.
    #[arg(long, global = true, env = "TASKFARM_TASK_OUT_PORT", default_value_t = DEFAULT_TASK_OUT_PORT)]
    pub task_out_port: u16,

    /// Worker hosts and cores, e.g. "127.0.0.1 -1,node2 8".
    #[arg(long, global = true, env = "TASKFARM_HOST_CORES")]
    pub host_cores: Option<String>,

    /// Path of the taskfarm binary on remote hosts.
    #[arg(long, global = true, env = "TASKFARM_REMOTE_PROGRAM")]
    pub remote_program: Option<String>,

    /// Binary spawned for local pools and workers.
    #[arg(long, global = true, env = "TASKFARM_WORKER_PROGRAM", hide = true)]
    pub worker_program: Option<PathBuf>,

    /// Size of the process pool (defaults to all cores).
    #[arg(long, global = true, env = "TASKFARM_NUM_CORES", value_parser = clap::value_parser!(u64).range(1..))]
    pub num_cores: Option<u64>,

    /// Warn above this percentage of used memory.
    #[arg(long, global = true, env = "TASKFARM_SOFT_MEM_LIMIT", default_value_t = DEFAULT_SOFT_PERCENT)]
    pub soft_mem_limit: f64,

    /// Abort above this percentage of used memory.
    #[arg(long, global = true, env = "TASKFARM_HARD_MEM_LIMIT", default_value_t = DEFAULT_HARD_PERCENT)]
    pub hard_mem_limit: f64,

    /// Largest accepted allocation estimate (e.g. "32G").
    #[arg(long, global = true, env = "TASKFARM_MEMORY_CEILING", value_parser = parse_memory_size)]
    pub memory_ceiling: Option<MemorySize>,

    /// Seconds after which a task is flagged as slow.
    #[arg(long, global = true, env = "TASKFARM_TASK_DURATION_BUDGET")]
    pub task_duration_budget: Option<f64>,

    /// Command used to submit cluster jobs.
    #[arg(long, global = true, env = "TASKFARM_SLURM_COMMAND", default_value = "srun")]
    pub slurm_command: String,

    /// Maximum number of cluster jobs per batch.
    #[arg(long, global = true, env = "TASKFARM_SLURM_MAX_JOBS", default_value_t = 16)]
    pub slurm_max_jobs: usize,

    /// Performance store written by task telemetry.
    #[arg(long = "store", global = true, env = "TASKFARM_STORE")]
    pub store_path: Option<PathBuf>,
}

fn parse_distribute(s: &str) -> Result<Distribute, String> {
    s.parse().map_err(|e: crate::error::FarmError| e.to_string())
}

fn parse_memory_size(s: &str) -> Result<MemorySize, String> {
    s.parse().map_err(|e: crate::memory::MemoryError| e.to_string())
}

fn parse_endpoint(s: &str) -> Result<Endpoint, String> {
    s.parse().map_err(|e: crate::error::FarmError| e.to_string())
}

impl FarmArgs {
    /// Build and validate the runtime configuration.
    pub fn to_config(&self) -> crate::error::Result<Config> {
        let defaults = Config::default();
        let host_cores = match &self.host_cores {
            Some(list) => HostCores::parse_list(list)?,
            None => defaults.host_cores,
        };
        let config = Config {
            distribute: self.distribute,
            master_host: self.master_host.clone(),
            ctrl_port: self.ctrl_port,
            task_in_port: self.task_in_port,
            task_out_port: self.task_out_port,
            host_cores,
            remote_program: self.remote_program.clone(),
            worker_program: self.worker_program.clone(),
            num_cores: self.num_cores.map(|n| n as usize),
            memory: MemoryLimits {
                soft_percent: self.soft_mem_limit,
                hard_percent: self.hard_mem_limit,
                ceiling: self.memory_ceiling,
            },
            task_duration_budget: self
                .task_duration_budget
                .filter(|secs| *secs > 0.0)
                .map(Duration::from_secs_f64),
            slurm_command: self.slurm_command.clone(),
            slurm_max_jobs: self.slurm_max_jobs,
            slurm_startup_timeout: defaults.slurm_startup_timeout,
            store_path: self.store_path.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the worker pools of the configured hosts.
    Workers(WorkersArgs),

    /// Relay tasks from submitters to worker pools.
    Streamer,

    /// Show the performance data of a store.
    Perf(PerfArgs),

    /// Run a worker pool (started by `workers start`).
    #[command(hide = true)]
    Pool(PoolArgs),

    /// Run a worker (started by pools and process pools).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerAction {
    Start,
    Stop,
    Status,
    Restart,
    Wait,
    Kill,
    /// List the tasks running on each pool.
    Inspect,
    /// Run a diagnostic batch with the configured distribution mode.
    Debug,
}

/// Arguments for the workers command.
#[derive(Parser, Debug)]
pub struct WorkersArgs {
    #[arg(value_enum)]
    pub action: WorkerAction,

    /// Seconds `wait` waits for every pool to come up.
    #[arg(long, default_value_t = 60.0)]
    pub timeout: f64,

    /// Diagnostic task run by `debug`.
    #[arg(long, default_value = "double")]
    pub task: String,

    /// Number of tasks submitted by `debug`.
    #[arg(short = 'n', long, default_value_t = 10)]
    pub num_tasks: usize,
}

/// Output format argument.
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormatArg {
    /// Colored table output.
    #[default]
    Table,
    /// JSON output.
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Table => OutputFormat::Table,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

/// Arguments for the perf command.
#[derive(Parser, Debug)]
pub struct PerfArgs {
    /// Performance store to read (defaults to the one in the data directory).
    #[arg(default_value_os_t = paths::get_perf_store_path())]
    pub store: PathBuf,

    /// Report tasks slower than this multiple of their batch mean.
    #[arg(long, default_value_t = 2.0)]
    pub slow_factor: f64,

    /// Only report slow tasks of this name.
    #[arg(long)]
    pub task: Option<String>,

    #[arg(short, long, value_enum, default_value_t = OutputFormatArg::Table)]
    pub format: OutputFormatArg,

    /// Use ASCII table borders.
    #[arg(long)]
    pub ascii: bool,
}

/// Arguments for the internal pool command.
#[derive(Parser, Debug)]
pub struct PoolArgs {
    #[arg(long, value_parser = parse_endpoint)]
    pub ctrl_url: Endpoint,

    #[arg(long, value_parser = parse_endpoint)]
    pub task_url: Endpoint,

    /// Number of workers; non-positive means one per core.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub num_workers: i32,
}

/// Arguments for the internal worker command.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Pull tasks from this URL; without it tasks are read from stdin.
    #[arg(long, value_parser = parse_endpoint)]
    pub task_url: Option<Endpoint>,

    /// Directory of liveness markers.
    #[arg(long = "executing")]
    pub executing_dir: Option<PathBuf>,

    /// Keep reconnecting when the task source goes away.
    #[arg(long)]
    pub reconnect: bool,
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Default: warnings and results.
    Normal,
    /// -v: include progress info.
    Info,
    /// -vv: include debug info.
    Debug,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v flags.
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from(self.verbose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serial_test::serial;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    #[serial]
    fn test_no_color_env_accepts_any_value() {
        // SAFETY: serialized with the other environment-reading tests
        unsafe { std::env::set_var("NO_COLOR", "1") };
        let colored_off = Cli::try_parse_from(["taskfarm", "workers", "status"]);
        unsafe { std::env::set_var("NO_COLOR", "0") };
        let colored_on = Cli::try_parse_from(["taskfarm", "workers", "status"]);
        unsafe { std::env::remove_var("NO_COLOR") };

        assert!(colored_off.unwrap().no_color);
        assert!(!colored_on.unwrap().no_color);
        let flag = Cli::try_parse_from(["taskfarm", "--no-color", "perf"]).unwrap();
        assert!(flag.no_color);
    }

    #[test]
    #[serial]
    fn test_workers_command() {
        let args = Cli::try_parse_from(["taskfarm", "workers", "status"]).unwrap();
        match args.command {
            Commands::Workers(w) => {
                assert_eq!(w.action, WorkerAction::Status);
                assert_eq!(w.timeout, 60.0);
                assert_eq!(w.num_tasks, 10);
            }
            _ => panic!("Expected Workers command"),
        }
    }

    #[test]
    #[serial]
    fn test_global_flags_build_config() {
        let args = Cli::try_parse_from([
            "taskfarm",
            "--distribute",
            "zmq",
            "--ctrl-port",
            "2909",
            "--host-cores",
            "127.0.0.1 2,node2 8",
            "workers",
            "start",
        ])
        .unwrap();
        let config = args.farm.to_config().unwrap();
        assert_eq!(config.distribute, Distribute::Zmq);
        assert_eq!(config.ctrl_port, 2909);
        assert_eq!(
            config.host_cores,
            vec![HostCores::new("127.0.0.1", 2), HostCores::new("node2", 8)]
        );
    }

    #[test]
    #[serial]
    fn test_invalid_distribute() {
        assert!(Cli::try_parse_from(["taskfarm", "--distribute", "celery", "streamer"]).is_err());
    }

    #[test]
    #[serial]
    fn test_pool_command_negative_workers() {
        let args = Cli::try_parse_from([
            "taskfarm",
            "pool",
            "--ctrl-url",
            "tcp://127.0.0.1:1909",
            "--task-url",
            "tcp://127.0.0.1:1911",
            "--num-workers",
            "-1",
        ])
        .unwrap();
        match args.command {
            Commands::Pool(p) => {
                assert_eq!(p.num_workers, -1);
                assert_eq!(p.ctrl_url, Endpoint::new("127.0.0.1", 1909));
            }
            _ => panic!("Expected Pool command"),
        }
    }

    #[test]
    #[serial]
    fn test_worker_command_defaults_to_stdio() {
        let args = Cli::try_parse_from(["taskfarm", "worker"]).unwrap();
        match args.command {
            Commands::Worker(w) => {
                assert!(w.task_url.is_none());
                assert!(!w.reconnect);
            }
            _ => panic!("Expected Worker command"),
        }
    }
}
