//! taskfarm - distributed task execution and worker-pool control

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use taskfarm::cli::{self, Cli, Commands, Verbosity, WorkerAction};
use taskfarm::config::Config;
use taskfarm::logging::{self, LogConfig, ProcessRole};
use taskfarm::output::{self, format_host_list, format_status_line};
use taskfarm::starmap::Starmap;
use taskfarm::store::PerfStore;
use taskfarm::streamer::Streamer;
use taskfarm::worker::worker_main::prepare_worker_process;
use taskfarm::worker::{
    WorkerMaster, WorkerOptions, WorkerPool, WorkerPoolConfig, platform_namer, run_socket_worker,
    run_stdio_worker,
};
use taskfarm::{diagnostics, theme};
use tracing::Level;

/// Parses the command line, runs the selected command and prints the error
/// chain with colored headers on failure.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Workers(args) => cmd_workers(&cli, args),
        Commands::Streamer => cmd_streamer(&cli),
        Commands::Perf(args) => cmd_perf(args),
        Commands::Pool(args) => cmd_pool(&cli, args),
        Commands::Worker(args) => cmd_worker(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let role = match cli.command {
        Commands::Pool(_) => ProcessRole::Pool,
        Commands::Worker(_) => ProcessRole::Worker,
        Commands::Streamer => ProcessRole::Streamer,
        _ => ProcessRole::Operator,
    };
    let level = match cli.verbosity() {
        _ if cli.quiet => Level::ERROR,
        Verbosity::Normal => Level::WARN,
        Verbosity::Info => Level::INFO,
        Verbosity::Debug => Level::DEBUG,
    };
    let mut config = LogConfig::for_role(role).with_level(level);
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    logging::init(config.with_env_overrides());
}

fn farm_config(cli: &Cli) -> Result<Config> {
    cli.farm.to_config().context("invalid configuration")
}

fn cmd_workers(cli: &Cli, args: &cli::WorkersArgs) -> Result<()> {
    let config = farm_config(cli)?;

    if args.action != WorkerAction::Debug && !config.distribute.uses_worker_master() {
        println!(
            "Worker pools are only managed with --distribute zmq or slurm (current: {})",
            config.distribute
        );
        return Ok(());
    }

    let mut master = WorkerMaster::new(&config);
    match args.action {
        WorkerAction::Debug => return cmd_debug(&config, args),
        WorkerAction::Start => {
            let started: Vec<String> = master.start().into_iter().map(|hc| hc.host).collect();
            println!("starting {}", format_host_list(&started));
        }
        WorkerAction::Stop => println!("stopped {}", format_host_list(&master.stop())),
        WorkerAction::Kill => println!("killed {}", format_host_list(&master.kill())),
        WorkerAction::Status => {
            for (host, status) in master.status(None) {
                println!("{}", format_status_line(&host, status));
            }
        }
        WorkerAction::Restart => {
            let started: Vec<String> = master.restart().into_iter().map(|hc| hc.host).collect();
            println!("restarted {}", format_host_list(&started));
        }
        WorkerAction::Wait => {
            let timeout = Duration::from_secs_f64(args.timeout.max(0.0));
            for (host, status) in master.wait(timeout)? {
                println!("{}", format_status_line(&host, status));
            }
        }
        WorkerAction::Inspect => {
            for (host, tasks) in master.inspect() {
                println!("{}: {:?}", host, tasks);
            }
        }
    }
    Ok(())
}

/// Arguments of the i-th diagnostic task out of `n`.
fn debug_args(task: &str, i: usize, n: usize) -> Vec<Value> {
    match task {
        "_wakeup" => vec![json!(0.5)],
        "fail" | "exhaust" => vec![json!(i), json!(n / 2)],
        _ => vec![json!(i)],
    }
}

fn cmd_debug(config: &Config, args: &cli::WorkersArgs) -> Result<()> {
    let registry = Arc::new(diagnostics::registry());
    if !registry.contains(&args.task) {
        anyhow::bail!(
            "unknown diagnostic task '{}'; available: {}",
            args.task,
            registry.names().join(", ")
        );
    }
    let n = args.num_tasks;
    let task_args: Vec<Vec<Value>> = if args.task == "fanout" {
        vec![vec![json!(n)]]
    } else {
        (0..n).map(|i| debug_args(&args.task, i, n)).collect()
    };

    let smap = Starmap::new(Arc::clone(&registry), args.task.as_str(), task_args, config);
    if args.task == "_wakeup" {
        let pids: BTreeSet<u64> = smap
            .into_iter()
            .map(|r| r.map(|v| v.as_u64().unwrap_or(0)))
            .collect::<taskfarm::error::Result<_>>()?;
        println!("pids: {:?}", pids);
    } else {
        let sum = smap.reduce(|acc, v| acc + v.as_i64().unwrap_or(0), 0i64)?;
        println!("sum: {}", sum);
    }
    Ok(())
}

fn cmd_streamer(cli: &Cli) -> Result<()> {
    let config = farm_config(cli)?;
    let relayed = Streamer::from_config(&config).run()?;
    println!("relayed {} task(s)", relayed);
    Ok(())
}

fn cmd_perf(args: &cli::PerfArgs) -> Result<()> {
    let store = PerfStore::open_readonly(&args.store)
        .with_context(|| format!("cannot open performance store {}", args.store.display()))?;
    let view = store.performance_view()?;
    let slow = store.slow_tasks(args.task.as_deref(), args.slow_factor)?;
    output::print_perf(&view, &slow, args.format.into(), args.ascii)
}

fn cmd_pool(cli: &Cli, args: &cli::PoolArgs) -> Result<()> {
    let config = farm_config(cli)?;
    let pool_config =
        WorkerPoolConfig::new(args.ctrl_url.clone(), args.task_url.clone(), args.num_workers)?
            .with_program(config.worker_program()?);
    WorkerPool::new(pool_config).start()?;
    Ok(())
}

fn cmd_worker(args: &cli::WorkerArgs) -> Result<()> {
    prepare_worker_process();
    let registry = diagnostics::registry();
    let namer = platform_namer();
    match &args.task_url {
        Some(task_url) => {
            let options = WorkerOptions {
                task_url: task_url.clone(),
                executing_dir: args.executing_dir.clone(),
                reconnect: args.reconnect,
            };
            run_socket_worker(&registry, &options, namer.as_ref())?;
        }
        None => run_stdio_worker(&registry, namer.as_ref())?,
    }
    Ok(())
}
