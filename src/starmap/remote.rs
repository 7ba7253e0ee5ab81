//! Backends whose workers live outside this process tree.
//!
//! Both bind a pull socket for results and stamp its address on every task
//! as the back URL. `Zmq` pushes tasks into a running Streamer feeding the
//! worker pools of a [`WorkerMaster`]; `Slurm` binds its own task socket
//! and launches one-shot workers as cluster jobs.

use super::backend::Backend;
use crate::config::Config;
use crate::error::{FarmError, Result};
use crate::protocol::{ResultMessage, TaskMessage};
use crate::transport::{Endpoint, PullSocket, PushSocket};
use crate::worker::launcher::{ProcessLauncher, SlurmLauncher};
use crate::worker::master::WorkerMaster;
use std::process::{Child, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long the submitter tries to reach the Streamer.
const STREAMER_TIMEOUT: Duration = Duration::from_secs(5);

/// How long finished cluster jobs get to exit before being killed.
const JOB_REAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Result side shared by both backends.
struct ResultChannel {
    results: PullSocket,
    backurl: Endpoint,
    pending: usize,
}

impl ResultChannel {
    fn bind(host: &str) -> Result<Self> {
        let results = PullSocket::bind(&Endpoint::new(host, 0))?;
        let backurl = results
            .local_endpoint()
            .cloned()
            .ok_or_else(|| FarmError::Transport("result socket has no address".into()))?;
        Ok(Self {
            results,
            backurl,
            pending: 0,
        })
    }

    fn stamp(&mut self, mut task: TaskMessage) -> TaskMessage {
        task.backurl = Some(self.backurl.clone());
        self.pending += 1;
        task
    }

    fn recv(&mut self) -> Result<Option<(ResultMessage, usize)>> {
        if self.pending == 0 {
            return Ok(None);
        }
        let received = self.results.recv_sized::<ResultMessage>()?;
        if received.is_some() {
            self.pending -= 1;
        }
        Ok(received)
    }
}

pub struct ZmqBackend {
    tasks: Option<PushSocket>,
    channel: ResultChannel,
}

impl ZmqBackend {
    /// Fails unless at least one worker pool answers and the Streamer is
    /// reachable.
    pub fn new(config: &Config) -> Result<Self> {
        let master = WorkerMaster::new(config);
        let status = master.status(None);
        if !status.iter().any(|(_, st)| st.is_running()) {
            return Err(FarmError::Worker(format!(
                "no worker pool running on {}; run `taskfarm workers start`",
                status
                    .iter()
                    .map(|(host, _)| host.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        let tasks = PushSocket::connect_timeout(&config.task_in_url(), STREAMER_TIMEOUT)
            .map_err(|e| {
                FarmError::Transport(format!(
                    "streamer not reachable on {}: {}",
                    config.task_in_url(),
                    e
                ))
            })?;
        let channel = ResultChannel::bind(&config.master_host)?;
        debug!(backurl = %channel.backurl, "zmq backend ready");
        Ok(Self {
            tasks: Some(tasks),
            channel,
        })
    }
}

impl Backend for ZmqBackend {
    fn submit(&mut self, task: TaskMessage) -> Result<usize> {
        let task = self.channel.stamp(task);
        let tasks = self
            .tasks
            .as_mut()
            .ok_or_else(|| FarmError::Transport("task socket closed".into()))?;
        tasks.send(&task)
    }

    fn recv(&mut self) -> Result<Option<(ResultMessage, usize)>> {
        self.channel.recv()
    }

    fn shutdown(&mut self) {
        // tasks already in the pools still run; their results are dropped
        self.tasks = None;
        self.channel.pending = 0;
    }
}

pub struct SlurmBackend {
    tasks: Option<PushSocket>,
    channel: ResultChannel,
    jobs: Vec<Child>,
}

impl SlurmBackend {
    /// Bind the task and result sockets and launch up to
    /// `slurm_max_jobs` workers for `num_tasks` tasks.
    pub fn new(config: &Config, num_tasks: usize) -> Result<Self> {
        let tasks = PushSocket::bind(&Endpoint::new(&config.master_host, 0))?
            .with_peer_timeout(config.slurm_startup_timeout);
        let task_url = tasks
            .local_endpoint()
            .cloned()
            .ok_or_else(|| FarmError::Transport("task socket has no address".into()))?;
        let channel = ResultChannel::bind(&config.master_host)?;

        let launcher = SlurmLauncher::new(&config.slurm_command);
        let program = config.worker_program()?.display().to_string();
        let args = vec![
            "worker".to_string(),
            "--task-url".to_string(),
            task_url.to_string(),
        ];
        let num_jobs = num_tasks.clamp(1, config.slurm_max_jobs.max(1));
        let mut jobs = Vec::with_capacity(num_jobs);
        for job_id in 0..num_jobs {
            let child = launcher
                .command(&program, &args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .spawn()
                .map_err(|e| FarmError::Launch {
                    program: config.slurm_command.clone(),
                    message: e.to_string(),
                });
            match child {
                Ok(child) => {
                    debug!(job_id, pid = child.id(), "submitted slurm job");
                    jobs.push(child);
                }
                Err(e) => {
                    reap_jobs(&mut jobs, Duration::ZERO);
                    return Err(e);
                }
            }
        }
        info!(jobs = num_jobs, task_url = %task_url, "launched slurm workers");
        Ok(Self {
            tasks: Some(tasks),
            channel,
            jobs,
        })
    }
}

impl Backend for SlurmBackend {
    fn submit(&mut self, task: TaskMessage) -> Result<usize> {
        let task = self.channel.stamp(task);
        let tasks = self
            .tasks
            .as_mut()
            .ok_or_else(|| FarmError::Transport("task socket closed".into()))?;
        tasks.send(&task)
    }

    fn recv(&mut self) -> Result<Option<(ResultMessage, usize)>> {
        self.channel.recv()
    }

    fn shutdown(&mut self) {
        // workers exit once their task connection closes
        self.tasks = None;
        self.channel.pending = 0;
        reap_jobs(&mut self.jobs, JOB_REAP_TIMEOUT);
    }

    fn abort(&mut self) {
        self.tasks = None;
        self.channel.pending = 0;
        reap_jobs(&mut self.jobs, Duration::ZERO);
    }
}

impl Drop for SlurmBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reap_jobs(jobs: &mut Vec<Child>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        jobs.retain_mut(|child| matches!(child.try_wait(), Ok(None)));
        if jobs.is_empty() || Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
    for child in jobs.iter_mut() {
        warn!(pid = child.id(), "killing slurm job still running");
        let _ = child.kill();
        let _ = child.wait();
    }
    jobs.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostCores;
    use crate::monitor::Monitor;
    use crate::protocol::TaskResult;
    use serde_json::json;
    use std::net::TcpListener;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_zmq_requires_running_pool() {
        let config = Config::default()
            .with_ports(free_port(), free_port(), free_port())
            .with_host_cores(vec![HostCores::new("127.0.0.1", 1)]);
        let err = ZmqBackend::new(&config).err().unwrap();
        assert!(err.to_string().contains("no worker pool running"));
    }

    #[test]
    fn test_result_channel_counts_pending() {
        let mut channel = ResultChannel::bind("127.0.0.1").unwrap();
        assert!(channel.recv().unwrap().is_none());

        let task = channel.stamp(TaskMessage {
            func: "double".into(),
            args: vec![json!(1)],
            task_no: 0,
            weight: 1.0,
            monitor: Monitor::new("double"),
            backurl: None,
        });
        assert_eq!(task.backurl.as_ref(), Some(&channel.backurl));

        let mut push = PushSocket::connect(&channel.backurl).unwrap();
        push.send(&ResultMessage {
            task_no: 0,
            func: "double".into(),
            result: TaskResult::Value(json!(2)),
            monitor: task.monitor.clone(),
            pid: 1,
            mem_gb: 0.0,
        })
        .unwrap();
        let (msg, size) = channel.recv().unwrap().unwrap();
        assert_eq!(msg.result, TaskResult::Value(json!(2)));
        assert!(size > 0);
        assert!(channel.recv().unwrap().is_none());
    }
}
