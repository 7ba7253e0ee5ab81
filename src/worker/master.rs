//! Control-plane client for the worker pools of a cluster.
//!
//! Only [`WorkerMaster::wait`] fails; every other operation is best effort
//! and reports what it did, logging whatever went wrong.

use super::launcher::launcher_for;
use super::pool::REAP_TIMEOUT;
use crate::config::{Config, HostCores};
use crate::error::{FarmError, Result};
use crate::protocol::{ControlCommand, ControlReply, HostStatus};
use crate::transport::RequestSocket;
use std::net::TcpStream;
use std::process::{Child, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Timeout of a liveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout of a control command round trip.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const WAIT_POLL: Duration = Duration::from_secs(1);

/// How long a restart waits for stopped pools to release their port.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a stopped pool gets to reap its workers and clean up before it
/// is sent SIGTERM. Longer than the pool's own reap timeout.
const POOL_EXIT_TIMEOUT: Duration = REAP_TIMEOUT.saturating_add(Duration::from_secs(2));

const EXIT_POLL: Duration = Duration::from_millis(50);

pub struct WorkerMaster {
    config: Config,
    /// Pool processes started by this master, by host.
    spawned: Vec<(String, Child)>,
}

impl WorkerMaster {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            spawned: Vec::new(),
        }
    }

    pub fn host_cores(&self) -> &[HostCores] {
        &self.config.host_cores
    }

    fn hosts(&self) -> impl Iterator<Item = &str> {
        self.config.host_cores.iter().map(|hc| hc.host.as_str())
    }

    /// Plain reachability of each target's control port.
    pub fn status(&self, host: Option<&str>) -> Vec<(String, HostStatus)> {
        self.hosts()
            .filter(|h| host.is_none_or(|wanted| wanted == *h))
            .map(|h| (h.to_string(), self.probe(h)))
            .collect()
    }

    fn probe(&self, host: &str) -> HostStatus {
        let url = self.config.ctrl_url(host);
        let reachable = url
            .socket_addr()
            .ok()
            .is_some_and(|addr| TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok());
        if reachable {
            HostStatus::Running
        } else {
            HostStatus::NotRunning
        }
    }

    fn is_running(&self, host: &str) -> bool {
        self.probe(host).is_running()
    }

    /// Launch a pool on every target not already running.
    ///
    /// Returns the targets a launch was attempted for.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Vec<HostCores> {
        let mut attempted = Vec::new();
        let targets = self.config.host_cores.clone();
        for target in targets {
            if self.is_running(&target.host) {
                debug!(host = %target.host, "pool already running");
                continue;
            }
            match self.launch(&target) {
                Ok(child) => {
                    info!(host = %target.host, cores = target.cores, pid = child.id(), "starting pool");
                    self.spawned.push((target.host.clone(), child));
                }
                Err(e) => error!(host = %target.host, error = %e, "cannot start pool"),
            }
            attempted.push(target);
        }
        attempted
    }

    fn launch(&self, target: &HostCores) -> Result<Child> {
        let launcher = launcher_for(&target.host);
        let program = if launcher.is_local() {
            self.config.worker_program()?.display().to_string()
        } else {
            self.config.remote_program()
        };
        let args = vec![
            "pool".to_string(),
            "--ctrl-url".to_string(),
            self.config.ctrl_url(&target.host).to_string(),
            "--task-url".to_string(),
            self.config.task_out_url().to_string(),
            "--num-workers".to_string(),
            target.cores.to_string(),
        ];
        launcher
            .command(&program, &args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| FarmError::Launch {
                program,
                message: e.to_string(),
            })
    }

    /// Send one command to the pool on `host`.
    pub fn send_command(&self, host: &str, command: ControlCommand) -> Result<ControlReply> {
        let url = self.config.ctrl_url(host);
        let mut socket = RequestSocket::connect(&url, Some(COMMAND_TIMEOUT))?;
        socket.request(&command)
    }

    fn signal_running(&self, command: ControlCommand) -> Vec<String> {
        let mut signaled = Vec::new();
        for host in self.hosts() {
            if !self.is_running(host) {
                continue;
            }
            match self.send_command(host, command) {
                Ok(reply) => debug!(host, %command, ?reply, "pool answered"),
                Err(e) => warn!(host, %command, error = %e, "pool did not answer"),
            }
            signaled.push(host.to_string());
        }
        signaled
    }

    /// Stop every running pool and reap the pools this master started.
    #[instrument(skip(self))]
    pub fn stop(&mut self) -> Vec<String> {
        let signaled = self.signal_running(ControlCommand::Stop);
        let deadline = Instant::now() + POOL_EXIT_TIMEOUT;
        for (host, mut child) in self.spawned.drain(..) {
            if !exited_by(&mut child, deadline) {
                warn!(host = %host, pid = child.id(), "pool still running, terminating it");
                let pid = nix::unistd::Pid::from_raw(child.id() as i32);
                let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
            }
            if let Err(e) = child.wait() {
                warn!(host = %host, error = %e, "cannot reap pool");
            }
        }
        signaled
    }

    /// Kill every running pool and the pools this master started.
    #[instrument(skip(self))]
    pub fn kill(&mut self) -> Vec<String> {
        let signaled = self.signal_running(ControlCommand::Kill);
        for (host, mut child) in self.spawned.drain(..) {
            let _ = child.kill();
            if let Err(e) = child.wait() {
                warn!(host = %host, error = %e, "cannot reap pool");
            }
        }
        signaled
    }

    /// Poll [`status`](Self::status) once per second until every target is
    /// running.
    pub fn wait(&self, timeout: Duration) -> Result<Vec<(String, HostStatus)>> {
        let started = Instant::now();
        loop {
            let status = self.status(None);
            if status.iter().all(|(_, st)| st.is_running()) {
                return Ok(status);
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(FarmError::Timeout {
                    waited: timeout,
                    status,
                });
            }
            thread::sleep(WAIT_POLL.min(timeout - elapsed));
        }
    }

    /// Stop, then start again.
    pub fn restart(&mut self) -> Vec<HostCores> {
        let stopped = self.stop();
        let deadline = Instant::now() + RELEASE_TIMEOUT;
        while stopped.iter().any(|h| self.is_running(h)) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(100));
        }
        self.start()
    }

    /// Task numbers in flight on each running pool.
    pub fn inspect(&self) -> Vec<(String, Vec<u32>)> {
        let mut executing = Vec::new();
        for host in self.hosts() {
            if !self.is_running(host) {
                continue;
            }
            match self.send_command(host, ControlCommand::GetExecuting) {
                Ok(ControlReply::Tasks(tasks)) => executing.push((host.to_string(), tasks)),
                Ok(other) => warn!(host, reply = ?other, "unexpected reply to get_executing"),
                Err(e) => warn!(host, error = %e, "pool did not answer"),
            }
        }
        executing
    }
}

/// Poll `child` until it exits or `deadline` passes.
fn exited_by(child: &mut Child, deadline: Instant) -> bool {
    loop {
        match child.try_wait() {
            Ok(None) => {}
            // an error means there is nothing left to wait for
            _ => return true,
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(EXIT_POLL);
    }
}
