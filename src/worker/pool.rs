//! A local group of socket workers behind one control endpoint.
//!
//! ```text
//!                ┌──────────────┐  stop / kill / getpid /
//!   WorkerMaster │  WorkerPool  │◄─ get_num_workers / get_executing
//!                └──────┬───────┘
//!          ┌────────────┼────────────┐
//!    ┌─────▼────┐ ┌─────▼────┐ ┌─────▼────┐
//!    │ worker 1 │ │ worker 2 │ │ worker N │ ◄── tasks pulled from the Streamer
//!    └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! Each worker writes a marker file named after the task number it is
//! running into the pool's executing directory; `get_executing` lists it.

use crate::config::available_cores;
use crate::error::{FarmError, Result};
use crate::protocol::{ControlCommand, ControlReply};
use crate::transport::{Endpoint, ReplySocket};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// How long a stopping pool waits for its workers before SIGKILL.
pub(crate) const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub ctrl_url: Endpoint,
    pub task_url: Endpoint,
    pub num_workers: usize,
    /// Binary run as `program worker ...`.
    pub program: PathBuf,
    pub executing_dir: PathBuf,
}

impl WorkerPoolConfig {
    /// `num_workers <= 0` means one worker per core.
    pub fn new(ctrl_url: Endpoint, task_url: Endpoint, num_workers: i32) -> Result<Self> {
        let num_workers = usize::try_from(num_workers)
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or_else(available_cores);
        let executing_dir = std::env::temp_dir().join(format!(
            "taskfarm-executing-{}-{}",
            ctrl_url.port,
            std::process::id()
        ));
        Ok(Self {
            ctrl_url,
            task_url,
            num_workers,
            program: std::env::current_exe()?,
            executing_dir,
        })
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_executing_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.executing_dir = dir.into();
        self
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    workers: Vec<Child>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            workers: Vec::new(),
        }
    }

    /// Spawn the workers and serve control commands until `stop` or `kill`.
    ///
    /// The executing directory is removed on the way out.
    #[instrument(skip(self), fields(ctrl_url = %self.config.ctrl_url, workers = self.config.num_workers))]
    pub fn start(&mut self) -> Result<()> {
        let outcome = self.spawn_workers().and_then(|()| {
            let ctrl = ReplySocket::bind(&self.config.ctrl_url)?;
            info!(
                pid = std::process::id(),
                "worker pool ready on {}",
                ctrl.local_endpoint()
            );
            self.serve(ctrl)
        });
        if outcome.is_err() {
            self.kill();
        }
        self.reap(REAP_TIMEOUT);
        if let Err(e) = fs::remove_dir_all(&self.config.executing_dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(dir = %self.config.executing_dir.display(), error = %e, "cannot remove executing dir");
        }
        outcome
    }

    fn spawn_workers(&mut self) -> Result<()> {
        fs::create_dir_all(&self.config.executing_dir)?;
        for worker_id in 0..self.config.num_workers {
            let child = Command::new(&self.config.program)
                .arg("worker")
                .arg("--task-url")
                .arg(self.config.task_url.to_string())
                .arg("--executing")
                .arg(&self.config.executing_dir)
                .arg("--reconnect")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|e| FarmError::Launch {
                    program: self.config.program.display().to_string(),
                    message: e.to_string(),
                })?;
            debug!(worker_id, pid = child.id(), "spawned worker");
            self.workers.push(child);
        }
        Ok(())
    }

    /// Answer control commands on `ctrl` until told to stop.
    pub fn serve(&mut self, mut ctrl: ReplySocket) -> Result<()> {
        loop {
            let command: ControlCommand = match ctrl.recv() {
                Ok(cmd) => cmd,
                Err(FarmError::Json(e)) => {
                    warn!(error = %e, "unknown control command");
                    ctrl.reply(&ControlReply::Message(format!("error: {}", e)))?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!(%command, "control command");

            let (reply, done) = match command {
                ControlCommand::Stop => {
                    self.stop();
                    (ControlReply::Message("stopped".into()), true)
                }
                ControlCommand::Kill => {
                    self.kill();
                    (ControlReply::Message("killed".into()), true)
                }
                ControlCommand::GetPid => (ControlReply::Number(u64::from(std::process::id())), false),
                ControlCommand::GetNumWorkers => (ControlReply::Number(self.workers.len() as u64), false),
                ControlCommand::GetExecuting => (ControlReply::Tasks(self.executing()?), false),
            };
            if let Err(e) = ctrl.reply(&reply) {
                warn!(error = %e, "cannot reply to control command");
            }
            if done {
                info!(%command, "worker pool exiting");
                return Ok(());
            }
        }
    }

    /// Task numbers currently running, sorted.
    pub fn executing(&self) -> Result<Vec<u32>> {
        list_executing(&self.config.executing_dir)
    }

    fn signal_all(&self, sig: Signal) {
        for child in &self.workers {
            if let Err(e) = signal::kill(Pid::from_raw(child.id() as i32), sig) {
                debug!(pid = child.id(), signal = ?sig, error = %e, "cannot signal worker");
            }
        }
    }

    /// Ask every worker to terminate; does not wait.
    pub fn stop(&self) {
        self.signal_all(Signal::SIGTERM);
    }

    pub fn kill(&self) {
        self.signal_all(Signal::SIGKILL);
    }

    fn reap(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            self.workers
                .retain_mut(|child| matches!(child.try_wait(), Ok(None)));
            if self.workers.is_empty() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        for child in &mut self.workers {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.workers.clear();
    }
}

fn list_executing(dir: &Path) -> Result<Vec<u32>> {
    let mut tasks = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tasks),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if let Some(task_no) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            tasks.push(task_no);
        }
    }
    tasks.sort_unstable();
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RequestSocket;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_list_executing_sorted() {
        let dir = tempdir().unwrap();
        for n in ["12", "3", "7", "not-a-task"] {
            fs::write(dir.path().join(n), "double").unwrap();
        }
        assert_eq!(list_executing(dir.path()).unwrap(), vec![3, 7, 12]);
        assert!(list_executing(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_config_defaults_to_all_cores() {
        let any = Endpoint::new("127.0.0.1", 0);
        let config = WorkerPoolConfig::new(any.clone(), any, -1).unwrap();
        assert_eq!(config.num_workers, available_cores());
    }

    #[test]
    fn test_serve_control_commands() {
        let dir = tempdir().unwrap();
        let any = Endpoint::new("127.0.0.1", 0);
        let config = WorkerPoolConfig::new(any.clone(), any.clone(), 1)
            .unwrap()
            .with_executing_dir(dir.path());
        fs::write(dir.path().join("5"), "sleepy").unwrap();

        let ctrl = ReplySocket::bind(&any).unwrap();
        let url = ctrl.local_endpoint().clone();
        let server = thread::spawn(move || WorkerPool::new(config).serve(ctrl));

        let mut req = RequestSocket::connect(&url, Some(Duration::from_secs(5))).unwrap();
        let pid: ControlReply = req.request(&ControlCommand::GetPid).unwrap();
        assert_eq!(pid, ControlReply::Number(u64::from(std::process::id())));
        let n: ControlReply = req.request(&ControlCommand::GetNumWorkers).unwrap();
        assert_eq!(n, ControlReply::Number(0));
        let executing: ControlReply = req.request(&ControlCommand::GetExecuting).unwrap();
        assert_eq!(executing, ControlReply::Tasks(vec![5]));
        let bogus: ControlReply = req.request(&"reboot").unwrap();
        assert!(matches!(bogus, ControlReply::Message(m) if m.starts_with("error")));
        let stopped: ControlReply = req.request(&ControlCommand::Stop).unwrap();
        assert_eq!(stopped, ControlReply::Message("stopped".into()));

        server.join().unwrap().unwrap();
    }
}
