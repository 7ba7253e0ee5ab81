//! A stdio worker subprocess as seen by the process-pool backend.
//!
//! The parent writes one `WorkRequest` line to the worker's stdin and reads
//! one `WorkResponse` line back per task. A worker that closes its stdout
//! mid-task has died; it is reaped on the spot so the cause can be reported.

use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{FarmError, Result};
use crate::ipc::{LineReader, LineWriter, PipeFd};
use crate::protocol::{ResultMessage, TaskMessage, WorkRequest, WorkResponse};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const EXIT_POLL: Duration = Duration::from_millis(10);

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(100);

/// What came back for one task.
#[derive(Debug)]
pub enum TaskRun {
    /// The result and the size of its line in bytes.
    Done(ResultMessage, usize),
    /// The worker exited before answering.
    Died(TerminationReason),
}

pub struct Proc {
    pid: Pid,
    writer: LineWriter<PipeFd>,
    reader: LineReader<PipeFd>,
    reaped: bool,
}

impl Proc {
    /// Spawn `program worker` and wait for its Ready line.
    pub fn spawn_worker(program: &Path) -> Result<Self> {
        let child = Command::new(program)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| FarmError::Launch {
                program: program.display().to_string(),
                message: e.to_string(),
            })?;
        let mut proc = Self::from_child(child)?;
        match proc.recv()? {
            Some((WorkResponse::Ready, _)) => Ok(proc),
            Some((other, _)) => Err(FarmError::Worker(format!(
                "worker {} sent {:?} instead of Ready",
                proc.pid, other
            ))),
            None => Err(FarmError::Worker(format!(
                "worker {} exited before it was ready",
                proc.pid
            ))),
        }
    }

    fn from_child(mut child: Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(FarmError::Worker(format!(
                "worker {} spawned without piped stdio",
                pid
            )));
        };
        Ok(Self {
            pid,
            writer: LineWriter::new(PipeFd::new(OwnedFd::from(stdin))),
            reader: LineReader::new(PipeFd::new(OwnedFd::from(stdout))),
            reaped: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Hand one task to the worker and block for its answer.
    pub fn run(&mut self, task: TaskMessage) -> Result<TaskRun> {
        let task_no = task.task_no;
        // a worker that already died shows up as EOF below
        let _ = self.send(&WorkRequest::Run { task });
        match self.recv()? {
            Some((WorkResponse::Done { result }, size)) => {
                if result.task_no != task_no {
                    return Err(FarmError::Worker(format!(
                        "worker {} answered task {} while running task {}",
                        self.pid, result.task_no, task_no
                    )));
                }
                Ok(TaskRun::Done(result, size))
            }
            Some((WorkResponse::Ready, _)) => Err(FarmError::Worker(format!(
                "worker {} sent Ready instead of a result",
                self.pid
            ))),
            None => {
                let reason = match self.wait() {
                    Ok(status) => analyze_wait_status(status),
                    Err(_) => TerminationReason::Unknown,
                };
                Ok(TaskRun::Died(reason))
            }
        }
    }

    fn send(&mut self, request: &WorkRequest) -> Result<()> {
        let line = request.to_line()?;
        self.writer
            .write_line(&line)
            .map_err(|e| FarmError::Worker(format!("cannot write to worker {}: {}", self.pid, e)))
    }

    /// The next response and its size; `None` once stdout is closed.
    fn recv(&mut self) -> Result<Option<(WorkResponse, usize)>> {
        let line = self.reader.read_line().map_err(|e| {
            FarmError::Worker(format!("cannot read from worker {}: {}", self.pid, e))
        })?;
        match line {
            Some(line) => {
                let size = line.len();
                let response = WorkResponse::from_line(line).map_err(|e| {
                    FarmError::Worker(format!("invalid response from worker {}: {}", self.pid, e))
                })?;
                Ok(Some((response, size)))
            }
            None => Ok(None),
        }
    }

    fn wait(&mut self) -> Result<WaitStatus> {
        let status = waitpid(self.pid, None)
            .map_err(|e| FarmError::Worker(format!("waitpid {}: {}", self.pid, e)))?;
        self.reaped = true;
        Ok(status)
    }

    fn reap_within(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                // ECHILD: already gone
                _ => {
                    self.reaped = true;
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL);
        }
    }

    /// Ask the worker to exit, escalating to SIGTERM and then SIGKILL.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        let _ = self.send(&WorkRequest::Exit);
        if self.reap_within(timeout) {
            return Ok(());
        }
        let _ = signal::kill(self.pid, Signal::SIGTERM);
        if self.reap_within(TERM_GRACE) {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| FarmError::Worker(format!("cannot kill worker {}: {}", self.pid, e)))?;
        self.wait().map(|_| ())
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

impl std::fmt::Debug for Proc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proc")
            .field("pid", &self.pid)
            .field("reaped", &self.reaped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Monitor;
    use serde_json::json;

    fn cat() -> Proc {
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn cat");
        Proc::from_child(child).unwrap()
    }

    fn task() -> TaskMessage {
        TaskMessage {
            func: "double".into(),
            args: vec![json!(2)],
            task_no: 4,
            weight: 1.0,
            monitor: Monitor::new("double"),
            backurl: None,
        }
    }

    #[test]
    fn test_stop_reaps() {
        let mut proc = cat();
        proc.stop(Duration::from_secs(1)).unwrap();
        assert!(proc.reaped);
        // idempotent
        proc.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_run_reports_death() {
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn sleep");
        let mut proc = Proc::from_child(child).unwrap();
        signal::kill(proc.pid(), Signal::SIGKILL).unwrap();

        match proc.run(task()).unwrap() {
            TaskRun::Died(TerminationReason::OutOfMemory) => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(proc.reaped);
    }

    #[test]
    fn test_run_rejects_echoed_request() {
        // cat echoes the Run request, which is not a valid response
        let mut proc = cat();
        assert!(matches!(proc.run(task()), Err(FarmError::Worker(_))));
    }

    #[test]
    fn test_spawn_worker_missing_program() {
        let err = Proc::spawn_worker(Path::new("/nonexistent/taskfarm"))
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, FarmError::Launch { .. }));
    }
}
