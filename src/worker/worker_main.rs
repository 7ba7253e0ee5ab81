//! Worker process entry points.
//!
//! A worker runs tasks strictly one at a time. In socket mode it pulls
//! tasks from a Streamer (or a slurm submitter) and pushes every result to
//! the task's back URL; in stdio mode it serves a process-pool parent over
//! stdin/stdout.

use super::namer::ProcessNamer;
use crate::error::{FarmError, Result};
use crate::ipc::{LineReader, LineWriter, PipeFd};
use crate::protocol::{ResultMessage, TaskMessage, WorkRequest, WorkResponse};
use crate::task::{Registry, safely_call};
use crate::transport::{Endpoint, PullSocket, PushSocket};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause between attempts to reach a task source that is not up yet.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long a worker tries to reach a submitter's result socket.
const BACKURL_TIMEOUT: Duration = Duration::from_secs(2);

/// Options of a socket-mode worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub task_url: Endpoint,
    /// Directory of liveness markers, one file per running task.
    pub executing_dir: Option<PathBuf>,
    /// Keep reconnecting to the task source instead of exiting when it
    /// goes away.
    pub reconnect: bool,
}

/// Ignore SIGPIPE and die with the parent process.
pub fn prepare_worker_process() {
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }
    #[cfg(target_os = "linux")]
    if let Err(e) = nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL) {
        debug!(error = %e, "cannot set parent death signal");
    }
}

/// Marker file whose existence means `task_no` is running here.
struct Marker(Option<PathBuf>);

impl Marker {
    fn create(dir: Option<&Path>, task: &TaskMessage) -> Self {
        let Some(dir) = dir else {
            return Self(None);
        };
        let path = dir.join(task.task_no.to_string());
        match fs::write(&path, &task.func) {
            Ok(()) => Self(Some(path)),
            Err(e) => {
                warn!(task_no = task.task_no, error = %e, "cannot create liveness marker");
                Self(None)
            }
        }
    }
}

impl Drop for Marker {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = fs::remove_file(path);
        }
    }
}

/// Result sockets, one per submitter.
#[derive(Default)]
struct BackChannels {
    sockets: HashMap<Endpoint, PushSocket>,
}

impl BackChannels {
    fn send(&mut self, backurl: &Endpoint, result: &ResultMessage) -> Result<()> {
        if !self.sockets.contains_key(backurl) {
            let socket = PushSocket::connect_timeout(backurl, BACKURL_TIMEOUT)?;
            self.sockets.insert(backurl.clone(), socket);
        }
        let outcome = match self.sockets.get_mut(backurl) {
            Some(socket) => socket.send(result).map(|_| ()),
            None => Ok(()),
        };
        if outcome.is_err() {
            self.sockets.remove(backurl);
        }
        outcome
    }
}

fn run_one(
    registry: &Registry,
    task: TaskMessage,
    options: &WorkerOptions,
    namer: &dyn ProcessNamer,
    back: &mut BackChannels,
) {
    let task_no = task.task_no;
    let func = task.func.clone();
    let Some(backurl) = task.backurl.clone() else {
        warn!(task = %func, task_no, "task has no back URL, dropping it");
        return;
    };

    namer.set_name(&format!("tf {}#{}", func, task_no));
    let result = {
        let _marker = Marker::create(options.executing_dir.as_deref(), &task);
        safely_call(registry, task)
    };
    namer.set_name("tf worker");

    if let Err(e) = back.send(&backurl, &result) {
        warn!(task = %func, task_no, backurl = %backurl, error = %e, "cannot deliver result");
    }
}

/// Pull tasks from `options.task_url` until the source goes away.
pub fn run_socket_worker(
    registry: &Registry,
    options: &WorkerOptions,
    namer: &dyn ProcessNamer,
) -> Result<()> {
    namer.set_name("tf worker");
    let mut back = BackChannels::default();
    loop {
        let pull = match PullSocket::connect(&options.task_url) {
            Ok(pull) => pull,
            Err(e) if options.reconnect => {
                debug!(task_url = %options.task_url, error = %e, "task source not reachable");
                thread::sleep(RECONNECT_DELAY);
                continue;
            }
            Err(e) => return Err(e),
        };
        info!(task_url = %options.task_url, pid = std::process::id(), "worker connected");

        for task in pull.iter::<TaskMessage>() {
            match task {
                Ok(task) => run_one(registry, task, options, namer, &mut back),
                Err(e) => warn!(error = %e, "discarding undecodable task"),
            }
        }

        if !options.reconnect {
            info!("task source closed, worker exiting");
            return Ok(());
        }
        debug!("task source closed, reconnecting");
        thread::sleep(RECONNECT_DELAY);
    }
}

/// Serve a process-pool parent over stdin/stdout.
pub fn run_stdio_worker(registry: &Registry, namer: &dyn ProcessNamer) -> Result<()> {
    namer.set_name("tf worker");
    let mut reader = LineReader::new(PipeFd::stdin()?);
    let mut writer = LineWriter::new(PipeFd::stdout()?);
    stdio_loop(registry, namer, &mut reader, &mut writer)
}

fn stdio_loop<R: std::io::Read, W: std::io::Write>(
    registry: &Registry,
    namer: &dyn ProcessNamer,
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
) -> Result<()> {
    writer.write_line(&WorkResponse::Ready.to_line()?)?;

    loop {
        let line = match reader.read_line()? {
            Some(line) => line.to_string(),
            // parent closed the pipe
            None => return Ok(()),
        };

        let request = match WorkRequest::from_line(&line) {
            Ok(req) => req,
            Err(e) => {
                return Err(FarmError::Worker(format!("Invalid request: {}", e)));
            }
        };

        match request {
            WorkRequest::Exit => return Ok(()),
            WorkRequest::Run { task } => {
                namer.set_name(&format!("tf {}#{}", task.func, task.task_no));
                let result = safely_call(registry, task);
                writer.write_line(&WorkResponse::Done { result }.to_line()?)?;
                namer.set_name("tf worker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Monitor;
    use crate::protocol::TaskResult;
    use crate::task::TaskOutcome;
    use crate::worker::namer::NoopNamer;
    use serde_json::{Value, json};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn registry() -> Registry {
        let mut reg = Registry::new();
        reg.register("double", |args, _| {
            TaskOutcome::done(args[0].as_i64().unwrap_or(0) * 2)
        });
        reg
    }

    fn task(task_no: u32, x: i64, backurl: Option<Endpoint>) -> TaskMessage {
        TaskMessage {
            func: "double".into(),
            args: vec![json!(x)],
            task_no,
            weight: 1.0,
            monitor: Monitor::new("double"),
            backurl,
        }
    }

    #[test]
    fn test_stdio_loop() {
        let mut input = String::new();
        input.push_str(&WorkRequest::Run { task: task(1, 5, None) }.to_line().unwrap());
        input.push_str(&WorkRequest::Exit.to_line().unwrap());
        let mut reader = LineReader::new(Cursor::new(input.into_bytes()));
        let mut writer = LineWriter::new(Vec::new());

        stdio_loop(&registry(), &NoopNamer, &mut reader, &mut writer).unwrap();

        let output = String::from_utf8(writer.get_ref().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(matches!(WorkResponse::from_line(lines[0]).unwrap(), WorkResponse::Ready));
        match WorkResponse::from_line(lines[1]).unwrap() {
            WorkResponse::Done { result } => {
                assert_eq!(result.task_no, 1);
                assert_eq!(result.result, TaskResult::Value(json!(10)));
            }
            other => panic!("Expected Done, got {:?}", other),
        }
    }

    #[test]
    fn test_socket_worker_delivers_to_backurl() {
        let dir = tempdir().unwrap();
        let results = PullSocket::bind(&Endpoint::new("127.0.0.1", 0)).unwrap();
        let backurl = results.local_endpoint().cloned();
        let mut source = PushSocket::bind(&Endpoint::new("127.0.0.1", 0)).unwrap();

        let options = WorkerOptions {
            task_url: source.local_endpoint().unwrap().clone(),
            executing_dir: Some(dir.path().to_path_buf()),
            reconnect: false,
        };
        let worker = thread::spawn(move || run_socket_worker(&registry(), &options, &NoopNamer));

        for i in 0..3 {
            source.send(&task(i, i as i64, backurl.clone())).unwrap();
        }
        let mut got: Vec<Value> = (0..3)
            .map(|_| {
                let msg: ResultMessage = results.recv().unwrap().unwrap();
                match msg.result {
                    TaskResult::Value(v) => v,
                    other => panic!("Expected value, got {:?}", other),
                }
            })
            .collect();
        got.sort_by_key(|v| v.as_i64());
        assert_eq!(got, vec![json!(0), json!(2), json!(4)]);

        drop(source);
        worker.join().unwrap().unwrap();
        // markers are removed once tasks finish
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
