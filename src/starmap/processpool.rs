//! Process-pool backend: stdio workers on this host.
//!
//! One collector thread per worker pulls tasks from a shared queue, runs
//! them on its worker subprocess and forwards the results. A worker that
//! dies mid-task is respawned for the next task; the lost task is reported
//! as the nil sentinel if the worker was SIGKILLed, as a failure otherwise.
//!
//! On the first task failure the batch is aborted: queued tasks are dropped
//! and the running workers are killed instead of being waited for.

use super::backend::Backend;
use crate::error::{FarmError, Result};
use crate::protocol::{ResultMessage, TaskMessage};
use crate::worker::proc::{Proc, TaskRun};
use crossbeam_channel::{Receiver, Sender, unbounded};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How long a worker gets to exit after the Exit request.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

type Delivery = Result<(ResultMessage, usize)>;

/// Workers currently alive, by collector id.
#[derive(Default)]
struct LiveWorkers {
    aborted: bool,
    pids: HashMap<usize, Pid>,
}

type SharedWorkers = Arc<Mutex<LiveWorkers>>;

fn lock(live: &SharedWorkers) -> std::sync::MutexGuard<'_, LiveWorkers> {
    live.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ProcessPoolBackend {
    jobs: Option<Sender<TaskMessage>>,
    /// Kept to discard queued tasks on shutdown.
    queued: Receiver<TaskMessage>,
    results: Receiver<Delivery>,
    collectors: Vec<JoinHandle<()>>,
    live: SharedWorkers,
}

struct Collector {
    id: usize,
    program: PathBuf,
    proc: Option<Proc>,
    live: SharedWorkers,
}

impl Collector {
    fn is_aborted(&self) -> bool {
        lock(&self.live).aborted
    }

    fn ensure_ready(&mut self) -> Result<&mut Proc> {
        if self.proc.is_none() {
            let proc = Proc::spawn_worker(&self.program)?;
            let mut live = lock(&self.live);
            if live.aborted {
                // dropping the proc kills it
                return Err(FarmError::Worker("process pool aborted".into()));
            }
            live.pids.insert(self.id, proc.pid());
            drop(live);
            debug!(worker_id = self.id, pid = %proc.pid(), "worker ready");
            self.proc = Some(proc);
        }
        self.proc
            .as_mut()
            .ok_or_else(|| FarmError::Worker(format!("Worker {} not available", self.id)))
    }

    fn run(&mut self, task: TaskMessage) -> Delivery {
        let task_no = task.task_no;
        let func = task.func.clone();
        let monitor = task.monitor.clone();

        match self.ensure_ready()?.run(task)? {
            TaskRun::Done(result, size) => {
                trace!(worker_id = self.id, task_no, size, "task done");
                Ok((result, size))
            }
            TaskRun::Died(reason) => {
                self.proc = None;
                let aborted = {
                    let mut live = lock(&self.live);
                    live.pids.remove(&self.id);
                    live.aborted
                };
                if aborted {
                    debug!(worker_id = self.id, task_no, "worker killed by abort");
                } else {
                    warn!(worker_id = self.id, task = %func, task_no, %reason, "worker died running task");
                }
                let result = ResultMessage {
                    task_no,
                    func,
                    result: reason.lost_task_result(),
                    monitor,
                    pid: 0,
                    mem_gb: 0.0,
                };
                Ok((result, 0))
            }
        }
    }

    fn stop(&mut self) {
        lock(&self.live).pids.remove(&self.id);
        if let Some(mut proc) = self.proc.take()
            && let Err(e) = proc.stop(STOP_TIMEOUT)
        {
            debug!(worker_id = self.id, error = %e, "worker stop failed");
        }
    }
}

impl ProcessPoolBackend {
    /// Start `size` collectors; workers are spawned on their first task.
    pub fn new(program: &Path, size: usize) -> Self {
        let (job_tx, job_rx) = unbounded::<TaskMessage>();
        let (res_tx, res_rx) = unbounded::<Delivery>();
        let live = SharedWorkers::default();

        let collectors = (0..size.max(1))
            .filter_map(|id| {
                let jobs = job_rx.clone();
                let results = res_tx.clone();
                let mut collector = Collector {
                    id,
                    program: program.to_path_buf(),
                    proc: None,
                    live: Arc::clone(&live),
                };
                thread::Builder::new()
                    .name(format!("collector-{}", id))
                    .spawn(move || {
                        for task in jobs.iter() {
                            if collector.is_aborted() {
                                break;
                            }
                            let delivery = collector.run(task);
                            if results.send(delivery).is_err() {
                                break;
                            }
                        }
                        collector.stop();
                    })
                    .map_err(|e| warn!(worker_id = id, error = %e, "cannot spawn collector"))
                    .ok()
            })
            .collect();

        Self {
            jobs: Some(job_tx),
            queued: job_rx,
            results: res_rx,
            collectors,
            live,
        }
    }

    fn discard_queued(&mut self) {
        self.jobs = None;
        let discarded = self.queued.try_iter().count();
        if discarded > 0 {
            debug!(discarded, "discarding queued tasks");
        }
    }
}

impl Backend for ProcessPoolBackend {
    fn submit(&mut self, task: TaskMessage) -> Result<usize> {
        let size = serde_json::to_vec(&task)?.len() + 1;
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| FarmError::Worker("process pool is shut down".into()))?;
        jobs.send(task)
            .map_err(|_| FarmError::Worker("process pool has no collectors".into()))?;
        Ok(size)
    }

    fn recv(&mut self) -> Result<Option<(ResultMessage, usize)>> {
        if self.collectors.is_empty() {
            return Ok(None);
        }
        match self.results.recv() {
            Ok(delivery) => delivery.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn shutdown(&mut self) {
        self.discard_queued();
        for handle in self.collectors.drain(..) {
            let _ = handle.join();
        }
    }

    /// Kill every running worker and leave the collectors to wind down on
    /// their own.
    fn abort(&mut self) {
        self.discard_queued();
        let mut live = lock(&self.live);
        live.aborted = true;
        for (id, pid) in live.pids.drain() {
            debug!(worker_id = id, %pid, "killing worker");
            let _ = signal::kill(pid, Signal::SIGKILL);
        }
        drop(live);
        // each collector reaps its own worker and exits
        self.collectors.clear();
    }
}

impl Drop for ProcessPoolBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
