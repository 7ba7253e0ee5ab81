//! Where the tasks of a Starmap run.

use super::processpool::ProcessPoolBackend;
use super::remote::{SlurmBackend, ZmqBackend};
use crate::config::{Config, Distribute};
use crate::error::{FarmError, Result};
use crate::protocol::{ResultMessage, TaskMessage};
use crate::task::{Registry, safely_call};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Executes submitted tasks and hands back their results in completion
/// order.
pub trait Backend: Send {
    /// Queue one task, returning the number of bytes sent.
    fn submit(&mut self, task: TaskMessage) -> Result<usize>;

    /// Block for the next result and its size in bytes; `None` once no
    /// result can arrive any more.
    fn recv(&mut self) -> Result<Option<(ResultMessage, usize)>>;

    /// Release workers and sockets. Called once, after the last result.
    fn shutdown(&mut self) {}

    /// Give up on the tasks still running. Called once, on the first
    /// failure; must not wait for running tasks to complete.
    fn abort(&mut self) {
        self.shutdown();
    }
}

/// Runs each task in the calling thread when its result is asked for.
pub struct SequentialBackend {
    registry: Arc<Registry>,
    queue: VecDeque<TaskMessage>,
}

impl SequentialBackend {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            queue: VecDeque::new(),
        }
    }
}

fn encoded_len<T: serde::Serialize>(value: &T) -> Result<usize> {
    Ok(serde_json::to_vec(value)?.len() + 1)
}

impl Backend for SequentialBackend {
    fn submit(&mut self, task: TaskMessage) -> Result<usize> {
        let size = encoded_len(&task)?;
        self.queue.push_back(task);
        Ok(size)
    }

    fn recv(&mut self) -> Result<Option<(ResultMessage, usize)>> {
        let Some(task) = self.queue.pop_front() else {
            return Ok(None);
        };
        let result = safely_call(&self.registry, task);
        let size = encoded_len(&result)?;
        Ok(Some((result, size)))
    }

    fn shutdown(&mut self) {
        self.queue.clear();
    }
}

/// Runs tasks on threads of the calling process sharing one job queue.
///
/// Task functions must be thread-safe; their monitors are not shared.
pub struct ThreadPoolBackend {
    jobs: Option<Sender<TaskMessage>>,
    queued: Receiver<TaskMessage>,
    results: Receiver<ResultMessage>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPoolBackend {
    pub fn new(registry: Arc<Registry>, size: usize) -> Self {
        let (job_tx, job_rx) = unbounded::<TaskMessage>();
        let (res_tx, res_rx) = unbounded::<ResultMessage>();
        let threads = (0..size.max(1))
            .filter_map(|id| {
                let jobs = job_rx.clone();
                let results = res_tx.clone();
                let registry = Arc::clone(&registry);
                thread::Builder::new()
                    .name(format!("task-thread-{}", id))
                    .spawn(move || {
                        for task in jobs.iter() {
                            if results.send(safely_call(&registry, task)).is_err() {
                                break;
                            }
                        }
                    })
                    .map_err(|e| warn!(thread_id = id, error = %e, "cannot spawn task thread"))
                    .ok()
            })
            .collect();
        Self {
            jobs: Some(job_tx),
            queued: job_rx,
            results: res_rx,
            threads,
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

impl Backend for ThreadPoolBackend {
    fn submit(&mut self, task: TaskMessage) -> Result<usize> {
        let size = encoded_len(&task)?;
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| FarmError::Worker("thread pool is shut down".into()))?;
        jobs.send(task)
            .map_err(|_| FarmError::Worker("thread pool has no threads".into()))?;
        Ok(size)
    }

    fn recv(&mut self) -> Result<Option<(ResultMessage, usize)>> {
        if self.threads.is_empty() {
            return Ok(None);
        }
        match self.results.recv() {
            Ok(result) => {
                let size = encoded_len(&result)?;
                Ok(Some((result, size)))
            }
            Err(_) => Ok(None),
        }
    }

    fn shutdown(&mut self) {
        self.discard_queued();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Threads cannot be killed; the running tasks finish unobserved.
    fn abort(&mut self) {
        self.discard_queued();
        self.threads.clear();
    }
}

impl Drop for ThreadPoolBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Build the backend for `distribute`.
pub fn backend_for(
    distribute: Distribute,
    registry: Arc<Registry>,
    config: &Config,
    num_tasks: usize,
) -> Result<Box<dyn Backend>> {
    Ok(match distribute {
        Distribute::No => Box::new(SequentialBackend::new(registry)),
        Distribute::ThreadPool => Box::new(ThreadPoolBackend::new(registry, config.pool_size())),
        Distribute::ProcessPool => {
            Box::new(ProcessPoolBackend::new(&config.worker_program()?, config.pool_size()))
        }
        Distribute::Zmq => Box::new(ZmqBackend::new(config)?),
        Distribute::Slurm => Box::new(SlurmBackend::new(config, num_tasks)?),
    })
}
