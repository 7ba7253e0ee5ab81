//! Fan a task over argument tuples and fold the results.
//!
//! ```text
//!   Starmap ──submit──► Backend ──► workers
//!      ▲                               │
//!      └──── IterResult ◄── results ◄──┘
//! ```
//!
//! The backend follows the distribution mode: in-process (`no`), a pool of
//! threads (`threadpool`), a local process pool (`processpool`), the
//! Streamer and worker pools of a WorkerMaster (`zmq`) or cluster jobs
//! (`slurm`). Every task carries its
//! own [`Monitor`]; results come back with it and their telemetry is
//! appended to the performance store.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use taskfarm::config::{Config, Distribute};
//! use taskfarm::starmap::Starmap;
//! use taskfarm::task::{Registry, TaskOutcome};
//!
//! let mut registry = Registry::new();
//! registry.register("double", |args, _| {
//!     TaskOutcome::done(args[0].as_i64().unwrap_or(0) * 2)
//! });
//! let config = Config::default().with_distribute(Distribute::No);
//! let args = (0..10).map(|x| vec![json!(x)]);
//! let total = Starmap::new(Arc::new(registry), "double", args, &config)
//!     .reduce(|acc, v| acc + v.as_i64().unwrap_or(0), 0)
//!     .unwrap();
//! assert_eq!(total, 90);
//! ```

pub mod backend;
pub mod blocks;
mod iter;
pub mod processpool;
pub mod remote;

pub use backend::{Backend, SequentialBackend, ThreadPoolBackend, backend_for};
pub use blocks::{WeightedBlock, block_splitter, split_in_blocks};
pub use iter::{IterResult, TransferStats};

use crate::config::{Config, Distribute};
use crate::error::Result;
use crate::memory::check_mem_usage;
use crate::monitor::Monitor;
use crate::store::PerfStore;
use crate::task::Registry;
use iter::IterSettings;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// A batch of tasks of one function, not yet submitted.
pub struct Starmap {
    registry: Arc<Registry>,
    config: Config,
    distribute: Distribute,
    func: String,
    name: String,
    args: Vec<Vec<Value>>,
    weights: Vec<f32>,
    monitor: Monitor,
    store: Option<PerfStore>,
}

impl Starmap {
    pub fn new(
        registry: Arc<Registry>,
        func: impl Into<String>,
        args: impl IntoIterator<Item = Vec<Value>>,
        config: &Config,
    ) -> Self {
        let func = func.into();
        Self {
            registry,
            distribute: config.distribute,
            config: config.clone(),
            name: func.clone(),
            monitor: Monitor::new(func.clone()),
            func,
            args: args.into_iter().collect(),
            weights: Vec::new(),
            store: None,
        }
    }

    /// One task per weight-balanced block of `items`.
    ///
    /// Each task gets `[block, extra_args...]` as arguments and the block
    /// weight as task weight. `concurrent_tasks` defaults to five tasks per
    /// pool slot.
    pub fn apply<W>(
        registry: Arc<Registry>,
        func: impl Into<String>,
        items: Vec<Value>,
        extra_args: Vec<Value>,
        concurrent_tasks: Option<usize>,
        weight: W,
        config: &Config,
    ) -> Result<Self>
    where
        W: Fn(&Value) -> f64,
    {
        let hint = concurrent_tasks.unwrap_or_else(|| config.pool_size() * 5);
        let blocks = split_in_blocks(items, hint, weight)?;
        let mut args = Vec::with_capacity(blocks.len());
        let mut weights = Vec::with_capacity(blocks.len());
        for block in blocks {
            let mut task_args = Vec::with_capacity(extra_args.len() + 1);
            task_args.push(Value::Array(block.items));
            task_args.extend(extra_args.iter().cloned());
            args.push(task_args);
            weights.push(block.weight as f32);
        }
        Ok(Self::new(registry, func, args, config).with_weights(weights))
    }

    pub fn with_distribute(mut self, distribute: Distribute) -> Self {
        self.distribute = distribute;
        self
    }

    /// Parent of the task monitors.
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_store(mut self, store: PerfStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Name used in logs and telemetry; names starting with `_` are private
    /// and leave no telemetry.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Task weights, by position; missing weights default to 1.
    pub fn with_weights(mut self, weights: Vec<f32>) -> Self {
        self.weights = weights;
        self
    }

    pub fn num_tasks(&self) -> usize {
        self.args.len()
    }

    fn open_store(&mut self) -> Option<PerfStore> {
        if let Some(store) = self.store.take() {
            return Some(store);
        }
        let path = self.config.store_path.as_ref()?;
        match PerfStore::open(path) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open performance store");
                None
            }
        }
    }

    /// Submit every task and iterate over the results as they complete.
    pub fn submit_all(mut self) -> Result<IterResult> {
        check_mem_usage(&self.config.memory)?;
        let backend = backend_for(
            self.distribute,
            Arc::clone(&self.registry),
            &self.config,
            self.args.len(),
        )?;
        debug!(task = %self.name, distribute = %self.distribute, tasks = self.args.len(), "submitting");
        let store = self.open_store();
        let mut results = IterResult::new(
            backend,
            IterSettings {
                name: self.name.clone(),
                monitor: self.monitor.clone(),
                store,
                memory: self.config.memory.clone(),
                budget: self.config.task_duration_budget,
            },
        );
        let args = std::mem::take(&mut self.args);
        for (i, task_args) in args.into_iter().enumerate() {
            let weight = self.weights.get(i).copied().unwrap_or(1.0);
            results.submit(&self.func, task_args, weight)?;
        }
        results.log_sent();
        Ok(results)
    }

    /// Fold every result into `init` with `agg`.
    ///
    /// Fails with the first task failure; the nil sentinel fails with
    /// [`FarmError::OutOfMemory`](crate::error::FarmError::OutOfMemory) and is never passed to `agg`.
    pub fn reduce<A, F>(self, mut agg: F, init: A) -> Result<A>
    where
        F: FnMut(A, Value) -> A,
    {
        let mut acc = init;
        for value in self.submit_all()? {
            acc = agg(acc, value?);
        }
        Ok(acc)
    }

    /// Drain the results, returning how many tasks completed.
    pub fn wait(self) -> Result<usize> {
        let mut completed = 0;
        for value in self.submit_all()? {
            value?;
            completed += 1;
        }
        Ok(completed)
    }
}

impl IntoIterator for Starmap {
    type Item = Result<Value>;
    type IntoIter = IterResult;

    /// Submission errors are yielded as the first item.
    fn into_iter(self) -> IterResult {
        let name = self.name.clone();
        match self.submit_all() {
            Ok(results) => results,
            Err(e) => IterResult::failed(name, e),
        }
    }
}

impl std::fmt::Debug for Starmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Starmap")
            .field("func", &self.func)
            .field("name", &self.name)
            .field("distribute", &self.distribute)
            .field("tasks", &self.args.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FarmError;
    use crate::task::{TaskError, TaskOutcome};
    use serde_json::json;
    use tempfile::tempdir;

    fn registry() -> Arc<Registry> {
        let mut reg = Registry::new();
        reg.register("double", |args, _| {
            TaskOutcome::done(args[0].as_i64().unwrap_or(0) * 2)
        })
        .register("sum_block", |args, _| {
            let block = args[0].as_array().cloned().unwrap_or_default();
            let offset = args.get(1).and_then(Value::as_i64).unwrap_or(0);
            TaskOutcome::done(block.iter().filter_map(Value::as_i64).sum::<i64>() + offset)
        })
        .register("picky", |args, _| {
            if args[0] == json!(2) {
                Err(TaskError::value_error("no twos").into())
            } else {
                TaskOutcome::done(args[0].clone())
            }
        })
        .register("oom", |_, _| Ok(TaskOutcome::Nil));
        Arc::new(reg)
    }

    fn config() -> Config {
        Config::default().with_distribute(Distribute::No)
    }

    fn args(n: i64) -> impl Iterator<Item = Vec<Value>> {
        (0..n).map(|x| vec![json!(x)])
    }

    #[test]
    fn test_reduce_matches_direct_fold() {
        let total = Starmap::new(registry(), "double", args(10), &config())
            .reduce(|acc, v| acc + v.as_i64().unwrap(), 0)
            .unwrap();
        assert_eq!(total, (0..10).map(|x| x * 2).sum::<i64>());
    }

    #[test]
    fn test_thread_pool_matches_sequential() {
        let threaded = Starmap::new(registry(), "double", args(10), &config())
            .with_distribute(Distribute::ThreadPool)
            .reduce(|acc, v| acc + v.as_i64().unwrap(), 0)
            .unwrap();
        assert_eq!(threaded, 90);
    }

    #[test]
    fn test_iteration_raises_failure_once() {
        let results: Vec<_> = Starmap::new(registry(), "picky", args(5), &config())
            .into_iter()
            .collect();
        let errors: Vec<_> = results.iter().filter(|r| r.is_err()).collect();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            Err(FarmError::TaskFailed { kind, .. }) if kind == "ValueError"
        ));
        assert!(results.last().unwrap().is_err());
    }

    #[test]
    fn test_reduce_fails_on_nil() {
        let mut folded = 0;
        let err = Starmap::new(registry(), "oom", args(1), &config())
            .reduce(
                |acc: i32, _| {
                    folded += 1;
                    acc
                },
                0,
            )
            .unwrap_err();
        assert!(matches!(err, FarmError::OutOfMemory { .. }));
        assert_eq!(folded, 0);
    }

    #[test]
    fn test_apply_splits_into_weighted_blocks() {
        let items: Vec<Value> = (1..=6).map(|x| json!(x)).collect();
        let smap = Starmap::apply(
            registry(),
            "sum_block",
            items,
            vec![json!(100)],
            Some(3),
            |_| 1.0,
            &config(),
        )
        .unwrap();
        assert_eq!(smap.num_tasks(), 3);
        assert_eq!(smap.weights, vec![2.0, 2.0, 2.0]);
        let total = smap.reduce(|acc, v| acc + v.as_i64().unwrap(), 0).unwrap();
        assert_eq!(total, 21 + 300);
    }

    #[test]
    fn test_wait_counts_and_writes_task_info() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("perf.db");
        let config = config().with_store_path(&path);
        let n = Starmap::new(registry(), "double", args(4), &config)
            .with_weights(vec![1.0, 2.0, 3.0, 4.0])
            .wait()
            .unwrap();
        assert_eq!(n, 4);

        let store = PerfStore::open_readonly(&path).unwrap();
        let mut weights: Vec<f32> = store
            .task_info(Some("double"))
            .unwrap()
            .iter()
            .map(|i| i.weight)
            .collect();
        weights.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(weights, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_empty_batch() {
        let results: Vec<_> = Starmap::new(registry(), "double", args(0), &config())
            .into_iter()
            .collect();
        assert!(results.is_empty());
    }
}
