//! Completion-order iteration over the results of a submitted Starmap.

use super::backend::Backend;
use crate::error::{FarmError, Result};
use crate::memory::{MemoryLimits, check_mem_usage, humansize};
use crate::monitor::Monitor;
use crate::protocol::{ResultMessage, TaskMessage, TaskResult};
use crate::store::PerfStore;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Yields task values as they complete.
///
/// The first task failure (or out-of-memory signal) is yielded once as an
/// `Err` and ends the iteration; the tasks still running are abandoned at
/// that point.
pub struct IterResult {
    backend: Option<Box<dyn Backend>>,
    name: String,
    monitor: Monitor,
    store: Option<PerfStore>,
    memory: MemoryLimits,
    budget: Option<Duration>,
    submitted: usize,
    received: usize,
    next_task_no: u32,
    /// Bytes sent per positional argument.
    sent: Vec<usize>,
    received_bytes: usize,
    max_per_task: usize,
    last_percent: usize,
    pending_error: Option<FarmError>,
    done: bool,
}

/// Data moved by one or more batches of the same task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Batch name without its `#suffix`.
    pub name: String,
    /// Bytes sent per positional argument.
    pub sent: Vec<usize>,
    pub received: usize,
    pub max_per_task: usize,
    pub tasks: usize,
}

fn base_name(name: &str) -> &str {
    name.split_once('#').map_or(name, |(base, _)| base)
}

impl TransferStats {
    /// Merge the statistics of several batches; they must all belong to the
    /// same task.
    pub fn sum(stats: impl IntoIterator<Item = TransferStats>) -> Result<Self> {
        let mut total: Option<TransferStats> = None;
        for stat in stats {
            let Some(acc) = total.as_mut() else {
                total = Some(stat);
                continue;
            };
            if acc.name != stat.name {
                return Err(FarmError::InvalidArgument(format!(
                    "cannot sum the transfers of {} and {}",
                    acc.name, stat.name
                )));
            }
            if acc.sent.len() < stat.sent.len() {
                acc.sent.resize(stat.sent.len(), 0);
            }
            for (slot, bytes) in acc.sent.iter_mut().zip(&stat.sent) {
                *slot += bytes;
            }
            acc.received += stat.received;
            acc.max_per_task = acc.max_per_task.max(stat.max_per_task);
            acc.tasks += stat.tasks;
        }
        Ok(total.unwrap_or_default())
    }

    pub fn total_sent(&self) -> usize {
        self.sent.iter().sum()
    }
}

pub(crate) struct IterSettings {
    pub name: String,
    pub monitor: Monitor,
    pub store: Option<PerfStore>,
    pub memory: MemoryLimits,
    pub budget: Option<Duration>,
}

impl IterResult {
    pub(crate) fn new(backend: Box<dyn Backend>, settings: IterSettings) -> Self {
        Self {
            backend: Some(backend),
            name: settings.name,
            monitor: settings.monitor,
            store: settings.store,
            memory: settings.memory,
            budget: settings.budget,
            submitted: 0,
            received: 0,
            next_task_no: 0,
            sent: Vec::new(),
            received_bytes: 0,
            max_per_task: 0,
            last_percent: 0,
            pending_error: None,
            done: false,
        }
    }

    /// An iterator that yields `err` and nothing else.
    pub(crate) fn failed(name: impl Into<String>, err: FarmError) -> Self {
        Self {
            backend: None,
            name: name.into(),
            monitor: Monitor::new("starmap"),
            store: None,
            memory: MemoryLimits::default(),
            budget: None,
            submitted: 0,
            received: 0,
            next_task_no: 0,
            sent: Vec::new(),
            received_bytes: 0,
            max_per_task: 0,
            last_percent: 0,
            pending_error: Some(err),
            done: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks submitted so far, resubmitted ones included.
    pub fn num_tasks(&self) -> usize {
        self.submitted
    }

    fn is_private(&self) -> bool {
        self.name.starts_with('_')
    }

    /// Bytes sent and received so far.
    pub fn transfer(&self) -> TransferStats {
        TransferStats {
            name: base_name(&self.name).to_string(),
            sent: self.sent.clone(),
            received: self.received_bytes,
            max_per_task: self.max_per_task,
            tasks: self.submitted,
        }
    }

    /// Queue one task with the next task number.
    pub(crate) fn submit(&mut self, func: &str, args: Vec<Value>, weight: f32) -> Result<()> {
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| FarmError::Worker("starmap is closed".into()))?;
        if self.sent.len() < args.len() {
            self.sent.resize(args.len(), 0);
        }
        for (slot, arg) in self.sent.iter_mut().zip(&args) {
            *slot += serde_json::to_vec(arg)?.len();
        }
        let task_no = self.next_task_no;
        let task = TaskMessage {
            func: func.to_string(),
            args,
            task_no,
            weight,
            monitor: self.monitor.task_monitor(func, task_no, weight),
            backurl: None,
        };
        backend.submit(task)?;
        self.next_task_no += 1;
        self.submitted += 1;
        Ok(())
    }

    pub(crate) fn log_sent(&self) {
        let total: usize = self.sent.iter().sum();
        info!(
            task = %self.name,
            tasks = self.submitted,
            "Sent {} of data in {} task(s)",
            humansize(total as u64),
            self.submitted
        );
    }

    fn log_percent(&mut self) {
        if self.submitted == 0 {
            return;
        }
        let percent = self.received * 100 / self.submitted;
        if percent > self.last_percent {
            self.last_percent = percent;
            if self.is_private() {
                debug!(task = %self.name, "{} {:3}%", self.name, percent);
            } else {
                info!(task = %self.name, "{} {:3}%", self.name, percent);
            }
        }
    }

    fn fail(&mut self, err: FarmError) -> Option<Result<Value>> {
        if let Some(mut backend) = self.backend.take() {
            backend.abort();
        }
        self.done = true;
        Some(Err(err))
    }

    fn finish(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.shutdown();
        }
        self.done = true;
        if self.submitted == 0 {
            return;
        }
        info!(
            task = %self.name,
            "Received {} of data, maximum per task {}",
            humansize(self.received_bytes as u64),
            humansize(self.max_per_task as u64)
        );
        if let Some(store) = &self.store
            && !self.is_private()
            && let Err(e) = self.store_totals(store)
        {
            warn!(task = %self.name, error = %e, "cannot store task totals");
        }
    }

    fn store_totals(&self, store: &PerfStore) -> Result<()> {
        let sent: Map<String, Value> = self
            .sent
            .iter()
            .enumerate()
            .map(|(i, bytes)| (format!("arg{}", i), json!(bytes)))
            .collect();
        let mut row = Map::new();
        row.insert(
            self.name.clone(),
            json!({
                "sent": sent,
                "received": {
                    "tot": self.received_bytes,
                    "max_per_task": self.max_per_task,
                },
            }),
        );
        store.append_task_sent(&Value::Object(row))?;
        store.log_task_totals(&self.name)
    }

    /// Telemetry of one received result.
    fn record(&self, msg: &ResultMessage, size: usize) {
        if let Some(budget) = self.budget {
            let duration = msg.monitor.duration();
            if duration > budget.as_secs_f64() {
                warn!(
                    task = %msg.func,
                    task_no = msg.task_no,
                    duration,
                    budget = budget.as_secs_f64(),
                    "task over its duration budget"
                );
            }
        }
        let Some(store) = &self.store else {
            return;
        };
        if self.is_private() {
            return;
        }
        let stored = msg
            .monitor
            .save_task_info(store, &self.name, size, msg.mem_gb)
            .and_then(|()| msg.monitor.flush(store));
        if let Err(e) = stored {
            warn!(task = %msg.func, task_no = msg.task_no, error = %e, "cannot store task telemetry");
        }
    }
}

impl Iterator for IterResult {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            return self.fail(err);
        }
        loop {
            if self.done {
                return None;
            }
            if self.received >= self.submitted {
                self.finish();
                return None;
            }
            let backend = self.backend.as_mut()?;
            let (msg, size) = match backend.recv() {
                Ok(Some(received)) => received,
                Ok(None) => {
                    let missing = self.submitted - self.received;
                    return self.fail(FarmError::Worker(format!(
                        "backend closed with {} result(s) of {} missing",
                        missing, self.name
                    )));
                }
                Err(e) => return self.fail(e),
            };
            self.received += 1;
            self.received_bytes += size;
            self.max_per_task = self.max_per_task.max(size);
            if let Err(e) = check_mem_usage(&self.memory) {
                return self.fail(e);
            }
            self.record(&msg, size);

            let ResultMessage {
                task_no,
                func,
                result,
                ..
            } = msg;
            match result {
                TaskResult::Value(value) => {
                    self.log_percent();
                    return Some(Ok(value));
                }
                TaskResult::Error(failure) => {
                    return self.fail(FarmError::TaskFailed {
                        task: func,
                        task_no,
                        kind: failure.kind,
                        message: failure.message,
                    });
                }
                TaskResult::Nil => {
                    return self.fail(FarmError::OutOfMemory {
                        task: func,
                        task_no,
                    });
                }
                TaskResult::Resubmit(tasks) => {
                    debug!(task = %func, task_no, resubmitted = tasks.len(), "task resubmitted work");
                    for pending in tasks {
                        if let Err(e) = self.submit(&pending.func, pending.args, pending.weight) {
                            return self.fail(e);
                        }
                    }
                    self.log_percent();
                }
            }
        }
    }
}

impl Drop for IterResult {
    fn drop(&mut self) {
        // abandoned before the last result
        if let Some(mut backend) = self.backend.take() {
            backend.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::starmap::backend::SequentialBackend;
    use crate::protocol::PendingTask;
    use crate::task::{Registry, TaskError, TaskOutcome};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn registry() -> Arc<Registry> {
        let mut reg = Registry::new();
        reg.register("double", |args, _| {
            TaskOutcome::done(args[0].as_i64().unwrap_or(0) * 2)
        })
        .register("fail", |args, _| {
            if args[0] == json!(3) {
                Err(TaskError::value_error("three is bad").into())
            } else {
                TaskOutcome::done(args[0].clone())
            }
        })
        .register("oom", |_, _| Ok(TaskOutcome::Nil))
        .register("fanout", |args, _| {
            let n = args[0].as_i64().unwrap_or(0);
            Ok(TaskOutcome::Resubmit(
                (0..n).map(|i| PendingTask::new("double", vec![json!(i)])).collect(),
            ))
        });
        Arc::new(reg)
    }

    fn iter_for(name: &str, store: Option<PerfStore>) -> IterResult {
        let backend = Box::new(SequentialBackend::new(registry()));
        IterResult::new(
            backend,
            IterSettings {
                name: name.to_string(),
                monitor: Monitor::new(name),
                store,
                memory: MemoryLimits {
                    soft_percent: 100.0,
                    hard_percent: 100.0,
                    ceiling: None,
                },
                budget: None,
            },
        )
    }

    #[test]
    fn test_failure_is_raised_once() {
        let mut it = iter_for("fail", None);
        for i in 0..5 {
            it.submit("fail", vec![json!(i)], 1.0).unwrap();
        }
        let results: Vec<Result<Value>> = it.by_ref().collect();
        assert_eq!(results.len(), 4);
        assert!(results[..3].iter().all(|r| r.is_ok()));
        match &results[3] {
            Err(FarmError::TaskFailed { kind, task_no, .. }) => {
                assert_eq!(kind, "ValueError");
                assert_eq!(*task_no, 3);
            }
            other => panic!("Expected task failure, got {:?}", other),
        }
        assert!(it.next().is_none());
    }

    #[test]
    fn test_nil_is_out_of_memory() {
        let mut it = iter_for("oom", None);
        it.submit("oom", vec![], 1.0).unwrap();
        assert!(matches!(
            it.next(),
            Some(Err(FarmError::OutOfMemory { task_no: 0, .. }))
        ));
        assert!(it.next().is_none());
    }

    #[test]
    fn test_resubmit_expands_tasks() {
        let mut it = iter_for("fanout", None);
        it.submit("fanout", vec![json!(4)], 1.0).unwrap();
        let total: i64 = it.by_ref().map(|r| r.unwrap().as_i64().unwrap()).sum();
        assert_eq!(total, 12);
        assert_eq!(it.num_tasks(), 5);
    }

    #[test]
    fn test_telemetry_written_to_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("perf.db");
        let mut it = iter_for("double", Some(PerfStore::open(&path).unwrap()));
        for i in 0..3 {
            it.submit("double", vec![json!(i)], 2.0).unwrap();
        }
        assert_eq!(it.by_ref().count(), 3);

        let store = PerfStore::open_readonly(&path).unwrap();
        let infos = store.task_info(Some("double")).unwrap();
        assert_eq!(infos.len(), 3);
        assert!(infos.iter().all(|i| i.weight == 2.0 && i.received > 0));
        let sent = store.task_sent().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0]["double"]["sent"]["arg0"].as_u64().unwrap() > 0);
        assert!(store.performance_data().unwrap().iter().any(|r| r.operation == "double"));
    }

    #[test]
    fn test_private_tasks_skip_telemetry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("perf.db");
        let mut it = iter_for("_double", Some(PerfStore::open(&path).unwrap()));
        it.submit("double", vec![json!(1)], 1.0).unwrap();
        assert_eq!(it.by_ref().count(), 1);
        let store = PerfStore::open_readonly(&path).unwrap();
        assert!(store.task_info(None).unwrap().is_empty());
    }

    #[test]
    fn test_transfer_sum_merges_batches() {
        let mut first = iter_for("double#1", None);
        first.submit("double", vec![json!(1), json!("ab")], 1.0).unwrap();
        assert_eq!(first.by_ref().count(), 1);
        let mut second = iter_for("double#2", None);
        for i in 0..2 {
            second.submit("double", vec![json!(i)], 1.0).unwrap();
        }
        assert_eq!(second.by_ref().count(), 2);

        let (a, b) = (first.transfer(), second.transfer());
        assert_eq!(a.name, "double");
        assert_eq!(a.sent, vec![1, 4]);
        let total = TransferStats::sum([a.clone(), b.clone()]).unwrap();
        assert_eq!(total.name, "double");
        assert_eq!(total.sent, vec![3, 4]);
        assert_eq!(total.tasks, 3);
        assert_eq!(total.received, a.received + b.received);
        assert_eq!(total.max_per_task, a.max_per_task.max(b.max_per_task));
        assert_eq!(total.total_sent(), 7);

        let other = iter_for("fanout", None).transfer();
        assert!(TransferStats::sum([a, other]).is_err());
        assert_eq!(TransferStats::sum([]).unwrap(), TransferStats::default());
    }

    #[test]
    fn test_failed_yields_error_once() {
        let mut it = IterResult::failed("x", FarmError::InvalidArgument("bad".into()));
        assert!(matches!(it.next(), Some(Err(FarmError::InvalidArgument(_)))));
        assert!(it.next().is_none());
    }
}
