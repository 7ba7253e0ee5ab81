//! Task functions and the safely-call boundary.

use crate::memory::{MemoryExhausted, own_rss_bytes};
use crate::monitor::Monitor;
use crate::protocol::{PendingTask, ResultMessage, TaskFailure, TaskMessage, TaskResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// What a task function hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Done(Value),
    /// Unrecoverable out-of-memory.
    Nil,
    /// Submit these tasks instead of producing a value.
    Resubmit(Vec<PendingTask>),
}

impl TaskOutcome {
    pub fn done<T: Serialize>(value: T) -> anyhow::Result<Self> {
        Ok(Self::Done(serde_json::to_value(value)?))
    }
}

/// Typed error a task can raise to control the reported error kind.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }
}

pub type TaskFn = Arc<dyn Fn(&[Value], &Monitor) -> anyhow::Result<TaskOutcome> + Send + Sync>;

/// Named task functions known to a worker.
///
/// Submitters and workers must register the same names.
#[derive(Clone, Default)]
pub struct Registry {
    tasks: HashMap<String, TaskFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&[Value], &Monitor) -> anyhow::Result<TaskOutcome> + Send + Sync + 'static,
    {
        self.tasks.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("tasks", &self.names()).finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn capture_error(err: anyhow::Error) -> TaskResult {
    if err.downcast_ref::<MemoryExhausted>().is_some() {
        return TaskResult::Nil;
    }
    let (kind, message) = match err.downcast_ref::<TaskError>() {
        Some(te) => (te.kind.clone(), te.message.clone()),
        None => ("Error".to_string(), err.to_string()),
    };
    TaskResult::Error(TaskFailure {
        kind,
        message,
        chain: err.chain().skip(1).map(|cause| cause.to_string()).collect(),
    })
}

/// Run a task, never letting an error or panic escape.
///
/// The task is timed by its own monitor, which travels back with the result.
pub fn safely_call(registry: &Registry, task: TaskMessage) -> ResultMessage {
    let TaskMessage {
        func,
        args,
        task_no,
        monitor,
        ..
    } = task;

    let result = match registry.get(&func) {
        None => TaskResult::Error(TaskFailure {
            kind: "UnknownTask".to_string(),
            message: format!("no task named '{}' in this worker", func),
            chain: Vec::new(),
        }),
        Some(f) => {
            let outcome = {
                let _guard = monitor.enter();
                panic::catch_unwind(AssertUnwindSafe(|| f(&args, &monitor)))
            };
            match outcome {
                Ok(Ok(TaskOutcome::Done(value))) => TaskResult::Value(value),
                Ok(Ok(TaskOutcome::Nil)) => TaskResult::Nil,
                Ok(Ok(TaskOutcome::Resubmit(tasks))) => TaskResult::Resubmit(tasks),
                Ok(Err(err)) => {
                    monitor.record_error(err.to_string());
                    capture_error(err)
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    monitor.record_error(message.clone());
                    TaskResult::Error(TaskFailure {
                        kind: "Panic".to_string(),
                        message,
                        chain: Vec::new(),
                    })
                }
            }
        }
    };

    match &result {
        TaskResult::Error(failure) => {
            tracing::debug!(task = %func, task_no, kind = %failure.kind, "task failed")
        }
        TaskResult::Nil => tracing::warn!(task = %func, task_no, "task ran out of memory"),
        _ => tracing::trace!(task = %func, task_no, "task done"),
    }

    let mem_gb = own_rss_bytes().unwrap_or(0) as f64 / (1024.0 * 1024.0 * 1024.0);
    ResultMessage {
        task_no,
        func,
        result,
        monitor,
        pid: std::process::id(),
        mem_gb: mem_gb as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use serde_json::json;

    fn registry() -> Registry {
        let mut reg = Registry::new();
        reg.register("double", |args, _| {
            let x = args.first().and_then(Value::as_i64).unwrap_or(0);
            TaskOutcome::done(x * 2)
        })
        .register("fail", |_, _| Err(TaskError::value_error("bad value").into()))
        .register("context", |_, _| {
            Err(anyhow::anyhow!("root cause")).context("while loading")
        })
        .register("panic", |_, _| panic!("kaboom"))
        .register("oom", |_, _| Err(MemoryExhausted("10 GB".into()).into()))
        .register("split", |_, _| {
            Ok(TaskOutcome::Resubmit(vec![PendingTask::new("double", vec![json!(1)])]))
        });
        reg
    }

    fn message(func: &str, args: Vec<Value>) -> TaskMessage {
        TaskMessage {
            func: func.into(),
            args,
            task_no: 4,
            weight: 1.0,
            monitor: Monitor::new(func),
            backurl: None,
        }
    }

    #[test]
    fn test_value() {
        let out = safely_call(&registry(), message("double", vec![json!(21)]));
        assert_eq!(out.result, TaskResult::Value(json!(42)));
        assert_eq!(out.task_no, 4);
        assert_eq!(out.pid, std::process::id());
        assert_eq!(out.monitor.count(), 1);
    }

    #[test]
    fn test_typed_error_kind() {
        let out = safely_call(&registry(), message("fail", vec![]));
        match out.result {
            TaskResult::Error(f) => {
                assert_eq!(f.kind, "ValueError");
                assert_eq!(f.message, "bad value");
            }
            other => panic!("Expected error, got {:?}", other),
        }
        assert_eq!(out.monitor.error().as_deref(), Some("ValueError: bad value"));
    }

    #[test]
    fn test_error_chain() {
        let out = safely_call(&registry(), message("context", vec![]));
        match out.result {
            TaskResult::Error(f) => {
                assert_eq!(f.kind, "Error");
                assert_eq!(f.message, "while loading");
                assert_eq!(f.chain, vec!["root cause".to_string()]);
            }
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_panic_is_captured() {
        let out = safely_call(&registry(), message("panic", vec![]));
        match out.result {
            TaskResult::Error(f) => {
                assert_eq!(f.kind, "Panic");
                assert_eq!(f.message, "kaboom");
            }
            other => panic!("Expected error, got {:?}", other),
        }
        assert_eq!(out.monitor.count(), 1);
    }

    #[test]
    fn test_memory_exhausted_is_nil() {
        let out = safely_call(&registry(), message("oom", vec![]));
        assert_eq!(out.result, TaskResult::Nil);
    }

    #[test]
    fn test_resubmit_and_unknown() {
        let out = safely_call(&registry(), message("split", vec![]));
        assert!(matches!(out.result, TaskResult::Resubmit(ref t) if t.len() == 1));

        let out = safely_call(&registry(), message("missing", vec![]));
        assert!(matches!(out.result, TaskResult::Error(ref f) if f.kind == "UnknownTask"));
    }

    #[test]
    fn test_registry_names_sorted() {
        let reg = registry();
        assert_eq!(reg.names()[0], "context");
        assert!(reg.contains("split"));
        assert!(reg.get("nope").is_none());
    }
}
