//! Built-in tasks of the `taskfarm` binary.
//!
//! Every worker started from this binary knows them, so `workers debug`
//! can exercise a cluster without user code.

use crate::memory::MemoryExhausted;
use crate::protocol::PendingTask;
use crate::task::{Registry, TaskError, TaskOutcome};
use anyhow::Context;
use serde_json::{Value, json};
use std::thread;
use std::time::Duration;

fn int_arg(args: &[Value], idx: usize, task: &str) -> anyhow::Result<i64> {
    args.get(idx)
        .and_then(Value::as_i64)
        .with_context(|| format!("{} expects an integer argument #{}", task, idx))
}

/// Registry holding the diagnostic tasks.
pub fn registry() -> Registry {
    let mut reg = Registry::new();
    reg.register("_wakeup", |args, _| {
        let secs = args.first().and_then(Value::as_f64).unwrap_or(0.0).max(0.0);
        thread::sleep(Duration::from_secs_f64(secs));
        TaskOutcome::done(std::process::id())
    })
    .register("double", |args, _| {
        let x = int_arg(args, 0, "double")?;
        TaskOutcome::done(x * 2)
    })
    // fail(x, bad[, delay]): raises ValueError for x == bad, otherwise
    // returns x after `delay` seconds
    .register("fail", |args, _| {
        let x = int_arg(args, 0, "fail")?;
        let bad = args.get(1).and_then(Value::as_i64).unwrap_or(0);
        if x == bad {
            return Err(TaskError::value_error(format!("refusing to process {}", x)).into());
        }
        if let Some(delay) = args.get(2).and_then(Value::as_f64) {
            thread::sleep(Duration::from_secs_f64(delay.max(0.0)));
        }
        TaskOutcome::done(x)
    })
    // exhaust(x, bad): runs out of memory for x == bad
    .register("exhaust", |args, _| {
        let x = int_arg(args, 0, "exhaust")?;
        let bad = args.get(1).and_then(Value::as_i64).unwrap_or(0);
        if x == bad {
            return Err(MemoryExhausted(format!("task {} asked for too much", x)).into());
        }
        TaskOutcome::done(x)
    })
    .register("fanout", |args, _| {
        let n = int_arg(args, 0, "fanout")?;
        Ok(TaskOutcome::Resubmit(
            (0..n)
                .map(|i| PendingTask::new("double", vec![json!(i)]))
                .collect(),
        ))
    });
    reg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Monitor;

    fn call(name: &str, args: Vec<Value>) -> anyhow::Result<TaskOutcome> {
        let reg = registry();
        let f = reg.get(name).unwrap();
        f(&args, &Monitor::new(name))
    }

    #[test]
    fn test_diagnostic_tasks() {
        assert!(matches!(call("double", vec![json!(21)]).unwrap(), TaskOutcome::Done(v) if v == json!(42)));
        assert!(matches!(
            call("_wakeup", vec![json!(0)]).unwrap(),
            TaskOutcome::Done(v) if v == json!(std::process::id())
        ));
        assert!(matches!(call("fanout", vec![json!(3)]).unwrap(), TaskOutcome::Resubmit(t) if t.len() == 3));
    }

    #[test]
    fn test_failing_tasks() {
        let err = call("fail", vec![json!(2), json!(2)]).unwrap_err();
        assert_eq!(err.downcast_ref::<TaskError>().unwrap().kind, "ValueError");
        assert!(call("fail", vec![json!(1), json!(2)]).is_ok());

        let err = call("exhaust", vec![json!(0)]).unwrap_err();
        assert!(err.downcast_ref::<MemoryExhausted>().is_some());

        assert!(call("double", vec![json!("x")]).is_err());
    }
}
