//! JSON output of performance data.

use crate::store::{PerfSummary, TaskInfo};
use serde_json::json;

pub fn perf_json(view: &[PerfSummary], slow: &[TaskInfo]) -> serde_json::Value {
    json!({
        "performance": view,
        "slow_tasks": slow,
    })
}

/// Print the performance view and slow tasks as one JSON document.
pub fn print_perf_json(view: &[PerfSummary], slow: &[TaskInfo]) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&perf_json(view, slow))?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perf_json_shape() {
        let view = vec![PerfSummary {
            operation: "double".into(),
            time_sec: 0.5,
            memory_mb: 1.0,
            counts: 3,
        }];
        let value = perf_json(&view, &[]);
        assert_eq!(value["performance"][0]["operation"], "double");
        assert_eq!(value["performance"][0]["counts"], 3);
        assert!(value["slow_tasks"].as_array().unwrap().is_empty());
    }
}
