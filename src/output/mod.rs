//! Output formatting for operator commands.

pub mod json;
pub mod table;

use crate::protocol::HostStatus;
use crate::store::{PerfSummary, TaskInfo};
use crate::theme::Themed;

/// Output format options.
#[derive(Debug, Clone, Copy, Default)]
pub enum OutputFormat {
    /// Colored table output (default).
    #[default]
    Table,
    Json,
}

/// Print the performance view and the slow tasks of a store.
pub fn print_perf(
    view: &[PerfSummary],
    slow: &[TaskInfo],
    format: OutputFormat,
    ascii: bool,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            table::print_perf_table(view, ascii);
            if !slow.is_empty() {
                println!();
                table::print_slow_table(slow, ascii);
            }
            Ok(())
        }
        OutputFormat::Json => json::print_perf_json(view, slow),
    }
}

/// One `(host, status)` line.
pub fn format_status_line(host: &str, status: HostStatus) -> String {
    let status = match status {
        HostStatus::Running => status.to_string().success(),
        HostStatus::NotRunning => status.to_string().failure(),
    };
    format!("({}, {})", host.host(), status)
}

/// Hosts as `[a, b]`.
pub fn format_host_list<S: AsRef<str>>(hosts: &[S]) -> String {
    let hosts: Vec<&str> = hosts.iter().map(AsRef::as_ref).collect();
    format!("[{}]", hosts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theme::disable_colors;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_status_line() {
        disable_colors();
        assert_eq!(
            format_status_line("127.0.0.1", HostStatus::Running),
            "(127.0.0.1, running)"
        );
        assert_eq!(
            format_status_line("node2", HostStatus::NotRunning),
            "(node2, not-running)"
        );
    }

    #[test]
    fn test_host_list() {
        assert_eq!(format_host_list(&["a", "b"]), "[a, b]");
        assert_eq!(format_host_list::<String>(&[]), "[]");
    }
}
