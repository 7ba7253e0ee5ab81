//! Colored tables of performance data.

use crate::memory::humansize;
use crate::store::{PerfSummary, TaskInfo};
use crate::theme::{Semantic, ThemedCell};
use comfy_table::{
    Cell, CellAlignment, ContentArrangement, Table,
    presets::{ASCII_FULL, UTF8_FULL},
};

fn new_table(ascii: bool) -> Table {
    let mut table = Table::new();
    if ascii {
        table.load_preset(ASCII_FULL);
    } else {
        table.load_preset(UTF8_FULL);
    }
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn number(text: impl ToString) -> Cell {
    Cell::new(text.to_string())
        .set_alignment(CellAlignment::Right)
        .themed(Semantic::Number)
}

/// Time, memory and counts per operation, slowest first.
pub fn build_perf_table(view: &[PerfSummary], ascii: bool) -> Table {
    let mut table = new_table(ascii);
    table.set_header(vec!["Operation", "Time (s)", "Memory (MB)", "Counts"]);
    for row in view {
        table.add_row(vec![
            Cell::new(&row.operation).themed(Semantic::Operation),
            number(format!("{:.3}", row.time_sec)),
            number(format!("{:.1}", row.memory_mb)),
            number(row.counts),
        ]);
    }
    table
}

pub fn print_perf_table(view: &[PerfSummary], ascii: bool) {
    if view.is_empty() {
        println!("No performance data.");
        return;
    }
    println!("{}", build_perf_table(view, ascii));
}

/// Tasks that ran much longer than their batch mean.
pub fn build_slow_table(slow: &[TaskInfo], ascii: bool) -> Table {
    let mut table = new_table(ascii);
    table.set_header(vec!["Task", "No", "Weight", "Duration (s)", "Received", "Mem (GB)"]);
    for info in slow {
        table.add_row(vec![
            Cell::new(&info.taskname).themed(Semantic::Operation),
            number(info.task_no),
            number(format!("{:.1}", info.weight)),
            Cell::new(format!("{:.3}", info.duration))
                .set_alignment(CellAlignment::Right)
                .themed(Semantic::Alert),
            number(humansize(info.received.max(0) as u64)),
            number(format!("{:.2}", info.mem_gb)),
        ]);
    }
    table
}

pub fn print_slow_table(slow: &[TaskInfo], ascii: bool) {
    println!("Slow tasks:");
    println!("{}", build_slow_table(slow, ascii));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perf_table_rows() {
        let view = vec![
            PerfSummary {
                operation: "total double".into(),
                time_sec: 1.5,
                memory_mb: 12.0,
                counts: 10,
            },
            PerfSummary {
                operation: "reading".into(),
                time_sec: 0.25,
                memory_mb: 0.0,
                counts: 1,
            },
        ];
        let rendered = build_perf_table(&view, true).to_string();
        assert!(rendered.contains("Operation"));
        assert!(rendered.contains("total double"));
        assert!(rendered.contains("1.500"));
        assert!(rendered.contains("reading"));
    }

    #[test]
    fn test_slow_table_rows() {
        let slow = vec![TaskInfo {
            taskname: "double".into(),
            task_no: 7,
            weight: 2.0,
            duration: 9.5,
            received: 2048,
            mem_gb: 0.5,
        }];
        let rendered = build_slow_table(&slow, true).to_string();
        assert!(rendered.contains("double"));
        assert!(rendered.contains("9.500"));
        assert!(rendered.contains("2 KB"));
    }
}
