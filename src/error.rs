//! Error types for taskfarm.

use crate::protocol::HostStatus;
use std::time::Duration;
use thiserror::Error;

/// Main error type for taskfarm.
#[derive(Error, Debug)]
pub enum FarmError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Failed to launch '{program}': {message}")]
    Launch { program: String, message: String },

    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    /// A task raised; re-raised once at the point its result would be consumed.
    #[error("Task {task}#{task_no} failed with {kind}: {message}")]
    TaskFailed {
        task: String,
        task_no: u32,
        kind: String,
        message: String,
    },

    /// A task produced the nil sentinel.
    #[error("Task {task}#{task_no} ran out of memory")]
    OutOfMemory { task: String, task_no: u32 },

    #[error("{0}")]
    MemoryLimit(String),

    #[error("Timeout after {}s waiting for workers: {}", .waited.as_secs(), format_status(.status))]
    Timeout {
        waited: Duration,
        status: Vec<(String, HostStatus)>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Monitor '{0}' has no scratch store configured")]
    NoScratch(String),

    #[error("Scratch key '{0}' not found")]
    ScratchKey(String),
}

fn format_status(status: &[(String, HostStatus)]) -> String {
    status
        .iter()
        .map(|(host, st)| format!("{} {}", host, st))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for taskfarm operations.
pub type Result<T> = std::result::Result<T, FarmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_task_failed_message() {
        let err = FarmError::TaskFailed {
            task: "double".to_string(),
            task_no: 3,
            kind: "ValueError".to_string(),
            message: "bad input".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("double#3"));
        assert!(msg.contains("ValueError"));
        assert!(msg.contains("bad input"));
    }

    #[test]
    fn test_out_of_memory_message() {
        let err = FarmError::OutOfMemory {
            task: "exhaust".to_string(),
            task_no: 1,
        };
        assert!(err.to_string().contains("out of memory"));
    }

    #[test]
    fn test_timeout_carries_status() {
        let err = FarmError::Timeout {
            waited: Duration::from_secs(2),
            status: vec![
                ("127.0.0.1".to_string(), HostStatus::NotRunning),
                ("10.0.0.2".to_string(), HostStatus::Running),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2s"));
        assert!(msg.contains("127.0.0.1 not-running"));
        assert!(msg.contains("10.0.0.2 running"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: FarmError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: FarmError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_database_error_conversion() {
        let result = rusqlite::Connection::open("/");
        if let Err(db_err) = result {
            let err: FarmError = db_err.into();
            assert!(err.to_string().contains("Database"));
        }
    }
}
