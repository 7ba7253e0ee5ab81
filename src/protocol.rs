//! Wire messages exchanged between submitters, workers and pools.
//!
//! Messages are JSON-serialized and newline-delimited.

use crate::error::{FarmError, Result};
use crate::ipc::{decode_frame, encode_frame};
use crate::monitor::Monitor;
use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

fn default_weight() -> f32 {
    1.0
}

/// A (function, args) pair a task asks to have submitted on its behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTask {
    pub func: String,
    pub args: Vec<Value>,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

impl PendingTask {
    pub fn new(func: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            func: func.into(),
            args,
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }
}

/// An error captured at the safely-call boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Error class, e.g. "ValueError", "Panic", "UnknownTask".
    pub kind: String,
    pub message: String,
    /// Causes below the top-level message, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

/// What came back from executing one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum TaskResult {
    Value(Value),
    Error(TaskFailure),
    /// The task ran out of memory.
    Nil,
    Resubmit(Vec<PendingTask>),
}

/// A task on its way to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub func: String,
    pub args: Vec<Value>,
    pub task_no: u32,
    pub weight: f32,
    pub monitor: Monitor,
    /// Where to push the result; `None` for the stdio protocol.
    #[serde(default)]
    pub backurl: Option<Endpoint>,
}

/// A task result on its way back to the submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub task_no: u32,
    pub func: String,
    pub result: TaskResult,
    pub monitor: Monitor,
    pub pid: u32,
    /// Resident memory of the worker after the task.
    pub mem_gb: f32,
}

/// Commands understood by a worker pool's control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Stop,
    Kill,
    #[serde(rename = "getpid")]
    GetPid,
    GetNumWorkers,
    GetExecuting,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Kill => "kill",
            Self::GetPid => "getpid",
            Self::GetNumWorkers => "get_num_workers",
            Self::GetExecuting => "get_executing",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlCommand {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stop" => Ok(Self::Stop),
            "kill" => Ok(Self::Kill),
            "getpid" => Ok(Self::GetPid),
            "get_num_workers" => Ok(Self::GetNumWorkers),
            "get_executing" => Ok(Self::GetExecuting),
            other => Err(FarmError::InvalidArgument(format!(
                "unknown control command '{}'",
                other
            ))),
        }
    }
}

/// Replies of the control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    Message(String),
    Number(u64),
    Tasks(Vec<u32>),
}

/// Liveness of a worker pool's control port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostStatus {
    Running,
    NotRunning,
}

impl HostStatus {
    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::NotRunning => "not-running",
        })
    }
}

/// Request from a process-pool parent to its stdio worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkRequest {
    Run { task: TaskMessage },
    /// Graceful shutdown request.
    Exit,
}

/// Response from a stdio worker to its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkResponse {
    /// Worker is ready for work.
    Ready,
    Done { result: ResultMessage },
}

impl WorkRequest {
    pub fn to_line(&self) -> Result<String> {
        encode_frame(self)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        decode_frame(line)
    }
}

impl WorkResponse {
    pub fn to_line(&self) -> Result<String> {
        encode_frame(self)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        decode_frame(line)
    }
}
