//! Why a stdio worker died, and what becomes of the task it was running.

use crate::protocol::{TaskFailure, TaskResult};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Exited(i32),
    /// SIGKILL; on a compute node that is almost always the OOM killer.
    OutOfMemory,
    /// SIGSEGV, SIGBUS or SIGABRT.
    Crashed(Signal),
    Signaled(Signal),
    Unknown,
}

impl TerminationReason {
    /// Result reported for the task a worker was running when it died.
    ///
    /// The OOM killer yields the nil sentinel; every other death is a
    /// `WorkerLost` failure.
    pub fn lost_task_result(&self) -> TaskResult {
        match self {
            Self::OutOfMemory => TaskResult::Nil,
            other => TaskResult::Error(TaskFailure {
                kind: "WorkerLost".to_string(),
                message: format!("worker {}", other),
                chain: Vec::new(),
            }),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::OutOfMemory => f.write_str("was killed (SIGKILL), probably out of memory"),
            Self::Crashed(sig) => write!(f, "crashed with {}", sig.as_str()),
            Self::Signaled(sig) => write!(f, "was terminated by {}", sig.as_str()),
            Self::Unknown => f.write_str("vanished"),
        }
    }
}

pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::OutOfMemory,
        WaitStatus::Signaled(_, sig @ (Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGABRT), _) => {
            TerminationReason::Crashed(sig)
        }
        WaitStatus::Signaled(_, sig, _) => TerminationReason::Signaled(sig),
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_analyze_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 3)),
            TerminationReason::Exited(3)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::OutOfMemory
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            TerminationReason::Crashed(Signal::SIGSEGV)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::Unknown
        );
    }

    #[test]
    fn test_lost_task_result() {
        assert_eq!(TerminationReason::OutOfMemory.lost_task_result(), TaskResult::Nil);
        match TerminationReason::Crashed(Signal::SIGSEGV).lost_task_result() {
            TaskResult::Error(f) => {
                assert_eq!(f.kind, "WorkerLost");
                assert_eq!(f.message, "worker crashed with SIGSEGV");
            }
            other => panic!("Expected error, got {:?}", other),
        }
    }
}
