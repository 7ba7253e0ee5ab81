//! How worker pools and workers get started on a host.

use crate::paths::is_local_host;
use std::process::Command;

/// Builds the command that runs `program args...` somewhere.
pub trait ProcessLauncher: Send + Sync {
    fn command(&self, program: &str, args: &[String]) -> Command;

    /// Whether `program` refers to a path on this machine.
    fn is_local(&self) -> bool;
}

/// Run directly on this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLauncher;

impl ProcessLauncher for LocalLauncher {
    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// Run on a remote host through ssh, detached once started.
#[derive(Debug, Clone)]
pub struct SshLauncher {
    host: String,
}

impl SshLauncher {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl ProcessLauncher for SshLauncher {
    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-f", "-T", &self.host]);
        let remote = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ");
        cmd.arg(remote);
        cmd
    }

    fn is_local(&self) -> bool {
        false
    }
}

/// Run as a single-task cluster job (`srun` by default).
#[derive(Debug, Clone)]
pub struct SlurmLauncher {
    command: String,
}

impl SlurmLauncher {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for SlurmLauncher {
    fn default() -> Self {
        Self::new("srun")
    }
}

impl ProcessLauncher for SlurmLauncher {
    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(["--ntasks=1", "--cpus-per-task=1"]);
        cmd.arg(program);
        cmd.args(args);
        cmd
    }

    fn is_local(&self) -> bool {
        // cluster nodes share the submitter's filesystem
        true
    }
}

/// Local launcher for this machine, ssh for anything else.
pub fn launcher_for(host: &str) -> Box<dyn ProcessLauncher> {
    if is_local_host(host) {
        Box::new(LocalLauncher)
    } else {
        Box::new(SshLauncher::new(host))
    }
}

fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(cmd: &Command) -> Vec<String> {
        std::iter::once(cmd.get_program())
            .chain(cmd.get_args())
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_local_launcher() {
        let cmd = LocalLauncher.command("/bin/taskfarm", &args(&["pool", "--num-workers", "4"]));
        assert_eq!(argv(&cmd), vec!["/bin/taskfarm", "pool", "--num-workers", "4"]);
    }

    #[test]
    fn test_ssh_launcher_quotes_remote_command() {
        let launcher = SshLauncher::new("node7");
        let cmd = launcher.command("taskfarm", &args(&["pool", "--ctrl-url", "tcp://node7:1909", "it's"]));
        assert_eq!(
            argv(&cmd),
            vec![
                "ssh",
                "-f",
                "-T",
                "node7",
                "taskfarm pool --ctrl-url tcp://node7:1909 'it'\\''s'"
            ]
        );
        assert!(!launcher.is_local());
    }

    #[test]
    fn test_slurm_launcher() {
        let cmd = SlurmLauncher::default().command("/opt/taskfarm", &args(&["worker"]));
        assert_eq!(
            argv(&cmd),
            vec!["srun", "--ntasks=1", "--cpus-per-task=1", "/opt/taskfarm", "worker"]
        );
    }

    #[test]
    fn test_launcher_for_selects_by_host() {
        assert!(launcher_for("127.0.0.1").is_local());
        assert!(launcher_for("localhost").is_local());
        assert!(!launcher_for("203.0.113.9").is_local());
    }
}
