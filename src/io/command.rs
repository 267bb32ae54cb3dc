use std::path::{Path, PathBuf};
use std::process::Command;

/// How one external invocation ended.
///
/// A command that could not be started is structurally different from one
/// that ran and exited non-zero, so callers can tell "could not start"
/// from "ran and failed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    /// The process ran and exited with this non-zero code. A termination
    /// by signal is reported as code -1.
    NonZeroExit(i32),
    /// The process could not be spawned at all (missing executable,
    /// I/O error on invocation).
    LaunchFailed(String),
}

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: String,
    pub working_dir: PathBuf,
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

/// Executes external toolchain commands synchronously.
///
/// The sole seam between the orchestration core and the processing
/// toolchain. Command strings are configuration data and are interpreted
/// by the shell, matching how the toolchain scripts are distributed.
/// Invocations are independent; callers may run many concurrently.
#[derive(Debug, Default, Clone)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        CommandRunner
    }

    /// Runs one command in `working_dir`, capturing exit status, stdout
    /// and stderr. Never returns an error: every failure mode is folded
    /// into the outcome so one failing command cannot crash the run.
    pub fn run(&self, command: &str, working_dir: &Path) -> CommandOutcome {
        self.run_with_env(command, working_dir, &[])
    }

    /// Like [`run`](Self::run) with additional environment variables,
    /// used e.g. to bound the thread count of internally-parallel tools.
    pub fn run_with_env(
        &self,
        command: &str,
        working_dir: &Path,
        env: &[(&str, &str)],
    ) -> CommandOutcome {
        log::debug!("running `{}` in {}", command, working_dir.display());

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(working_dir);
        for (key, value) in env {
            cmd.env(key, value);
        }

        match cmd.output() {
            Ok(output) => {
                let status = if output.status.success() {
                    CommandStatus::Success
                } else {
                    let code = output.status.code().unwrap_or(-1);
                    CommandStatus::NonZeroExit(code)
                };
                let outcome = CommandOutcome {
                    command: command.to_string(),
                    working_dir: working_dir.to_path_buf(),
                    status,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                };
                if !outcome.success() {
                    log::warn!(
                        "`{}` exited with {:?}: {}",
                        command,
                        outcome.status,
                        outcome.stderr.trim()
                    );
                }
                outcome
            }
            Err(e) => {
                log::warn!("failed to launch `{}`: {}", command, e);
                CommandOutcome {
                    command: command.to_string(),
                    working_dir: working_dir.to_path_buf(),
                    status: CommandStatus::LaunchFailed(e.to_string()),
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_successful_command_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let outcome = CommandRunner::new().run("echo orchestrated", dir.path());
        assert!(outcome.success());
        assert_eq!(outcome.stdout.trim(), "orchestrated");
    }

    #[test]
    fn test_nonzero_exit_is_not_a_launch_failure() {
        let dir = TempDir::new().unwrap();
        let outcome = CommandRunner::new().run("exit 3", dir.path());
        assert_eq!(outcome.status, CommandStatus::NonZeroExit(3));
    }

    #[test]
    fn test_command_runs_in_working_directory() {
        let dir = TempDir::new().unwrap();
        let outcome = CommandRunner::new().run("touch marker.txt", dir.path());
        assert!(outcome.success());
        assert!(dir.path().join("marker.txt").exists());
    }

    #[test]
    fn test_env_is_passed_through() {
        let dir = TempDir::new().unwrap();
        let outcome =
            CommandRunner::new().run_with_env("echo $OMP_NUM_THREADS", dir.path(), &[("OMP_NUM_THREADS", "6")]);
        assert_eq!(outcome.stdout.trim(), "6");
    }
}
