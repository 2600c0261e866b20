use crate::command::ExecutionCommand;
use serde::Serialize;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, instrument, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Failed to open execution log {path}: {source}")]
    LogFile { path: PathBuf, source: io::Error },
    #[error("Failed to spawn container runtime '{command}': {source}")]
    Spawn { command: String, source: io::Error },
    #[error("Failed waiting for container runtime: {source}")]
    Wait { source: io::Error },
    #[error("Failed to read execution log {path}: {source}")]
    ReadBack { path: PathBuf, source: io::Error },
}

/// What a finished container run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Interleaved stdout and stderr, decoded lossily.
    pub output: String,
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Runs the container synchronously with both output streams sent to one log file.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Execute `command`, writing its combined output to `log_path` and reading it back.
    ///
    /// A non-zero exit is reported, not treated as failure. With a `time_budget` the
    /// child is killed once the budget is spent and the partial output returned.
    #[instrument(skip_all, fields(log = %log_path.display()))]
    pub fn run(
        &self,
        command: &ExecutionCommand,
        log_path: &Path,
        time_budget: Option<Duration>,
    ) -> Result<ExecutionResult, RunError> {
        let log_err = |source| RunError::LogFile {
            path: log_path.to_path_buf(),
            source,
        };
        let stdout = File::create(log_path).map_err(log_err)?;
        let stderr = stdout.try_clone().map_err(log_err)?;

        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // udocker forks the workload; a fresh group lets the kill reach it.
            if time_budget.is_some() {
                cmd.process_group(0);
            }
        }

        info!("Executing {}", command.display());
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            command: command.display(),
            source,
        })?;

        let (status, timed_out) = match time_budget {
            None => (wait(child.wait())?, false),
            Some(budget) => match child
                .wait_timeout(budget)
                .map_err(|source| RunError::Wait { source })?
            {
                Some(status) => (status, false),
                None => {
                    warn!(budget_ms = budget.as_millis() as u64, "Time budget spent; killing container");
                    if let Err(err) = kill_tree(&mut child) {
                        warn!("Failed to kill container runtime: {}", err);
                    }
                    (wait(child.wait())?, true)
                }
            },
        };
        let duration = started.elapsed();

        let bytes = fs::read(log_path).map_err(|source| RunError::ReadBack {
            path: log_path.to_path_buf(),
            source,
        })?;

        let result = ExecutionResult {
            output: String::from_utf8_lossy(&bytes).into_owned(),
            exit_code: status.code(),
            duration,
            timed_out,
        };
        info!(
            exit_code = ?result.exit_code,
            duration_ms = duration.as_millis() as u64,
            "Container exited"
        );
        Ok(result)
    }
}

/// Kill the runtime and everything it spawned into its process group.
#[cfg(unix)]
fn kill_tree(child: &mut Child) -> io::Result<()> {
    let pgid = child.id() as libc::pid_t;
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        let err = io::Error::last_os_error();
        warn!("Process group kill failed ({}); killing runtime only", err);
        child.kill()
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> io::Result<()> {
    child.kill()
}

fn wait(status: io::Result<ExitStatus>) -> Result<ExitStatus, RunError> {
    status.map_err(|source| RunError::Wait { source })
}
