use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process '{0}' is already running")]
    AlreadyRunning(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process '{id}' exited with {status}: {stderr}")]
    Failed {
        id: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    #[error("process '{0}' was cancelled")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured output of a successful run.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

type Registry = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Registry of running child processes keyed by id.
///
/// Each run gets a child token of the caller's token, so a process stops when
/// either the caller cancels or [`ProcessManager::stop`] is called. Children are
/// spawned with `kill_on_drop`, so stopping kills them.
#[derive(Debug, Clone, Default)]
pub struct ProcessManager {
    running: Registry,
}

/// Removes the registry entry when the run ends, however it ends.
struct Registration {
    running: Registry,
    id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.running.lock().remove(&self.id);
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `command` to completion, capturing stdout and stderr.
    ///
    /// A non-zero exit is returned as [`ProcessError::Failed`] with the captured
    /// output attached.
    pub async fn run(
        &self,
        id: impl Into<String>,
        mut command: Command,
        token: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        let id = id.into();
        let child_token = token.child_token();
        {
            let mut running = self.running.lock();
            if running.contains_key(&id) {
                return Err(ProcessError::AlreadyRunning(id));
            }
            running.insert(id.clone(), child_token.clone());
        }
        let _registration = Registration {
            running: self.running.clone(),
            id: id.clone(),
        };

        let program = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .into_owned();
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        debug!(id = %id, program = %program, ?args, "starting process");

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command
            .spawn()
            .map_err(|source| ProcessError::Spawn { program, source })?;

        let output = tokio::select! {
            biased;
            _ = child_token.cancelled() => {
                warn!(id = %id, "process cancelled, killing");
                return Err(ProcessError::Cancelled(id));
            }
            output = child.wait_with_output() => output?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            warn!(id = %id, status = %output.status, "process failed");
            return Err(ProcessError::Failed {
                id,
                status: output.status,
                stdout,
                stderr,
            });
        }

        info!(id = %id, "process finished");
        Ok(ProcessOutput {
            status: output.status,
            stdout,
            stderr,
        })
    }

    /// Stop a running process. Returns false when no process has that id.
    pub fn stop(&self, id: &str) -> bool {
        match self.running.lock().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for token in self.running.lock().values() {
            token.cancel();
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.lock().contains_key(id)
    }

    /// Ids of the currently running processes.
    pub fn running(&self) -> Vec<String> {
        self.running.lock().keys().cloned().collect()
    }
}
