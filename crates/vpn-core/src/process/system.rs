// # System Process Runner
//
// ProcessRunner backed by `tokio::process`.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AdvisoryLock, Invocation, ProcessOutput, ProcessRunner};
use crate::error::{Error, Result};

/// Runs invocations as real child processes
///
/// Standard input is closed; standard output and error are captured. The child
/// is killed if the awaiting task is cancelled.
#[derive(Debug, Clone, Default)]
pub struct SystemProcessRunner;

impl SystemProcessRunner {
    /// Create a new runner
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        let _lock = match &invocation.lock {
            Some(path) => {
                let lock = AdvisoryLock::try_acquire(path).inspect_err(|e| {
                    warn!("Not running {}: {}", invocation.program, e);
                })?;
                Some(lock)
            }
            None => None,
        };

        debug!("Running: {}", invocation);

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        let output = command.output().await.map_err(|e| {
            Error::process(&invocation.program, format!("Failed to spawn: {}", e))
        })?;

        let output = ProcessOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!("{} exited with {:?}", invocation.program, output.code);
        Ok(output)
    }
}
