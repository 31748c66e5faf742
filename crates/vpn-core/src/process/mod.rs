//! External process boundary
//!
//! Every script, firewall and service-manager call in the system goes through
//! a [`ProcessRunner`]. An [`Invocation`] may name an advisory lock file; the
//! runner holds that lock (non-blocking) for the lifetime of the child, so two
//! controllers on the same host can never interleave the same operation class.

pub mod lock;
pub mod system;

pub use lock::AdvisoryLock;
pub use system::SystemProcessRunner;

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// One external process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program to execute
    pub program: String,
    /// Arguments, passed verbatim (no shell)
    pub args: Vec<String>,
    /// Working directory
    pub current_dir: Option<PathBuf>,
    /// Advisory lock held while the process runs
    pub lock: Option<PathBuf>,
}

impl Invocation {
    /// Create an invocation of `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            lock: None,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run in `dir`
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Hold the advisory lock at `path` while running
    pub fn locked_by(mut self, path: impl AsRef<Path>) -> Self {
        self.lock = Some(path.as_ref().to_path_buf());
        self
    }

    /// Prefix the invocation with `sudo -E` (environment preserved)
    pub fn elevated(self) -> Self {
        let Invocation {
            program,
            args,
            current_dir,
            lock,
        } = self;

        let mut elevated_args = Vec::with_capacity(args.len() + 2);
        elevated_args.push("-E".to_string());
        elevated_args.push(program);
        elevated_args.extend(args);

        Self {
            program: "sudo".to_string(),
            args: elevated_args,
            current_dir,
            lock,
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl ProcessOutput {
    /// Successful output with the given stdout
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the process exited with status 0
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    /// Convert a non-zero exit into [`Error::Process`]
    pub fn into_result(self, program: &str) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }

        let status = match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        let message = if stderr.is_empty() {
            status
        } else {
            format!("{}: {}", status, stderr)
        };

        Err(Error::process(program, message))
    }
}

/// Trait for process runners
///
/// # Contract
///
/// - `run()` returns `Ok` for any process that was spawned and exited, whatever
///   its status; callers decide what a non-zero exit means
/// - A held advisory lock fails the call immediately with [`Error::Lock`]
///   without spawning anything
/// - A spawn failure is an [`Error::Process`]
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `invocation` to completion
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput>;

    /// Run `invocation` and treat a non-zero exit as an error
    async fn run_checked(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        self.run(invocation).await?.into_result(&invocation.program)
    }
}
