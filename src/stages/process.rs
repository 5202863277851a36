//! # Process Runner
//!
//! External programs (build tool, numerical executable) are started through
//! [`ProcessRunner`] so workers can be exercised without the real binaries.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::errors::{StageError, StageResult};

/// Captured outcome of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into an error
    pub fn into_result(self, program: &str) -> StageResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(StageError::ExitStatus {
                program: program.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync + 'static {
    /// Run `argv` (program first) to completion in `cwd`
    async fn run(&self, argv: &[String], cwd: Option<&Path>) -> StageResult<ProcessOutput>;

    /// Run with extra environment variables, for values that must stay off the command line
    ///
    /// Runners that cannot set variables fall back to `run`.
    async fn run_with_env(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        _env: &[(String, String)],
    ) -> StageResult<ProcessOutput> {
        self.run(argv, cwd).await
    }
}

/// Runs processes with `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner {
    default_cwd: Option<PathBuf>,
}

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory used when a call passes no `cwd`
    pub fn with_default_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.default_cwd = Some(cwd.into());
        self
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, argv: &[String], cwd: Option<&Path>) -> StageResult<ProcessOutput> {
        self.run_with_env(argv, cwd, &[]).await
    }

    async fn run_with_env(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        env: &[(String, String)],
    ) -> StageResult<ProcessOutput> {
        let (program, args) = argv.split_first().ok_or(StageError::EmptyCommand)?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        if let Some(dir) = cwd.or(self.default_cwd.as_deref()) {
            command.current_dir(dir);
        }

        debug!(program = %program, args = ?args, "Starting process");
        let output = command
            .output()
            .await
            .map_err(|e| StageError::spawn(program.as_str(), e.to_string()))?;

        let result = ProcessOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() {
            warn!(program = %program, code = ?result.code, "Process exited unsuccessfully");
        }
        Ok(result)
    }
}
