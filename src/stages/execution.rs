//! # Execution Worker
//!
//! Consumes `execution_algorithm_queue`. Each command optionally rebuilds the numerical
//! executable (skipped when `noCompile`), runs the argv from the command and reports the
//! outcome on `notifications/notify.handler`.
//!
//! The executable runs inside `work_dir`, so relative output and input paths in a
//! command are resolved against the worker's own directory before anything runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use super::errors::{StageError, StageResult};
use super::process::{ProcessOutput, ProcessRunner};
use crate::logging::log_stage_operation;
use crate::messaging::notifier::stage_report;
use crate::messaging::{
    ExecutionCommand, HandlerError, MessageHandler, PayloadKind, ProgressNotifier, Stage,
    StageNotifier, StagePayload,
};

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Directory the build steps and the executable run in
    pub work_dir: PathBuf,
    /// Build commands run in order before execution
    pub build_steps: Vec<Vec<String>>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("build"),
            build_steps: vec![
                vec!["cmake".to_string(), "..".to_string()],
                vec!["cmake".to_string(), "--build".to_string(), ".".to_string()],
            ],
        }
    }
}

pub struct ExecutionWorker {
    runner: Arc<dyn ProcessRunner>,
    notifier: StageNotifier,
    progress: ProgressNotifier,
    settings: ExecutionSettings,
}

impl std::fmt::Debug for ExecutionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionWorker")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ExecutionWorker {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        notifier: StageNotifier,
        progress: ProgressNotifier,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            runner,
            notifier,
            progress,
            settings,
        }
    }

    /// Build (unless skipped) and run one command
    pub async fn execute(&self, command: &ExecutionCommand) -> StageResult<ProcessOutput> {
        let command = resolve_paths(command)?;
        tokio::fs::create_dir_all(&self.settings.work_dir)
            .await
            .map_err(|e| StageError::spawn("build", format!("work dir: {}", e)))?;
        tokio::fs::create_dir_all(&command.out_dir)
            .await
            .map_err(|e| StageError::invalid_input(format!("output dir {}: {}", command.out_dir, e)))?;

        if !command.no_compile {
            for step in &self.settings.build_steps {
                let program = step.first().cloned().unwrap_or_default();
                self.runner
                    .run(step, Some(self.settings.work_dir.as_path()))
                    .await?
                    .into_result(&program)?;
            }
            log_stage_operation("execution", &command.request_id, "build finished", None);
        }

        let program = command.argv.first().ok_or(StageError::EmptyCommand)?;
        self.runner
            .run(&command.argv, Some(self.settings.work_dir.as_path()))
            .await?
            .into_result(program)
    }
}

fn absolute(path: &str) -> StageResult<String> {
    std::path::absolute(Path::new(path))
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|e| StageError::invalid_input(format!("cannot resolve {}: {}", path, e)))
}

/// Rewrite relative `out_dir` and source file, in the command and in its argv, as absolute paths
fn resolve_paths(command: &ExecutionCommand) -> StageResult<ExecutionCommand> {
    let out_dir = absolute(&command.out_dir)?;
    let source_file = command.source_file.as_deref().map(absolute).transpose()?;

    let argv = command
        .argv
        .iter()
        .map(|arg| {
            if *arg == command.out_dir {
                out_dir.clone()
            } else if Some(arg) == command.source_file.as_ref() {
                source_file.clone().unwrap_or_else(|| arg.clone())
            } else {
                arg.clone()
            }
        })
        .collect();

    Ok(ExecutionCommand {
        request_id: command.request_id.clone(),
        argv,
        out_dir,
        source_file,
        no_compile: command.no_compile,
    })
}

#[async_trait]
impl MessageHandler for ExecutionWorker {
    #[instrument(skip(self, body))]
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let command = match StagePayload::decode(PayloadKind::ExecutionCommand, body)? {
            (_, StagePayload::ExecutionCommand(command)) => command,
            (_, other) => {
                return Err(HandlerError::reject(format!(
                    "expected an execution command, got {}",
                    other.kind().name()
                )))
            }
        };
        let request_id = command.request_id.clone();

        info!(request_id = %request_id, argv = ?command.argv, no_compile = command.no_compile, "Running execution command");
        if let Err(e) = self
            .progress
            .update(&request_id, 1, "EXECUTION: command received")
            .await
        {
            warn!(request_id = %request_id, error = %e, "Progress update failed");
        }

        let report = match self.execute(&command).await {
            Ok(output) => {
                log_stage_operation("execution", &request_id, "completed", None);
                let detail = format!("execution finished ({} bytes of output)", output.stdout.len());
                self.notifier
                    .report_ok(stage_report(&request_id, Stage::Execution, 1, 0, detail))
                    .await
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Execution failed");
                self.notifier
                    .report_error(stage_report(&request_id, Stage::Execution, 0, 1, e.to_string()))
                    .await
            }
        };
        report.map_err(HandlerError::from)
    }

    fn name(&self) -> &'static str {
        "execution_worker"
    }
}
