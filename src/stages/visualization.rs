//! # Visualization Worker
//!
//! Consumes `execution_visualization_queue` and renders one map per combination of
//! `year × month × day × hour × map type × map level`. Map ranges are attached to every
//! task rather than multiplied in.
//!
//! ```text
//! command → plan_render_tasks → [Semaphore(pool)] → renderer.render() → join barrier → one report
//! ```
//!
//! The pool is `min(cores, cap)`. Every task is awaited before the report goes out, and a
//! single failed task turns the whole stage into an ERROR report.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::configurator::zero_pad;
use super::errors::{StageError, StageResult};
use super::process::ProcessRunner;
use crate::constants::MAX_RENDER_WORKERS;
use crate::logging::log_stage_operation;
use crate::messaging::notifier::stage_report;
use crate::messaging::{
    HandlerError, MessageHandler, PayloadKind, ProgressNotifier, Stage, StageNotifier,
    StagePayload, VisualizationCommand,
};
use crate::orchestration::request::{AreaBounds, FileFormat, MapType};

/// One map to render
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTask {
    pub request_id: String,
    pub source_file: Option<String>,
    pub variable_name: String,
    pub pressure_levels: Vec<String>,
    pub year: String,
    pub month: String,
    pub day: String,
    pub hour: String,
    pub map_type: MapType,
    pub map_level: String,
    pub map_ranges: Vec<String>,
    pub file_format: FileFormat,
    pub area: AreaBounds,
    pub out_dir: PathBuf,
}

impl RenderTask {
    /// Short identifier used in logs and failure reports
    pub fn label(&self) -> String {
        format!(
            "{}-{}-{}T{} {} level {}",
            self.year, self.month, self.day, self.hour, self.map_type, self.map_level
        )
    }

    pub fn output_file(&self) -> PathBuf {
        self.out_dir.join(format!(
            "{}_{}_{}_{}{}{}{}.{}",
            self.variable_name,
            self.map_type,
            self.map_level,
            self.year,
            zero_pad(&self.month),
            zero_pad(&self.day),
            zero_pad(&self.hour),
            self.file_format.extension()
        ))
    }
}

/// Expand a command into its render tasks
pub fn plan_render_tasks(command: &VisualizationCommand) -> StageResult<Vec<RenderTask>> {
    let validated = command
        .request
        .validated()
        .map_err(|e| StageError::invalid_input(e.to_string()))?;
    let area = validated
        .area
        .ok_or_else(|| StageError::invalid_input("maps requested without area"))?;
    let request = &validated.request;
    let out_dir = PathBuf::from(&command.out_dir);

    let mut tasks = Vec::new();
    for year in &request.years {
        for month in &request.months {
            for day in &request.days {
                for hour in &request.hours {
                    for map_type in &validated.map_types {
                        for map_level in &request.map_levels {
                            tasks.push(RenderTask {
                                request_id: request.request_id.clone(),
                                source_file: request.source_file.clone(),
                                variable_name: request.variable_name.clone(),
                                pressure_levels: request.pressure_levels.clone(),
                                year: year.clone(),
                                month: month.clone(),
                                day: day.clone(),
                                hour: hour.clone(),
                                map_type: *map_type,
                                map_level: map_level.clone(),
                                map_ranges: request.map_ranges.clone(),
                                file_format: validated.file_format,
                                area,
                                out_dir: out_dir.clone(),
                            });
                        }
                    }
                }
            }
        }
    }
    Ok(tasks)
}

/// Draws a single map
#[async_trait]
pub trait MapRenderer: Send + Sync + 'static {
    async fn render(&self, task: &RenderTask) -> StageResult<PathBuf>;
}

/// Renders by invoking an external plotting program once per task
///
/// Arguments after the configured program are
/// `file variable year month day hour type level ranges format north west south east output`.
pub struct CommandRenderer {
    runner: Arc<dyn ProcessRunner>,
    program: Vec<String>,
}

impl std::fmt::Debug for CommandRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRenderer")
            .field("program", &self.program)
            .finish()
    }
}

impl CommandRenderer {
    pub fn new(runner: Arc<dyn ProcessRunner>, program: Vec<String>) -> Self {
        Self { runner, program }
    }

    pub fn argv(&self, task: &RenderTask) -> Vec<String> {
        let output = task.output_file();
        let mut argv = self.program.clone();
        argv.extend([
            task.source_file.clone().unwrap_or_default(),
            task.variable_name.clone(),
            task.year.clone(),
            task.month.clone(),
            task.day.clone(),
            task.hour.clone(),
            task.map_type.to_string(),
            task.map_level.clone(),
            task.map_ranges.join(","),
            task.file_format.extension().to_string(),
            task.area.north.to_string(),
            task.area.west.to_string(),
            task.area.south.to_string(),
            task.area.east.to_string(),
            output.to_string_lossy().into_owned(),
        ]);
        argv
    }
}

#[async_trait]
impl MapRenderer for CommandRenderer {
    async fn render(&self, task: &RenderTask) -> StageResult<PathBuf> {
        let argv = self.argv(task);
        let program = argv.first().cloned().ok_or(StageError::EmptyCommand)?;
        self.runner
            .run(&argv, None)
            .await
            .and_then(|output| output.into_result(&program))
            .map_err(|e| StageError::render(task.label(), e.to_string()))?;
        Ok(task.output_file())
    }
}

/// Worker pool size for a cap
pub fn pool_size(cap: usize) -> usize {
    num_cpus::get().min(cap).max(1)
}

/// Aggregated outcome of a fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutSummary {
    pub total: usize,
    pub completed: Vec<PathBuf>,
    /// `(task label, error message)`
    pub failures: Vec<(String, String)>,
}

impl FanOutSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.completed.len() == self.total
    }

    pub fn detail(&self) -> String {
        match self.failures.first() {
            None => format!("{} maps rendered", self.completed.len()),
            Some((label, message)) => format!(
                "{} of {} render tasks failed; first failure {}: {}",
                self.failures.len(),
                self.total,
                label,
                message
            ),
        }
    }
}

/// Render every task with at most `pool` in flight, waiting for all of them
pub async fn render_all(
    renderer: Arc<dyn MapRenderer>,
    tasks: Vec<RenderTask>,
    pool: usize,
) -> FanOutSummary {
    let semaphore = Arc::new(Semaphore::new(pool.max(1)));
    let mut join_set = JoinSet::new();
    let mut summary = FanOutSummary {
        total: tasks.len(),
        ..Default::default()
    };

    for task in tasks {
        let renderer = renderer.clone();
        let semaphore = semaphore.clone();
        join_set.spawn(async move {
            let label = task.label();
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return Err((label, format!("worker pool closed: {}", e))),
            };
            debug!(task = %label, "Rendering map");
            renderer
                .render(&task)
                .await
                .map_err(|e| (label, e.to_string()))
        });
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(path)) => summary.completed.push(path),
            Ok(Err((label, message))) => {
                warn!(task = %label, error = %message, "Render task failed");
                summary.failures.push((label, message));
            }
            Err(e) => {
                error!(error = %e, "Render task aborted");
                summary
                    .failures
                    .push(("unknown task".to_string(), format!("task aborted: {}", e)));
            }
        }
    }

    summary
}

pub struct VisualizationWorker {
    renderer: Arc<dyn MapRenderer>,
    notifier: StageNotifier,
    progress: ProgressNotifier,
    pool: usize,
}

impl std::fmt::Debug for VisualizationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisualizationWorker")
            .field("pool", &self.pool)
            .finish()
    }
}

impl VisualizationWorker {
    pub fn new(
        renderer: Arc<dyn MapRenderer>,
        notifier: StageNotifier,
        progress: ProgressNotifier,
    ) -> Self {
        Self {
            renderer,
            notifier,
            progress,
            pool: pool_size(MAX_RENDER_WORKERS),
        }
    }

    /// Override the pool size (still capped at the render worker limit)
    pub fn with_pool(mut self, pool: usize) -> Self {
        self.pool = pool.clamp(1, MAX_RENDER_WORKERS);
        self
    }

    pub fn pool(&self) -> usize {
        self.pool
    }

    /// Plan and render every map for a command
    pub async fn render(&self, command: &VisualizationCommand) -> StageResult<FanOutSummary> {
        let tasks = plan_render_tasks(command)?;
        tokio::fs::create_dir_all(Path::new(&command.out_dir))
            .await
            .map_err(|e| StageError::invalid_input(format!("output dir {}: {}", command.out_dir, e)))?;
        info!(request_id = %command.request_id, tasks = tasks.len(), pool = self.pool, "Starting map fan-out");
        Ok(render_all(self.renderer.clone(), tasks, self.pool).await)
    }
}

#[async_trait]
impl MessageHandler for VisualizationWorker {
    #[instrument(skip(self, body))]
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let command = match StagePayload::decode(PayloadKind::VisualizationCommand, body)? {
            (_, StagePayload::VisualizationCommand(command)) => command,
            (_, other) => {
                return Err(HandlerError::reject(format!(
                    "expected a visualization command, got {}",
                    other.kind().name()
                )))
            }
        };
        let request_id = command.request_id.clone();

        if let Err(e) = self
            .progress
            .update(&request_id, 1, "VISUALIZATION: map generation started")
            .await
        {
            warn!(request_id = %request_id, error = %e, "Progress update failed");
        }

        let report = match self.render(&command).await {
            Ok(summary) if summary.is_success() => {
                log_stage_operation("visualization", &request_id, "completed", None);
                self.notifier
                    .report_ok(stage_report(
                        &request_id,
                        Stage::Visualization,
                        summary.completed.len(),
                        0,
                        summary.detail(),
                    ))
                    .await
            }
            Ok(summary) => {
                error!(request_id = %request_id, failed = summary.failures.len(), total = summary.total, "Map generation failed");
                self.notifier
                    .report_error(stage_report(
                        &request_id,
                        Stage::Visualization,
                        summary.completed.len(),
                        summary.failures.len(),
                        summary.detail(),
                    ))
                    .await
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Map generation could not start");
                self.notifier
                    .report_error(stage_report(&request_id, Stage::Visualization, 0, 0, e.to_string()))
                    .await
            }
        };
        report.map_err(HandlerError::from)
    }

    fn name(&self) -> &'static str {
        "visualization_worker"
    }
}
