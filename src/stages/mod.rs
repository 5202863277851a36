//! # Stage Workers
//!
//! Thin consumers for the pipeline stages that run outside the orchestrator. Each one
//! decodes its command, hands the real work to a collaborator trait and reports back.
//!
//! - [`Configurator`]: `config_queue` → data preparation → `requests/handler.start`
//! - [`ExecutionWorker`]: `execution_algorithm_queue` → build + run → stage report
//! - [`VisualizationWorker`]: `execution_visualization_queue` → bounded render fan-out → stage report

pub mod configurator;
pub mod errors;
pub mod execution;
pub mod process;
pub mod visualization;

pub use configurator::{
    format_range, mount_file_name, zero_pad, CommandPreparer, Configurator, DataPreparer,
};
pub use errors::{StageError, StageResult};
pub use execution::{ExecutionSettings, ExecutionWorker};
pub use process::{ProcessOutput, ProcessRunner, TokioProcessRunner};
pub use visualization::{
    plan_render_tasks, pool_size, render_all, CommandRenderer, FanOutSummary, MapRenderer,
    RenderTask, VisualizationWorker,
};
