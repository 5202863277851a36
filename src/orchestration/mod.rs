//! # Orchestration Engine
//!
//! Drives a pipeline request from configuration to its final result.
//!
//! ## Core Components
//!
//! - **PipelineRequest**: wire model of a request plus its validation rules
//! - **Command table**: `(omp, mpi)` lookup producing the execution argv
//! - **PipelineStateMachine**: per-request state with a guarded transition table
//! - **Orchestrator**: run registry, stage dispatch, report correlation and the stalled-run reaper
//! - **Intake handlers**: consumer handlers that feed requests and reports into the orchestrator
//! - **WorkspaceStore**: per-request working directory

pub mod command;
pub mod delivery;
pub mod errors;
pub mod intake;
pub mod orchestrator;
pub mod request;
pub mod state_machine;
pub mod workspace;

pub use command::{build_argv, template_for, CommandSpec, CommandTemplate, Launcher, ThreadSlot};
pub use delivery::{CommandUploader, ObjectStoreTarget, OutputUploader};
pub use errors::{OrchestrationError, OrchestrationResult, StateMachineError, StateMachineResult};
pub use intake::{NotificationIntake, RequestIntake};
pub use orchestrator::{Orchestrator, OrchestratorSettings, PipelineRun, RunOutcome, RunSnapshot};
pub use request::{AreaBounds, FileFormat, MapType, PipelineRequest, ValidatedRequest};
pub use state_machine::{
    determine_target_state, PipelineEvent, PipelineState, PipelineStateMachine, Transition,
};
pub use workspace::{DirectoryWorkspace, WorkspaceStore};
