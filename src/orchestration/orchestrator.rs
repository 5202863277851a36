//! # Stage Orchestrator
//!
//! Drives each request through the pipeline and reacts to stage reports.
//!
//! ## Key Features
//!
//! - **Run registry**: one active run per `requestId`; a second request with the same id
//!   is refused while the first is running
//! - **Correlation**: reports are matched on `(requestId, stage)` against the stage the
//!   run is waiting for, so duplicates and stale reports are ignored
//! - **Publish-then-transition**: a command or result is published before the state
//!   changes, so a failed publish leaves the run exactly where it was and redelivery
//!   retries the same step
//! - **Result before cleanup**: outputs are uploaded, then the final result is published,
//!   and only then is the working directory released; a failed upload fails the run
//! - **Stalled-run reaper**: a TTL-dropped command produces no signal, so runs waiting on
//!   a stage longer than the stage timeout are failed by wall clock

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use super::command::{build_argv, CommandSpec};
use super::delivery::OutputUploader;
use super::errors::{OrchestrationError, OrchestrationResult};
use super::request::{PipelineRequest, ValidatedRequest};
use super::state_machine::{PipelineEvent, PipelineState, PipelineStateMachine, Transition};
use super::workspace::WorkspaceStore;
use crate::constants::{exchanges, routing_keys};
use crate::logging::log_stage_operation;
use crate::messaging::{
    ExecutionCommand, ProgressNotifier, Publisher, ResultNotifier, Stage, StagePayload,
    StageReport, VisualizationCommand,
};

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Path of the numerical executable placed in execution commands
    pub executable: String,
    /// Longest a run may wait on one stage before it is failed
    pub stage_timeout: Duration,
    /// How long finished runs are remembered for duplicate detection
    pub finished_retention: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            executable: "./FAST-IBAN".to_string(),
            stage_timeout: Duration::from_secs(3600),
            finished_retention: Duration::from_secs(3600),
        }
    }
}

/// Mutable state of one request
#[derive(Debug)]
pub struct PipelineRun {
    pub request: ValidatedRequest,
    pub machine: PipelineStateMachine,
    pub out_dir: PathBuf,
    pub execution_done: bool,
    pub maps_done: bool,
    pub maps_rendered: usize,
    pub failure: Option<String>,
}

impl PipelineRun {
    fn request_id(&self) -> &str {
        &self.request.request.request_id
    }

    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            request_id: self.request_id().to_string(),
            state: self.machine.current(),
            history: self.machine.history().to_vec(),
            out_dir: self.out_dir.clone(),
            execution_done: self.execution_done,
            maps_done: self.maps_done,
            failure: self.failure.clone(),
        }
    }
}

/// Point-in-time view of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub request_id: String,
    pub state: PipelineState,
    pub history: Vec<Transition>,
    pub out_dir: PathBuf,
    pub execution_done: bool,
    pub maps_done: bool,
    pub failure: Option<String>,
}

impl RunSnapshot {
    /// Whether the run ever passed through `state`
    pub fn visited(&self, state: PipelineState) -> bool {
        self.state == state || self.history.iter().any(|t| t.from == state || t.to == state)
    }
}

#[derive(Debug, Clone)]
struct FinishedRun {
    snapshot: RunSnapshot,
    finished_at: DateTime<Utc>,
}

/// What handling a message did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run moved to this state
    Advanced(PipelineState),
    /// Nothing changed; the message was stale, duplicated or uncorrelated
    Ignored(String),
}

pub struct Orchestrator {
    publisher: Arc<Publisher>,
    progress: ProgressNotifier,
    results: ResultNotifier,
    workspace: Arc<dyn WorkspaceStore>,
    uploader: Option<Arc<dyn OutputUploader>>,
    settings: OrchestratorSettings,
    runs: DashMap<String, Arc<Mutex<PipelineRun>>>,
    finished: DashMap<String, FinishedRun>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("delivers_outputs", &self.uploader.is_some())
            .field("active_runs", &self.runs.len())
            .field("finished_runs", &self.finished.len())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        publisher: Arc<Publisher>,
        workspace: Arc<dyn WorkspaceStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            progress: ProgressNotifier::new(publisher.clone()),
            results: ResultNotifier::new(publisher.clone()),
            publisher,
            workspace,
            uploader: None,
            settings,
            runs: DashMap::new(),
            finished: DashMap::new(),
        }
    }

    /// Upload outputs to object storage before reporting success
    pub fn with_uploader(mut self, uploader: Arc<dyn OutputUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    /// Current or final view of a run
    pub async fn snapshot(&self, request_id: &str) -> Option<RunSnapshot> {
        let active = self.runs.get(request_id).map(|r| r.value().clone());
        match active {
            Some(run) => Some(run.lock().await.snapshot()),
            None => self
                .finished
                .get(request_id)
                .map(|f| f.value().snapshot.clone()),
        }
    }

    /// Accept a configuration request and publish its first command
    ///
    /// Invalid requests are answered with an ERROR result and end in `Failed`.
    /// An `Err` means nothing was started and the message should be retried, except
    /// for `DuplicateRequest`.
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn accept_request(&self, request: PipelineRequest) -> OrchestrationResult<PipelineState> {
        let request_id = request.request_id.clone();

        if self.runs.contains_key(&request_id) || self.finished.contains_key(&request_id) {
            return Err(OrchestrationError::DuplicateRequest { request_id });
        }

        let validated = match request.validated() {
            Ok(validated) => validated,
            Err(e) => {
                warn!(error = %e, "Refusing invalid request");
                self.results.failure(&request_id, &e.to_string()).await?;
                self.remember_failed(&request_id, e.to_string());
                return Ok(PipelineState::Failed);
            }
        };

        let out_dir = self.workspace.path_for(&request_id);
        let run = PipelineRun {
            request: validated,
            machine: PipelineStateMachine::new(),
            out_dir,
            execution_done: false,
            maps_done: false,
            maps_rendered: 0,
            failure: None,
        };
        let run = Arc::new(Mutex::new(run));
        let mut guard = run.lock().await;

        match self.runs.entry(request_id.clone()) {
            Entry::Occupied(_) => return Err(OrchestrationError::DuplicateRequest { request_id }),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
            }
        }

        match self.start_run(&mut guard).await {
            Ok(state) => Ok(state),
            Err(e) => {
                // Nothing went out; forget the run so redelivery starts over
                drop(guard);
                self.runs.remove(&request_id);
                Err(e)
            }
        }
    }

    async fn start_run(&self, run: &mut PipelineRun) -> OrchestrationResult<PipelineState> {
        let request_id = run.request_id().to_string();

        if let Err(e) = self.workspace.prepare(&request_id).await {
            let message = format!("could not prepare working directory: {}", e);
            error!(request_id = %request_id, error = %e, "Workspace preparation failed");
            return self.fail_locked(run, &message).await.map(|_| PipelineState::Failed);
        }

        self.notify_progress(&request_id, "HANDLER: request accepted").await;
        for warning in run.request.warnings.clone() {
            self.notify_progress(&request_id, &format!("HANDLER: warning: {}", warning))
                .await;
        }

        log_stage_operation("configuring", &request_id, "started", None);
        self.advance(run, None).await
    }

    /// Publish the next command (or finalize) after `completed`
    async fn advance(
        &self,
        run: &mut PipelineRun,
        completed: Option<Stage>,
    ) -> OrchestrationResult<PipelineState> {
        let request = &run.request.request;
        let next = match completed {
            None if request.execution_requested() => Some(Stage::Execution),
            None | Some(Stage::Execution) if request.maps_requested() => {
                Some(Stage::Visualization)
            }
            _ => None,
        };

        match next {
            Some(Stage::Execution) => {
                self.dispatch_execution(run).await?;
                Ok(run.machine.transition(PipelineEvent::DispatchExecution)?)
            }
            Some(Stage::Visualization) => {
                self.dispatch_visualization(run).await?;
                Ok(run.machine.transition(PipelineEvent::DispatchVisualization)?)
            }
            None => self.finalize(run).await,
        }
    }

    async fn dispatch_execution(&self, run: &PipelineRun) -> OrchestrationResult<()> {
        let request = &run.request.request;
        let request_id = request.request_id.as_str();
        let area = run.request.area.ok_or_else(|| {
            OrchestrationError::invalid_request(request_id, "execution requested without area")
        })?;
        let out_dir = run.out_dir.to_string_lossy().to_string();
        let source_file = request.source_file.as_deref().unwrap_or_default();

        let argv = build_argv(&CommandSpec {
            executable: &self.settings.executable,
            source_file,
            area,
            out_dir: &out_dir,
            omp: request.omp,
            mpi: request.mpi,
            n_threads: request.n_threads,
            n_processes: request.n_processes,
        });

        let command = StagePayload::ExecutionCommand(ExecutionCommand {
            request_id: request_id.to_string(),
            argv,
            out_dir,
            source_file: request.source_file.clone(),
            no_compile: request.no_compile,
        });
        self.publisher
            .publish_payload(
                exchanges::EXECUTION,
                routing_keys::EXECUTION_ALGORITHM,
                &command,
                "",
            )
            .await?;

        log_stage_operation("execution", request_id, "dispatched", None);
        self.notify_progress(request_id, "HANDLER: execution dispatched").await;
        Ok(())
    }

    async fn dispatch_visualization(&self, run: &PipelineRun) -> OrchestrationResult<()> {
        let request = &run.request.request;
        let request_id = request.request_id.as_str();

        let command = StagePayload::VisualizationCommand(VisualizationCommand {
            request_id: request_id.to_string(),
            out_dir: run.out_dir.to_string_lossy().to_string(),
            request: request.clone(),
        });
        self.publisher
            .publish_payload(
                exchanges::EXECUTION,
                routing_keys::EXECUTION_VISUALIZATION,
                &command,
                "",
            )
            .await?;

        log_stage_operation("visualization", request_id, "dispatched", None);
        self.notify_progress(request_id, "HANDLER: visualization dispatched").await;
        Ok(())
    }

    /// Upload outputs, publish the result, then release the workspace, then `Done`
    async fn finalize(&self, run: &mut PipelineRun) -> OrchestrationResult<PipelineState> {
        let request_id = run.request_id().to_string();
        if !run.machine.can_apply(PipelineEvent::BeginFinalize) {
            return Err(super::errors::StateMachineError::InvalidTransition {
                from: run.machine.current(),
                event: PipelineEvent::BeginFinalize,
            }
            .into());
        }

        let location = match &self.uploader {
            Some(uploader) => match uploader.upload(&request_id, &run.out_dir).await {
                Ok(objects) => {
                    let count = format!("{} objects", objects.len());
                    log_stage_operation("delivery", &request_id, "uploaded", Some(&count));
                    Some(uploader.location(&request_id))
                }
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "Output delivery failed");
                    self.fail_locked(run, &e.to_string()).await?;
                    return Ok(PipelineState::Failed);
                }
            },
            None => None,
        };

        let summary = result_summary(run, location.as_deref());
        self.results.success(&request_id, &summary).await?;
        run.machine.transition(PipelineEvent::BeginFinalize)?;

        if let Err(e) = self.workspace.release(&request_id).await {
            warn!(request_id = %request_id, error = %e, "Workspace cleanup failed after result was published");
        }

        let state = run.machine.transition(PipelineEvent::Complete)?;
        log_stage_operation("finalizing", &request_id, "done", None);
        self.retire(run);
        Ok(state)
    }

    /// Handle an OK stage report
    #[instrument(skip(self, report), fields(request_id = %report.request_id, stage = %report.stage))]
    pub async fn handle_stage_report(&self, report: StageReport) -> OrchestrationResult<RunOutcome> {
        let Some(run) = self.active_run(&report.request_id) else {
            return Ok(RunOutcome::Ignored(format!(
                "no active run for request {}",
                report.request_id
            )));
        };
        let mut run = run.lock().await;

        let current = run.machine.current();
        if current.awaiting_stage() != Some(report.stage) {
            debug!(state = %current, "Ignoring report for a stage the run is not waiting on");
            return Ok(RunOutcome::Ignored(format!(
                "run is {} and not waiting on {}",
                current, report.stage
            )));
        }

        match report.stage {
            Stage::Execution => run.execution_done = true,
            Stage::Visualization => {
                run.maps_done = true;
                run.maps_rendered = report.completed_tasks;
            }
        }
        log_stage_operation(&report.stage.to_string(), &report.request_id, "completed", None);
        self.notify_progress(&report.request_id, &format!("HANDLER: {} completed", report.stage))
            .await;

        match self.advance(&mut run, Some(report.stage)).await {
            Ok(state) => Ok(RunOutcome::Advanced(state)),
            Err(e) => {
                // Redelivery must find the run still waiting on this stage
                match report.stage {
                    Stage::Execution => run.execution_done = false,
                    Stage::Visualization => run.maps_done = false,
                }
                Err(e)
            }
        }
    }

    /// Handle an ERROR report (or any rejected envelope naming a request)
    ///
    /// A failure that names its stage only counts while the run is waiting on that
    /// stage; one without a stage fails any non-terminal run.
    #[instrument(skip(self, message))]
    pub async fn handle_stage_failure(
        &self,
        request_id: Option<&str>,
        stage: Option<Stage>,
        message: &str,
    ) -> OrchestrationResult<RunOutcome> {
        let Some(request_id) = request_id else {
            error!(message = %message, "ERROR notification without request id cannot be correlated");
            return Ok(RunOutcome::Ignored("uncorrelated error notification".to_string()));
        };
        let Some(run) = self.active_run(request_id) else {
            return Ok(RunOutcome::Ignored(format!(
                "no active run for request {}",
                request_id
            )));
        };
        let mut run = run.lock().await;
        let current = run.machine.current();
        if current.is_terminal() {
            return Ok(RunOutcome::Ignored(format!("run already {}", current)));
        }
        if let Some(stage) = stage {
            if current.awaiting_stage() != Some(stage) {
                debug!(state = %current, stage = %stage, "Ignoring failure for a stage the run is not waiting on");
                return Ok(RunOutcome::Ignored(format!(
                    "run is {} and not waiting on {}",
                    current, stage
                )));
            }
        }

        self.fail_locked(&mut run, message).await?;
        Ok(RunOutcome::Advanced(PipelineState::Failed))
    }

    /// Publish an ERROR result, fail the run and release its workspace
    async fn fail_locked(&self, run: &mut PipelineRun, message: &str) -> OrchestrationResult<()> {
        let request_id = run.request_id().to_string();
        self.results.failure(&request_id, message).await?;
        run.machine.transition(PipelineEvent::Fail)?;
        run.failure = Some(message.to_string());
        log_stage_operation("failed", &request_id, message, None);

        if let Err(e) = self.workspace.release(&request_id).await {
            warn!(request_id = %request_id, error = %e, "Workspace cleanup failed for failed run");
        }
        self.retire(run);
        Ok(())
    }

    /// Fail runs that have waited on a stage longer than the stage timeout
    ///
    /// Also forgets finished runs past their retention. Returns the ids that were failed.
    pub async fn reap_stalled(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.settings.stage_timeout)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let retention = chrono::Duration::from_std(self.settings.finished_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        self.finished
            .retain(|_, finished| now - finished.finished_at < retention);

        let candidates: Vec<Arc<Mutex<PipelineRun>>> =
            self.runs.iter().map(|r| r.value().clone()).collect();
        let mut reaped = Vec::new();

        for run in candidates {
            // Busy runs are being advanced right now
            let Ok(mut run) = run.try_lock() else {
                continue;
            };
            let Some(stage) = run.machine.current().awaiting_stage() else {
                continue;
            };
            let waited = now - run.machine.entered_at();
            if waited < timeout {
                continue;
            }

            let message = format!(
                "timed out waiting for {} stage after {}s",
                stage,
                waited.num_seconds()
            );
            let request_id = run.request_id().to_string();
            match self.fail_locked(&mut run, &message).await {
                Ok(()) => {
                    warn!(request_id = %request_id, stage = %stage, "Stalled run failed");
                    reaped.push(request_id);
                }
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "Could not fail stalled run; will retry")
                }
            }
        }

        reaped
    }

    /// Run `reap_stalled` on an interval until `shutdown` flips
    pub async fn run_reaper(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = self.reap_stalled(Utc::now()).await;
                    if !reaped.is_empty() {
                        info!(count = reaped.len(), "Reaped stalled runs");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Publish an ERROR result for a request refused before it ever started
    pub async fn reject_request(&self, request_id: &str, message: &str) -> OrchestrationResult<()> {
        if self.runs.contains_key(request_id) {
            return self
                .handle_stage_failure(Some(request_id), None, message)
                .await
                .map(|_| ());
        }
        self.results.failure(request_id, message).await?;
        self.remember_failed(request_id, message.to_string());
        Ok(())
    }

    fn active_run(&self, request_id: &str) -> Option<Arc<Mutex<PipelineRun>>> {
        self.runs.get(request_id).map(|r| r.value().clone())
    }

    /// Move a terminal run out of the registry
    fn retire(&self, run: &PipelineRun) {
        let snapshot = run.snapshot();
        self.runs.remove(&snapshot.request_id);
        self.finished.insert(
            snapshot.request_id.clone(),
            FinishedRun {
                snapshot,
                finished_at: Utc::now(),
            },
        );
    }

    /// Tombstone for a request that failed before a run was created
    fn remember_failed(&self, request_id: &str, message: String) {
        let now = Utc::now();
        self.finished.insert(
            request_id.to_string(),
            FinishedRun {
                snapshot: RunSnapshot {
                    request_id: request_id.to_string(),
                    state: PipelineState::Failed,
                    history: vec![Transition {
                        from: PipelineState::Configuring,
                        to: PipelineState::Failed,
                        event: PipelineEvent::Fail,
                        at: now,
                    }],
                    out_dir: self.workspace.path_for(request_id),
                    execution_done: false,
                    maps_done: false,
                    failure: Some(message),
                },
                finished_at: now,
            },
        );
    }

    /// Progress is informational; a failed publish never blocks the run
    async fn notify_progress(&self, request_id: &str, message: &str) {
        if let Err(e) = self.progress.update(request_id, 1, message).await {
            warn!(request_id = %request_id, error = %e, "Progress update failed");
        }
    }
}

fn result_summary(run: &PipelineRun, location: Option<&str>) -> String {
    let request = &run.request.request;
    let execution = if request.execution_requested() {
        "execution completed"
    } else {
        "execution skipped"
    };
    let maps = if request.maps_requested() {
        format!("{} maps rendered", run.maps_rendered)
    } else {
        "maps skipped".to_string()
    };
    let outputs = match location {
        Some(location) => location.to_string(),
        None => run.out_dir.display().to_string(),
    };
    format!(
        "Request {} finished: {}, {}; outputs in {}",
        request.request_id, execution, maps, outputs
    )
}
