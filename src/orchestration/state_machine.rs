//! # Pipeline State Machine
//!
//! ```text
//! Configuring -> AwaitingExecution -> AwaitingVisualization -> Finalizing -> Done
//!      |                 |                                        ^
//!      |                 +------------ (noMaps) ------------------+
//!      +--- (noExecute) --> AwaitingVisualization                 |
//!      +--- (noExecute + noMaps) ---------------------------------+
//!
//! any non-terminal state --Fail--> Failed
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{StateMachineError, StateMachineResult};
use crate::messaging::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Request accepted, first command not yet out
    Configuring,
    /// Execution command published, waiting for its report
    AwaitingExecution,
    /// Visualization command published, waiting for its report
    AwaitingVisualization,
    /// Publishing the result and releasing working storage
    Finalizing,
    Done,
    Failed,
}

impl PipelineState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Stage whose report this state is waiting for
    pub fn awaiting_stage(&self) -> Option<Stage> {
        match self {
            Self::AwaitingExecution => Some(Stage::Execution),
            Self::AwaitingVisualization => Some(Stage::Visualization),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuring => write!(f, "configuring"),
            Self::AwaitingExecution => write!(f, "awaiting_execution"),
            Self::AwaitingVisualization => write!(f, "awaiting_visualization"),
            Self::Finalizing => write!(f, "finalizing"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEvent {
    DispatchExecution,
    DispatchVisualization,
    BeginFinalize,
    Complete,
    Fail,
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DispatchExecution => write!(f, "dispatch_execution"),
            Self::DispatchVisualization => write!(f, "dispatch_visualization"),
            Self::BeginFinalize => write!(f, "begin_finalize"),
            Self::Complete => write!(f, "complete"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Target state for an event, or an invalid-transition error
pub fn determine_target_state(
    current: PipelineState,
    event: PipelineEvent,
) -> StateMachineResult<PipelineState> {
    use PipelineEvent::*;
    use PipelineState::*;

    let target = match (current, event) {
        (Configuring, DispatchExecution) => AwaitingExecution,
        (Configuring, DispatchVisualization) => AwaitingVisualization,
        (Configuring, BeginFinalize) => Finalizing,

        (AwaitingExecution, DispatchVisualization) => AwaitingVisualization,
        (AwaitingExecution, BeginFinalize) => Finalizing,

        (AwaitingVisualization, BeginFinalize) => Finalizing,

        (Finalizing, Complete) => Done,

        (state, Fail) if !state.is_terminal() => Failed,

        (from, event) => return Err(StateMachineError::InvalidTransition { from, event }),
    };

    Ok(target)
}

/// One applied transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub event: PipelineEvent,
    pub at: DateTime<Utc>,
}

/// Per-request state machine with its transition history
#[derive(Debug, Clone)]
pub struct PipelineStateMachine {
    current: PipelineState,
    entered_at: DateTime<Utc>,
    history: Vec<Transition>,
}

impl Default for PipelineStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStateMachine {
    pub fn new() -> Self {
        Self {
            current: PipelineState::Configuring,
            entered_at: Utc::now(),
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> PipelineState {
        self.current
    }

    /// When the current state was entered
    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Check an event without applying it
    pub fn can_apply(&self, event: PipelineEvent) -> bool {
        determine_target_state(self.current, event).is_ok()
    }

    pub fn transition(&mut self, event: PipelineEvent) -> StateMachineResult<PipelineState> {
        let target = determine_target_state(self.current, event)?;
        let now = Utc::now();
        self.history.push(Transition {
            from: self.current,
            to: target,
            event,
            at: now,
        });
        self.current = target;
        self.entered_at = now;
        Ok(target)
    }
}
