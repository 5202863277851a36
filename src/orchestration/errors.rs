use thiserror::Error;

use super::state_machine::{PipelineEvent, PipelineState};
use crate::messaging::{EnvelopeError, MessagingError};

/// State machine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition {
        from: PipelineState,
        event: PipelineEvent,
    },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

/// Orchestration errors
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Invalid request {request_id}: {reason}")]
    InvalidRequest { request_id: String, reason: String },

    #[error("Request {request_id} is already running")]
    DuplicateRequest { request_id: String },

    #[error("Delivering outputs of {request_id} failed: {message}")]
    Delivery { request_id: String, message: String },

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl OrchestrationError {
    pub fn invalid_request(request_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            request_id: request_id.into(),
            reason: reason.into(),
        }
    }

    pub fn delivery(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Delivery {
            request_id: request_id.into(),
            message: message.into(),
        }
    }
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
