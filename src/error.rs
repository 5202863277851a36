use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::{EnvelopeError, MessagingError};
use crate::orchestration::{OrchestrationError, StateMachineError};
use crate::stages::StageError;

/// Crate-level error aggregating every subsystem
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Stage(#[from] StageError),
}

impl PipelineError {
    /// Whether retrying the same operation later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Messaging(e) | Self::Orchestration(OrchestrationError::Messaging(e)) => {
                e.is_transient()
            }
            Self::Stage(StageError::Messaging(e)) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_keep_message() {
        let err: PipelineError = MessagingError::connection("refused").into();
        assert_eq!(err.to_string(), "Broker connection error: refused");

        let err: PipelineError = StageError::EmptyCommand.into();
        assert!(!err.is_transient());
    }
}
