//! # Stage Worker Errors

use thiserror::Error;

use crate::messaging::{EnvelopeError, MessagingError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("Could not start {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} exited with {}: {stderr}", describe_exit(.code))]
    ExitStatus {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Empty command line")]
    EmptyCommand,

    #[error("Data preparation failed: {message}")]
    Preparation { message: String },

    #[error("Render task {task} failed: {message}")]
    Render { task: String, message: String },

    #[error("Invalid stage input: {message}")]
    InvalidInput { message: String },

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl StageError {
    pub fn spawn(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Spawn {
            program: program.into(),
            message: message.into(),
        }
    }

    pub fn preparation(message: impl Into<String>) -> Self {
        Self::Preparation {
            message: message.into(),
        }
    }

    pub fn render(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Render {
            task: task.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

pub type StageResult<T> = Result<T, StageError>;

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}
