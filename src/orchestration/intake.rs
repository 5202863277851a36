//! # Orchestrator Intake
//!
//! Consumer-side handlers that feed the [`Orchestrator`]: one for accepted configuration
//! requests (`handler_queue`) and one for stage completion reports (`notifications_queue`).
//! Both translate orchestration errors into the consumer's ack policy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::errors::OrchestrationError;
use super::orchestrator::{Orchestrator, RunOutcome};
use crate::messaging::{
    Envelope, EnvelopeError, HandlerError, MessageHandler, PayloadKind, Stage, StagePayload,
};

/// Ack policy for an orchestration failure
fn classify(err: OrchestrationError) -> HandlerError {
    match err {
        OrchestrationError::Messaging(e) => e.into(),
        other => HandlerError::reject(other.to_string()),
    }
}

/// Handles configured requests arriving on `requests/handler.start`
#[derive(Debug, Clone)]
pub struct RequestIntake {
    orchestrator: Arc<Orchestrator>,
}

impl RequestIntake {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Answer a request that could not be read with an ERROR result, if it named itself
    async fn refuse(&self, request_id: Option<&str>, message: &str) -> Result<(), HandlerError> {
        match request_id {
            Some(id) => {
                warn!(request_id = %id, message = %message, "Refusing unreadable request");
                self.orchestrator
                    .reject_request(id, message)
                    .await
                    .map_err(classify)
            }
            None => Err(HandlerError::reject(message.to_string())),
        }
    }
}

#[async_trait]
impl MessageHandler for RequestIntake {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let envelope = match Envelope::decode(body) {
            Ok(envelope) => envelope,
            Err(e @ EnvelopeError::Rejected { .. }) => {
                return self.refuse(e.request_id(), &e.to_string()).await;
            }
            Err(e) => return Err(e.into()),
        };

        let request = match StagePayload::from_envelope(PayloadKind::ConfigRequest, &envelope) {
            Ok(StagePayload::ConfigRequest(request)) => request,
            Ok(other) => {
                return Err(HandlerError::reject(format!(
                    "expected a config request, got {}",
                    other.kind().name()
                )))
            }
            Err(e) => return self.refuse(envelope.request_id.as_deref(), &e.to_string()).await,
        };

        match self.orchestrator.accept_request(request).await {
            Ok(state) => {
                info!(state = %state, "Request accepted");
                Ok(())
            }
            Err(OrchestrationError::DuplicateRequest { request_id }) => {
                warn!(request_id = %request_id, "Duplicate request acknowledged and ignored");
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }

    fn name(&self) -> &'static str {
        "request_intake"
    }
}

/// Handles stage reports arriving on `notifications/notify.handler`
#[derive(Debug, Clone)]
pub struct NotificationIntake {
    orchestrator: Arc<Orchestrator>,
}

impl NotificationIntake {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl MessageHandler for NotificationIntake {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let outcome = match StagePayload::decode(PayloadKind::StageReport, body) {
            Ok((_, StagePayload::StageReport(report))) => {
                self.orchestrator.handle_stage_report(report).await
            }
            Ok((_, other)) => {
                return Err(HandlerError::reject(format!(
                    "expected a stage report, got {}",
                    other.kind().name()
                )))
            }
            Err(EnvelopeError::Rejected {
                request_id,
                stage,
                message,
            }) => {
                let stage = stage.as_deref().and_then(Stage::from_name);
                self.orchestrator
                    .handle_stage_failure(request_id.as_deref(), stage, &message)
                    .await
            }
            Err(e) => return Err(e.into()),
        };

        match outcome.map_err(classify)? {
            RunOutcome::Advanced(state) => debug!(state = %state, "Notification advanced run"),
            RunOutcome::Ignored(reason) => debug!(reason = %reason, "Notification ignored"),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "notification_intake"
    }
}
