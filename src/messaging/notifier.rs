//! # Progress / Result / Stage Notifiers
//!
//! Thin publishers used by the orchestrator and the stage workers. Each one knows its
//! exchange, routing key and content shape and nothing else.

use std::sync::Arc;

use tracing::debug;

use super::envelope::{Envelope, Status};
use super::payloads::{ProgressUpdate, ResultContent, Stage, StagePayload, StageReport};
use super::publisher::Publisher;
use super::{MessagingError, MessagingResult};
use crate::constants::{exchanges, routing_keys};

/// Publishes `{increment, message}` on `progress/progress.update`
#[derive(Debug, Clone)]
pub struct ProgressNotifier {
    publisher: Arc<Publisher>,
}

impl ProgressNotifier {
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self { publisher }
    }

    pub async fn update(&self, request_id: &str, increment: i64, message: &str) -> MessagingResult<()> {
        let payload = StagePayload::Progress(ProgressUpdate {
            increment,
            message: message.to_string(),
        });
        let envelope = payload
            .to_envelope("")
            .map_err(|e| MessagingError::serialization(e.to_string()))?
            .with_request_id(request_id);

        debug!(request_id = %request_id, increment, message = %message, "Progress update");
        self.publisher
            .publish(exchanges::PROGRESS, routing_keys::PROGRESS_UPDATE, envelope)
            .await
    }
}

/// Publishes final results on `results/results.done`
#[derive(Debug, Clone)]
pub struct ResultNotifier {
    publisher: Arc<Publisher>,
}

impl ResultNotifier {
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self { publisher }
    }

    /// OK result carrying human-readable content
    pub async fn success(&self, request_id: &str, content: &str) -> MessagingResult<()> {
        let payload = StagePayload::Result(ResultContent {
            request_hash: request_id.to_string(),
            content: content.to_string(),
        });
        self.publisher
            .publish_payload(exchanges::RESULTS, routing_keys::RESULTS_DONE, &payload, "")
            .await
    }

    /// ERROR result carrying the failing stage's message
    pub async fn failure(&self, request_id: &str, message: &str) -> MessagingResult<()> {
        let content = ResultContent {
            request_hash: request_id.to_string(),
            content: message.to_string(),
        };
        let mut envelope = Envelope::from_payload(message, &content)
            .map_err(|e| MessagingError::serialization(e.to_string()))?
            .with_request_id(request_id);
        envelope.status = Status::Error;

        self.publisher
            .publish(exchanges::RESULTS, routing_keys::RESULTS_DONE, envelope)
            .await
    }
}

/// Publishes stage completion reports on `notifications/notify.handler`
#[derive(Debug, Clone)]
pub struct StageNotifier {
    publisher: Arc<Publisher>,
}

impl StageNotifier {
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self { publisher }
    }

    pub async fn report_ok(&self, report: StageReport) -> MessagingResult<()> {
        let message = report.detail.clone();
        self.publisher
            .publish_payload(
                exchanges::NOTIFICATIONS,
                routing_keys::NOTIFY_HANDLER,
                &StagePayload::StageReport(report),
                &message,
            )
            .await
    }

    /// ERROR report; the orchestrator sees the request id, stage and message
    pub async fn report_error(&self, report: StageReport) -> MessagingResult<()> {
        let message = format!("{} stage failed: {}", report.stage, report.detail);
        let mut envelope = Envelope::from_payload(&message, &report)
            .map_err(|e| MessagingError::serialization(e.to_string()))?
            .with_request_id(&report.request_id);
        envelope.status = Status::Error;

        self.publisher
            .publish(exchanges::NOTIFICATIONS, routing_keys::NOTIFY_HANDLER, envelope)
            .await
    }

    /// Report a stage outcome with the status matching `success`
    pub async fn report(&self, report: StageReport, success: bool) -> MessagingResult<()> {
        if success {
            self.report_ok(report).await
        } else {
            self.report_error(report).await
        }
    }
}

/// Build a stage report
pub fn stage_report(
    request_id: &str,
    stage: Stage,
    completed_tasks: usize,
    failed_tasks: usize,
    detail: impl Into<String>,
) -> StageReport {
    StageReport {
        request_id: request_id.to_string(),
        stage,
        completed_tasks,
        failed_tasks,
        detail: detail.into(),
    }
}
