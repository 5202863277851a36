//! # Stage Payloads
//!
//! Typed content carried inside envelopes. The routing key a message arrives on fixes
//! which shape its content must have; decoding checks that shape at the codec boundary
//! so handlers never see an untyped blob.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::envelope::{Envelope, EnvelopeError, EnvelopeResult};
use crate::constants::routing_keys;
use crate::orchestration::request::PipelineRequest;

/// Pipeline stage that reports back to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Execution,
    Visualization,
}

impl Stage {
    /// Parse the wire name used in stage reports
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "execution" => Some(Self::Execution),
            "visualization" => Some(Self::Visualization),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execution => write!(f, "execution"),
            Self::Visualization => write!(f, "visualization"),
        }
    }
}

/// Command for the execution worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCommand {
    pub request_id: String,
    /// Full argv, program first
    pub argv: Vec<String>,
    pub out_dir: String,
    /// Input file as it appears in `argv`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default)]
    pub no_compile: bool,
}

/// Command for the visualization worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationCommand {
    pub request_id: String,
    pub out_dir: String,
    pub request: PipelineRequest,
}

/// Completion report published by a stage worker
///
/// Success or failure is the envelope status; this only carries the detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub request_id: String,
    pub stage: Stage,
    #[serde(default)]
    pub completed_tasks: usize,
    #[serde(default)]
    pub failed_tasks: usize,
    #[serde(default)]
    pub detail: String,
}

/// Final result published on `results/results.done`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultContent {
    #[serde(rename = "requestHash")]
    pub request_hash: String,
    pub content: String,
}

/// Incremental progress published on `progress/progress.update`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub increment: i64,
    pub message: String,
}

/// Which content shape a routing key carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    ConfigRequest,
    ExecutionCommand,
    VisualizationCommand,
    StageReport,
    Result,
    Progress,
}

impl PayloadKind {
    pub fn for_routing_key(routing_key: &str) -> Option<Self> {
        match routing_key {
            routing_keys::CONFIG_CREATE | routing_keys::HANDLER_START => Some(Self::ConfigRequest),
            routing_keys::EXECUTION_ALGORITHM => Some(Self::ExecutionCommand),
            routing_keys::EXECUTION_VISUALIZATION => Some(Self::VisualizationCommand),
            routing_keys::NOTIFY_HANDLER => Some(Self::StageReport),
            routing_keys::RESULTS_DONE => Some(Self::Result),
            routing_keys::PROGRESS_UPDATE => Some(Self::Progress),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfigRequest => "config request",
            Self::ExecutionCommand => "execution command",
            Self::VisualizationCommand => "visualization command",
            Self::StageReport => "stage report",
            Self::Result => "result",
            Self::Progress => "progress",
        }
    }
}

/// Tagged union over every known content shape
#[derive(Debug, Clone, PartialEq)]
pub enum StagePayload {
    ConfigRequest(PipelineRequest),
    ExecutionCommand(ExecutionCommand),
    VisualizationCommand(VisualizationCommand),
    StageReport(StageReport),
    Result(ResultContent),
    Progress(ProgressUpdate),
}

impl StagePayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::ConfigRequest(_) => PayloadKind::ConfigRequest,
            Self::ExecutionCommand(_) => PayloadKind::ExecutionCommand,
            Self::VisualizationCommand(_) => PayloadKind::VisualizationCommand,
            Self::StageReport(_) => PayloadKind::StageReport,
            Self::Result(_) => PayloadKind::Result,
            Self::Progress(_) => PayloadKind::Progress,
        }
    }

    /// Correlation key, when the shape has one
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::ConfigRequest(r) => Some(&r.request_id),
            Self::ExecutionCommand(c) => Some(&c.request_id),
            Self::VisualizationCommand(c) => Some(&c.request_id),
            Self::StageReport(r) => Some(&r.request_id),
            Self::Result(r) => Some(&r.request_hash),
            Self::Progress(_) => None,
        }
    }

    /// Type an already-decoded envelope's content
    pub fn from_envelope(kind: PayloadKind, envelope: &Envelope) -> EnvelopeResult<Self> {
        let name = kind.name();
        let payload = match kind {
            PayloadKind::ConfigRequest => Self::ConfigRequest(envelope.content_as(name)?),
            PayloadKind::ExecutionCommand => Self::ExecutionCommand(envelope.content_as(name)?),
            PayloadKind::VisualizationCommand => {
                Self::VisualizationCommand(envelope.content_as(name)?)
            }
            PayloadKind::StageReport => Self::StageReport(envelope.content_as(name)?),
            PayloadKind::Result => Self::Result(envelope.content_as(name)?),
            PayloadKind::Progress => Self::Progress(envelope.content_as(name)?),
        };
        Ok(payload)
    }

    /// Decode wire bytes straight into the expected shape
    pub fn decode(kind: PayloadKind, body: &[u8]) -> EnvelopeResult<(Envelope, Self)> {
        let envelope = Envelope::decode(body)?;
        let payload = Self::from_envelope(kind, &envelope)?;
        if let (Some(outer), Some(inner)) = (envelope.request_id.as_deref(), payload.request_id()) {
            if outer != inner {
                return Err(EnvelopeError::invalid_content(
                    kind.name(),
                    format!("envelope request {} carries content for {}", outer, inner),
                ));
            }
        }
        Ok((envelope, payload))
    }

    /// Wrap into an OK envelope tagged with the payload's request id
    pub fn to_envelope(&self, message: impl Into<String>) -> EnvelopeResult<Envelope> {
        let envelope = match self {
            Self::ConfigRequest(p) => Envelope::from_payload(message, p)?,
            Self::ExecutionCommand(p) => Envelope::from_payload(message, p)?,
            Self::VisualizationCommand(p) => Envelope::from_payload(message, p)?,
            Self::StageReport(p) => Envelope::from_payload(message, p)?,
            Self::Result(p) => Envelope::from_payload(message, p)?,
            Self::Progress(p) => Envelope::from_payload(message, p)?,
        };
        Ok(match self.request_id() {
            Some(id) => envelope.with_request_id(id),
            None => envelope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_routing_key_fixes_payload_kind() {
        assert_eq!(
            PayloadKind::for_routing_key("handler.start"),
            Some(PayloadKind::ConfigRequest)
        );
        assert_eq!(
            PayloadKind::for_routing_key("notify.handler"),
            Some(PayloadKind::StageReport)
        );
        assert_eq!(PayloadKind::for_routing_key("something.else"), None);
    }

    #[test]
    fn test_stage_report_decodes_through_envelope() {
        let report = StagePayload::StageReport(StageReport {
            request_id: "req-1".to_string(),
            stage: Stage::Execution,
            completed_tasks: 1,
            failed_tasks: 0,
            detail: "exit 0".to_string(),
        });
        let bytes = report.to_envelope("").unwrap().encode().unwrap();

        let (envelope, decoded) = StagePayload::decode(PayloadKind::StageReport, &bytes).unwrap();
        assert_eq!(envelope.request_id.as_deref(), Some("req-1"));
        assert_eq!(decoded, report);
    }

    #[test]
    fn test_wrong_shape_is_invalid_content() {
        let bytes = Envelope::ok("", json!({"increment": 1, "message": "x"}))
            .encode()
            .unwrap();
        let err = StagePayload::decode(PayloadKind::StageReport, &bytes).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidContent { .. }));
    }

    #[test]
    fn test_result_content_wire_names() {
        let value = serde_json::to_value(ResultContent {
            request_hash: "abc".to_string(),
            content: "done".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"requestHash": "abc", "content": "done"}));
    }
}
