//! # Configurator
//!
//! Consumes `config_queue`. Works out the source file name for a request, has the data
//! fetched and adapted when the file is not already on disk, and forwards the completed
//! request to `requests/handler.start` for the orchestrator.
//!
//! Source files are named
//! `{dataDir}/{variable}_{levels}hPa_{years}-{months}-({days})_{hours}UTC.nc`, with every
//! component zero-padded to two digits and consecutive days collapsed into `dd-dd` ranges.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use super::errors::{StageError, StageResult};
use super::process::ProcessRunner;
use crate::constants::{exchanges, routing_keys};
use crate::logging::log_stage_operation;
use crate::messaging::{
    EnvelopeError, HandlerError, MessageHandler, PayloadKind, ProgressNotifier, Publisher,
    ResultNotifier, StagePayload,
};
use crate::orchestration::request::PipelineRequest;

/// Two-digit form of a numeric selector; non-numeric values pass through
pub fn zero_pad(raw: &str) -> String {
    match raw.trim().parse::<i64>() {
        Ok(value) => format!("{:02}", value),
        Err(_) => raw.trim().to_string(),
    }
}

/// `["1","2","3","7"]` becomes `"01-03-07"`
pub fn format_range(values: &[String]) -> String {
    let mut numbers: Vec<i64> = values
        .iter()
        .filter_map(|v| v.trim().parse().ok())
        .collect();
    numbers.sort_unstable();
    numbers.dedup();

    let mut ranges: Vec<(i64, i64)> = Vec::new();
    for n in numbers {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == n => *end = n,
            _ => ranges.push((n, n)),
        }
    }

    ranges
        .iter()
        .map(|&(start, end)| {
            if start == end {
                format!("{:02}", start)
            } else {
                format!("{:02}-{:02}", start, end)
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn padded(values: &[String]) -> String {
    values.iter().map(|v| zero_pad(v)).collect::<Vec<_>>().join("-")
}

/// Path of the prepared source file for a request
pub fn mount_file_name(data_dir: &Path, request: &PipelineRequest) -> StageResult<PathBuf> {
    if request.pressure_levels.is_empty() {
        return Err(StageError::invalid_input(
            "at least one pressure level is needed to name the source file",
        ));
    }
    let name = format!(
        "{}_{}hPa_{}-{}-({})_{}UTC.nc",
        request.variable_name,
        request.pressure_levels.join("-"),
        padded(&request.years),
        padded(&request.months),
        format_range(&request.days),
        padded(&request.hours),
    );
    Ok(data_dir.join(name))
}

/// Fetches and reformats raw input data
#[async_trait]
pub trait DataPreparer: Send + Sync + 'static {
    /// Download the data selected by `request` into `target`
    async fn fetch(&self, request: &PipelineRequest, target: &Path) -> StageResult<()>;

    /// Reformat a downloaded file in place for the executable
    async fn adapt(&self, target: &Path) -> StageResult<()>;
}

/// Prepares data by running external fetch and adapt programs
pub struct CommandPreparer {
    runner: Arc<dyn ProcessRunner>,
    fetch_program: Vec<String>,
    adapt_program: Vec<String>,
}

impl std::fmt::Debug for CommandPreparer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPreparer")
            .field("fetch_program", &self.fetch_program)
            .field("adapt_program", &self.adapt_program)
            .finish()
    }
}

impl CommandPreparer {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        fetch_program: Vec<String>,
        adapt_program: Vec<String>,
    ) -> Self {
        Self {
            runner,
            fetch_program,
            adapt_program,
        }
    }

    async fn run(&self, argv: Vec<String>) -> StageResult<()> {
        let program = argv.first().cloned().ok_or(StageError::EmptyCommand)?;
        self.runner
            .run(&argv, None)
            .await
            .and_then(|output| output.into_result(&program))
            .map(|_| ())
            .map_err(|e| StageError::preparation(e.to_string()))
    }
}

#[async_trait]
impl DataPreparer for CommandPreparer {
    async fn fetch(&self, request: &PipelineRequest, target: &Path) -> StageResult<()> {
        let mut argv = self.fetch_program.clone();
        argv.extend([
            request.variable_name.clone(),
            request.years.join(","),
            request.months.join(","),
            request.days.join(","),
            request.hours.join(","),
            request.pressure_levels.join(","),
            request.area_covered.join(","),
            target.to_string_lossy().into_owned(),
        ]);
        self.run(argv).await
    }

    async fn adapt(&self, target: &Path) -> StageResult<()> {
        let mut argv = self.adapt_program.clone();
        argv.push(target.to_string_lossy().into_owned());
        self.run(argv).await
    }
}

pub struct Configurator {
    preparer: Arc<dyn DataPreparer>,
    publisher: Arc<Publisher>,
    progress: ProgressNotifier,
    results: ResultNotifier,
    data_dir: PathBuf,
}

impl std::fmt::Debug for Configurator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configurator")
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

impl Configurator {
    pub fn new(
        preparer: Arc<dyn DataPreparer>,
        publisher: Arc<Publisher>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            preparer,
            progress: ProgressNotifier::new(publisher.clone()),
            results: ResultNotifier::new(publisher.clone()),
            publisher,
            data_dir: data_dir.into(),
        }
    }

    async fn notify(&self, request_id: &str, message: &str) {
        if let Err(e) = self.progress.update(request_id, 1, message).await {
            warn!(request_id = %request_id, error = %e, "Progress update failed");
        }
    }

    /// Make sure the source file exists and attach it to the request
    pub async fn prepare(&self, mut request: PipelineRequest) -> StageResult<PipelineRequest> {
        let request_id = request.request_id.clone();
        self.notify(&request_id, "CONFIG: arguments received").await;

        if request.no_data {
            log_stage_operation("configuring", &request_id, "data preparation skipped", None);
        } else {
            let target = mount_file_name(&self.data_dir, &request)?;
            let exists = tokio::fs::try_exists(&target)
                .await
                .map_err(|e| StageError::preparation(format!("{}: {}", target.display(), e)))?;

            if exists {
                info!(request_id = %request_id, file = %target.display(), "Source file already present");
            } else {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| StageError::preparation(e.to_string()))?;
                }
                self.preparer.fetch(&request, &target).await?;
                self.notify(&request_id, "CONFIG: source data downloaded").await;
                self.preparer.adapt(&target).await?;
                self.notify(&request_id, "CONFIG: source data adapted").await;
            }
            request.source_file = Some(target.to_string_lossy().into_owned());
        }

        request
            .validated()
            .map_err(|e| StageError::invalid_input(e.to_string()))?;
        Ok(request)
    }
}

#[async_trait]
impl MessageHandler for Configurator {
    #[instrument(skip(self, body))]
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let request = match StagePayload::decode(PayloadKind::ConfigRequest, body) {
            Ok((_, StagePayload::ConfigRequest(request))) => request,
            Ok((_, other)) => {
                return Err(HandlerError::reject(format!(
                    "expected a config request, got {}",
                    other.kind().name()
                )))
            }
            Err(e @ EnvelopeError::Rejected { .. }) => {
                if let Some(id) = e.request_id() {
                    self.results.failure(id, &e.to_string()).await?;
                    return Ok(());
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        let request_id = request.request_id.clone();

        let request = match self.prepare(request).await {
            Ok(request) => request,
            Err(StageError::Messaging(e)) => return Err(e.into()),
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Configuration failed");
                self.results
                    .failure(&request_id, &format!("configuration failed: {}", e))
                    .await?;
                return Ok(());
            }
        };

        self.publisher
            .publish_payload(
                exchanges::REQUESTS,
                routing_keys::HANDLER_START,
                &StagePayload::ConfigRequest(request),
                "",
            )
            .await?;
        log_stage_operation("configuring", &request_id, "forwarded to handler", None);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "configurator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_format_range_collapses_consecutive_days() {
        assert_eq!(format_range(&strings(&["1", "2", "3", "7"])), "01-03-07");
        assert_eq!(format_range(&strings(&["14"])), "14");
        assert_eq!(format_range(&strings(&["5", "3", "4", "10", "11"])), "03-05-10-11");
        assert_eq!(format_range(&[]), "");
    }

    #[test]
    fn test_zero_pad() {
        assert_eq!(zero_pad("3"), "03");
        assert_eq!(zero_pad("12"), "12");
        assert_eq!(zero_pad("max"), "max");
    }

    #[test]
    fn test_mount_file_name() {
        let request: PipelineRequest = serde_json::from_value(json!({
            "requestId": "req-1",
            "variableName": "geopotential",
            "pressureLevels": [500],
            "years": [2022],
            "months": [3],
            "days": [14, 15, 16],
            "hours": [0, 6, 12, 18]
        }))
        .unwrap();

        let path = mount_file_name(Path::new("/data"), &request).unwrap();
        assert_eq!(
            path,
            PathBuf::from("/data/geopotential_500hPa_2022-03-(14-16)_00-06-12-18UTC.nc")
        );
    }

    #[test]
    fn test_mount_file_name_needs_a_level() {
        let request: PipelineRequest = serde_json::from_value(json!({"requestId": "req-1"})).unwrap();
        assert!(mount_file_name(Path::new("/data"), &request).is_err());
    }
}
