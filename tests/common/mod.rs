//! Shared fixtures for integration tests: an in-memory broker with the pipeline
//! topology declared, request builders, and fakes for the external programs.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use pipeline_core::constants::{exchanges, routing_keys};
use pipeline_core::messaging::{
    declare_topology, BrokerHandle, BrokerProvider, InMemoryBroker, Publisher, Topology,
};
use pipeline_core::orchestration::{
    OrchestrationError, OrchestrationResult, OutputUploader, PipelineRequest,
};
use pipeline_core::stages::{
    DataPreparer, MapRenderer, ProcessOutput, ProcessRunner, RenderTask, StageError, StageResult,
};

pub mod strategies;

/// In-memory broker with the full pipeline topology declared
pub async fn pipeline_broker() -> (InMemoryBroker, BrokerHandle) {
    let memory = InMemoryBroker::new();
    let handle = BrokerProvider::from(memory.clone()).into_handle();
    declare_topology(&handle, &Topology::pipeline())
        .await
        .expect("topology declares on a fresh broker");
    (memory, handle)
}

/// Publisher without per-message TTL so nothing expires while a test inspects queues
pub fn publisher(handle: &BrokerHandle) -> Arc<Publisher> {
    Arc::new(Publisher::without_ttl(handle.clone()))
}

/// Wire-shaped request with execution and two maps
pub fn request_json(request_id: &str) -> Value {
    json!({
        "requestId": request_id,
        "sourceFile": "/data/geopotential_500hPa_2022-03-14_00-12UTC.nc",
        "variableName": "geopotential",
        "pressureLevels": [500],
        "years": [2022],
        "months": [3],
        "days": [14],
        "hours": [0, 12],
        "areaCovered": [10, -20, -10, 20],
        "mapTypes": ["cont"],
        "mapRanges": ["max"],
        "mapLevels": [20]
    })
}

pub fn request(request_id: &str) -> PipelineRequest {
    serde_json::from_value(request_json(request_id)).expect("fixture request deserializes")
}

pub fn request_with(request_id: &str, overrides: Value) -> PipelineRequest {
    let mut raw = request_json(request_id);
    if let (Some(target), Some(fields)) = (raw.as_object_mut(), overrides.as_object()) {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(raw).expect("fixture request deserializes")
}

/// Parse a wire body without status checks
pub fn raw(body: &[u8]) -> Value {
    serde_json::from_slice(body).expect("wire body is JSON")
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Records every argv and fails programs listed in `failing`
#[derive(Debug, Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<(Vec<String>, Option<PathBuf>)>>,
    failing: HashSet<String>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(programs: &[&str]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: programs.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().iter().map(|(argv, _)| argv.clone()).collect()
    }

    pub fn cwds(&self) -> Vec<Option<PathBuf>> {
        self.calls.lock().iter().map(|(_, cwd)| cwd.clone()).collect()
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, argv: &[String], cwd: Option<&Path>) -> StageResult<ProcessOutput> {
        let program = argv.first().cloned().ok_or(StageError::EmptyCommand)?;
        self.calls
            .lock()
            .push((argv.to_vec(), cwd.map(Path::to_path_buf)));

        if self.failing.contains(&program) {
            return Ok(ProcessOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: format!("{} failed", program),
            });
        }
        Ok(ProcessOutput {
            code: Some(0),
            stdout: "ok".to_string(),
            stderr: String::new(),
        })
    }
}

/// Renders instantly; tasks whose hour is listed in `failing_hours` fail
#[derive(Debug, Default)]
pub struct FakeRenderer {
    rendered: Mutex<Vec<String>>,
    failing_hours: HashSet<String>,
    delay: Option<Duration>,
}

impl FakeRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_hours(hours: &[&str]) -> Self {
        Self {
            failing_hours: hours.iter().map(|h| h.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn rendered(&self) -> Vec<String> {
        self.rendered.lock().clone()
    }
}

#[async_trait]
impl MapRenderer for FakeRenderer {
    async fn render(&self, task: &RenderTask) -> StageResult<PathBuf> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_hours.contains(&task.hour) {
            return Err(StageError::render(task.label(), "plot backend crashed"));
        }
        self.rendered.lock().push(task.label());
        Ok(task.output_file())
    }
}

/// Writes a placeholder file instead of downloading
#[derive(Debug, Default)]
pub struct FakePreparer {
    fetched: Mutex<Vec<PathBuf>>,
    adapted: Mutex<Vec<PathBuf>>,
    fail_fetch: bool,
}

impl FakePreparer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_fetch: true,
            ..Self::default()
        }
    }

    pub fn fetched(&self) -> Vec<PathBuf> {
        self.fetched.lock().clone()
    }

    pub fn adapted(&self) -> Vec<PathBuf> {
        self.adapted.lock().clone()
    }
}

#[async_trait]
impl DataPreparer for FakePreparer {
    async fn fetch(&self, _request: &PipelineRequest, target: &Path) -> StageResult<()> {
        if self.fail_fetch {
            return Err(StageError::preparation("download service unavailable"));
        }
        tokio::fs::write(target, b"netcdf")
            .await
            .map_err(|e| StageError::preparation(e.to_string()))?;
        self.fetched.lock().push(target.to_path_buf());
        Ok(())
    }

    async fn adapt(&self, target: &Path) -> StageResult<()> {
        self.adapted.lock().push(target.to_path_buf());
        Ok(())
    }
}

/// Records uploads instead of talking to object storage
///
/// With a broker attached it also notes how many results had been published when each
/// upload ran.
#[derive(Debug, Default)]
pub struct FakeUploader {
    uploads: Mutex<Vec<(String, PathBuf)>>,
    results_at_upload: Mutex<Vec<usize>>,
    memory: Option<InMemoryBroker>,
    fail: bool,
}

impl FakeUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn watching(mut self, memory: &InMemoryBroker) -> Self {
        self.memory = Some(memory.clone());
        self
    }

    pub fn uploads(&self) -> Vec<(String, PathBuf)> {
        self.uploads.lock().clone()
    }

    pub fn results_at_upload(&self) -> Vec<usize> {
        self.results_at_upload.lock().clone()
    }
}

#[async_trait]
impl OutputUploader for FakeUploader {
    async fn upload(&self, request_id: &str, out_dir: &Path) -> OrchestrationResult<Vec<String>> {
        self.uploads
            .lock()
            .push((request_id.to_string(), out_dir.to_path_buf()));
        if let Some(memory) = &self.memory {
            let published = memory
                .published_to(exchanges::RESULTS, routing_keys::RESULTS_DONE)
                .len();
            self.results_at_upload.lock().push(published);
        }
        if self.fail {
            return Err(OrchestrationError::delivery(request_id, "bucket unreachable"));
        }
        Ok(vec![format!("{}/map.svg", request_id)])
    }

    fn location(&self, request_id: &str) -> String {
        format!("generated/{}/", request_id)
    }
}
