//! Every process role wired onto one in-memory broker: a request published on
//! `requests/config.create` should come out as one result on `results_queue`.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{eventually, pipeline_broker, publisher, request_with, FakePreparer, FakeRenderer, FakeRunner};
use pipeline_core::constants::{exchanges, queues, routing_keys, DEFAULT_PREFETCH};
use pipeline_core::messaging::{
    Consumer, ConsumerHandle, Envelope, InMemoryBroker, ProgressNotifier, Publisher,
    StageNotifier, StagePayload,
};
use pipeline_core::orchestration::{
    DirectoryWorkspace, NotificationIntake, Orchestrator, OrchestratorSettings, PipelineState,
    RequestIntake,
};
use pipeline_core::stages::{
    Configurator, ExecutionSettings, ExecutionWorker, VisualizationWorker,
};

struct Pipeline {
    memory: InMemoryBroker,
    publisher: Arc<Publisher>,
    orchestrator: Arc<Orchestrator>,
    renderer: Arc<FakeRenderer>,
    runner: Arc<FakeRunner>,
    handles: Vec<ConsumerHandle>,
    _dirs: Vec<tempfile::TempDir>,
}

async fn start_pipeline(renderer: FakeRenderer) -> Pipeline {
    let (memory, handle) = pipeline_broker().await;
    let publisher = publisher(&handle);
    let consumer = Consumer::new(handle.clone(), DEFAULT_PREFETCH);

    let outputs = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let build = tempfile::tempdir().unwrap();

    let orchestrator = Arc::new(Orchestrator::new(
        publisher.clone(),
        Arc::new(DirectoryWorkspace::new(outputs.path())),
        OrchestratorSettings::default(),
    ));
    let configurator = Configurator::new(Arc::new(FakePreparer::new()), publisher.clone(), data.path());
    let runner = Arc::new(FakeRunner::new());
    let execution = ExecutionWorker::new(
        runner.clone(),
        StageNotifier::new(publisher.clone()),
        ProgressNotifier::new(publisher.clone()),
        ExecutionSettings {
            work_dir: build.path().to_path_buf(),
            ..ExecutionSettings::default()
        },
    );
    let renderer = Arc::new(renderer);
    let visualization = VisualizationWorker::new(
        renderer.clone(),
        StageNotifier::new(publisher.clone()),
        ProgressNotifier::new(publisher.clone()),
    );

    let handles = vec![
        consumer.subscribe(queues::CONFIG, Arc::new(configurator)).await.unwrap(),
        consumer
            .subscribe(queues::HANDLER, Arc::new(RequestIntake::new(orchestrator.clone())))
            .await
            .unwrap(),
        consumer
            .subscribe(
                queues::NOTIFICATIONS,
                Arc::new(NotificationIntake::new(orchestrator.clone())),
            )
            .await
            .unwrap(),
        consumer
            .subscribe(queues::EXECUTION_ALGORITHM, Arc::new(execution))
            .await
            .unwrap(),
        consumer
            .subscribe(queues::EXECUTION_VISUALIZATION, Arc::new(visualization))
            .await
            .unwrap(),
    ];

    Pipeline {
        memory,
        publisher,
        orchestrator,
        renderer,
        runner,
        handles,
        _dirs: vec![outputs, data, build],
    }
}

impl Pipeline {
    async fn submit(&self, request_id: &str, overrides: serde_json::Value) {
        let request = request_with(request_id, overrides);
        self.publisher
            .publish_payload(
                exchanges::REQUESTS,
                routing_keys::CONFIG_CREATE,
                &StagePayload::ConfigRequest(request),
                "",
            )
            .await
            .unwrap();
    }

    async fn finished(&self, request_id: &str) -> Option<PipelineState> {
        self.orchestrator
            .snapshot(request_id)
            .await
            .map(|s| s.state)
            .filter(PipelineState::is_terminal)
    }

    async fn wait_for(&self, request_id: &str) -> PipelineState {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if let Some(state) = self.finished(request_id).await {
                return state;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "request {} did not finish",
                request_id
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn stop(self) {
        for handle in self.handles {
            handle.shutdown().await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_request_flows_through_every_stage() {
    let pipeline = start_pipeline(FakeRenderer::new()).await;
    pipeline
        .submit("e2e-1", json!({"sourceFile": null, "years": [2020, 2021]}))
        .await;

    assert_eq!(pipeline.wait_for("e2e-1").await, PipelineState::Done);
    assert_eq!(pipeline.renderer.rendered().len(), 4);
    assert!(pipeline
        .runner
        .calls()
        .iter()
        .any(|argv| argv.first().map(String::as_str) == Some("./FAST-IBAN")));

    let results = pipeline.memory.take_ready(queues::RESULTS);
    assert_eq!(results.len(), 1);
    let result = Envelope::decode(&results[0]).unwrap();
    assert_eq!(result.request_id.as_deref(), Some("e2e-1"));
    assert!(result.content["content"]
        .as_str()
        .unwrap()
        .contains("4 maps rendered"));

    assert!(pipeline.memory.queue_depth(queues::PROGRESS) > 0);
    assert_eq!(pipeline.memory.queue_depth(queues::DEAD_LETTER), 0);
    pipeline.stop().await;
}

#[tokio::test]
async fn test_failed_map_fails_request_with_single_error_result() {
    let pipeline = start_pipeline(FakeRenderer::failing_hours(&["12"])).await;
    pipeline.submit("e2e-2", json!({"sourceFile": null})).await;

    assert_eq!(pipeline.wait_for("e2e-2").await, PipelineState::Failed);

    let memory = pipeline.memory.clone();
    assert!(eventually(|| memory.queue_depth(queues::RESULTS) == 1).await);
    let results = memory.take_ready(queues::RESULTS);
    let wire = common::raw(&results[0]);
    assert_eq!(wire["status"], "ERROR");
    assert_eq!(wire["requestId"], "e2e-2");
    pipeline.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_each_get_their_own_result() {
    let pipeline = start_pipeline(FakeRenderer::new()).await;
    pipeline.submit("e2e-a", json!({"sourceFile": null})).await;
    pipeline
        .submit("e2e-b", json!({"sourceFile": null, "noMaps": true}))
        .await;

    assert_eq!(pipeline.wait_for("e2e-a").await, PipelineState::Done);
    assert_eq!(pipeline.wait_for("e2e-b").await, PipelineState::Done);

    let mut ids: Vec<String> = pipeline
        .memory
        .take_ready(queues::RESULTS)
        .iter()
        .map(|body| Envelope::decode(body).unwrap().request_id.unwrap())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["e2e-a", "e2e-b"]);
    pipeline.stop().await;
}
