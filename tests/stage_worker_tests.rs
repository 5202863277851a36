//! Stage workers fed through their message handlers, with fakes for every external
//! program.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{raw, pipeline_broker, publisher, request, request_with, FakePreparer, FakeRenderer, FakeRunner};
use pipeline_core::constants::{exchanges, queues, routing_keys};
use pipeline_core::messaging::{
    Envelope, EnvelopeError, ExecutionCommand, MessageHandler, PayloadKind, ProgressNotifier,
    StageNotifier, StagePayload, VisualizationCommand,
};
use pipeline_core::orchestration::PipelineRequest;
use pipeline_core::stages::{
    plan_render_tasks, render_all, Configurator, ExecutionSettings, ExecutionWorker,
    VisualizationWorker,
};

fn encode(payload: StagePayload) -> Vec<u8> {
    payload.to_envelope("").unwrap().encode().unwrap()
}

fn visualization_command(out_dir: &std::path::Path, request: PipelineRequest) -> VisualizationCommand {
    VisualizationCommand {
        request_id: request.request_id.clone(),
        out_dir: out_dir.to_string_lossy().into_owned(),
        request,
    }
}

/// Four maps: two years by two hours
fn four_map_request(request_id: &str) -> PipelineRequest {
    request_with(request_id, json!({"years": [2020, 2021], "hours": [0, 12]}))
}

#[tokio::test]
async fn test_execution_builds_then_runs_in_work_dir() {
    let (memory, handle) = pipeline_broker().await;
    let publisher = publisher(&handle);
    let temp = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    let settings = ExecutionSettings {
        work_dir: temp.path().join("build"),
        ..ExecutionSettings::default()
    };
    let worker = ExecutionWorker::new(
        runner.clone(),
        StageNotifier::new(publisher.clone()),
        ProgressNotifier::new(publisher.clone()),
        settings,
    );

    let out_dir = temp.path().join("out");
    let argv = vec!["./FAST-IBAN".to_string(), "data.nc".to_string()];
    let body = encode(StagePayload::ExecutionCommand(ExecutionCommand {
        request_id: "req-1".to_string(),
        argv: argv.clone(),
        out_dir: out_dir.to_string_lossy().into_owned(),
        source_file: None,
        no_compile: false,
    }));
    worker.handle(&body).await.unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0], vec!["cmake", ".."]);
    assert_eq!(calls[1], vec!["cmake", "--build", "."]);
    assert_eq!(calls[2], argv);
    assert!(runner
        .cwds()
        .iter()
        .all(|cwd| cwd.as_deref() == Some(temp.path().join("build").as_path())));
    assert!(out_dir.is_dir());

    let reports = memory.take_ready(queues::NOTIFICATIONS);
    assert_eq!(reports.len(), 1);
    let (envelope, payload) = StagePayload::decode(PayloadKind::StageReport, &reports[0]).unwrap();
    assert_eq!(envelope.request_id.as_deref(), Some("req-1"));
    let StagePayload::StageReport(report) = payload else {
        panic!("expected a stage report");
    };
    assert_eq!((report.completed_tasks, report.failed_tasks), (1, 0));
}

#[tokio::test]
async fn test_relative_paths_resolve_for_the_executable() {
    let (_memory, handle) = pipeline_broker().await;
    let publisher = publisher(&handle);
    let base = format!("target/execution-relative/{}", uuid::Uuid::new_v4());
    let runner = Arc::new(FakeRunner::new());
    let defaults = ExecutionSettings::default();
    let worker = ExecutionWorker::new(
        runner.clone(),
        StageNotifier::new(publisher.clone()),
        ProgressNotifier::new(publisher.clone()),
        ExecutionSettings {
            work_dir: std::path::PathBuf::from(format!("{}/{}", base, defaults.work_dir.display())),
            ..defaults
        },
    );

    let out_dir = format!("./{}/out/req-r", base);
    let source_file = format!("./{}/data/input.nc", base);
    let argv: Vec<String> = ["./FAST-IBAN", source_file.as_str(), "-10", "10", "-20", "20", out_dir.as_str(), "1"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let body = encode(StagePayload::ExecutionCommand(ExecutionCommand {
        request_id: "req-r".to_string(),
        argv,
        out_dir: out_dir.clone(),
        source_file: Some(source_file.clone()),
        no_compile: true,
    }));
    worker.handle(&body).await.unwrap();

    let calls = runner.calls();
    let executed = &calls[0];
    assert_eq!(executed[0], "./FAST-IBAN");
    let seen_out = std::path::Path::new(&executed[6]);
    assert!(seen_out.is_absolute(), "{:?}", seen_out);
    assert!(seen_out.is_dir(), "executable would not find {:?}", seen_out);
    assert_eq!(seen_out, std::path::absolute(&out_dir).unwrap());
    assert_eq!(
        std::path::Path::new(&executed[1]),
        std::path::absolute(&source_file).unwrap()
    );

    std::fs::remove_dir_all(&base).unwrap();
}

#[tokio::test]
async fn test_execution_skips_build_when_no_compile() {
    let (_memory, handle) = pipeline_broker().await;
    let publisher = publisher(&handle);
    let temp = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::new());
    let worker = ExecutionWorker::new(
        runner.clone(),
        StageNotifier::new(publisher.clone()),
        ProgressNotifier::new(publisher.clone()),
        ExecutionSettings {
            work_dir: temp.path().join("build"),
            ..ExecutionSettings::default()
        },
    );

    let body = encode(StagePayload::ExecutionCommand(ExecutionCommand {
        request_id: "req-2".to_string(),
        argv: vec!["./FAST-IBAN".to_string()],
        out_dir: temp.path().join("out").to_string_lossy().into_owned(),
        source_file: None,
        no_compile: true,
    }));
    worker.handle(&body).await.unwrap();
    assert_eq!(runner.calls(), vec![vec!["./FAST-IBAN".to_string()]]);
}

#[tokio::test]
async fn test_failed_build_reports_error_and_skips_execution() {
    let (memory, handle) = pipeline_broker().await;
    let publisher = publisher(&handle);
    let temp = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::failing(&["cmake"]));
    let worker = ExecutionWorker::new(
        runner.clone(),
        StageNotifier::new(publisher.clone()),
        ProgressNotifier::new(publisher.clone()),
        ExecutionSettings {
            work_dir: temp.path().join("build"),
            ..ExecutionSettings::default()
        },
    );

    let body = encode(StagePayload::ExecutionCommand(ExecutionCommand {
        request_id: "req-3".to_string(),
        argv: vec!["./FAST-IBAN".to_string()],
        out_dir: temp.path().join("out").to_string_lossy().into_owned(),
        source_file: None,
        no_compile: false,
    }));
    // The failure travels as a report; the delivery itself is handled
    worker.handle(&body).await.unwrap();
    assert_eq!(runner.calls().len(), 1);

    let reports = memory.take_ready(queues::NOTIFICATIONS);
    match Envelope::decode(&reports[0]) {
        Err(EnvelopeError::Rejected { request_id, message, .. }) => {
            assert_eq!(request_id.as_deref(), Some("req-3"));
            assert!(message.contains("cmake"), "{}", message);
        }
        other => panic!("expected an ERROR report, got {:?}", other),
    }
}

#[tokio::test]
async fn test_visualization_renders_every_map_and_reports_once() {
    let (memory, handle) = pipeline_broker().await;
    let publisher = publisher(&handle);
    let temp = tempfile::tempdir().unwrap();
    let renderer = Arc::new(FakeRenderer::new());
    let worker = VisualizationWorker::new(
        renderer.clone(),
        StageNotifier::new(publisher.clone()),
        ProgressNotifier::new(publisher.clone()),
    )
    .with_pool(2);

    let body = encode(StagePayload::VisualizationCommand(visualization_command(
        temp.path(),
        four_map_request("req-4"),
    )));
    worker.handle(&body).await.unwrap();

    assert_eq!(renderer.rendered().len(), 4);
    let reports = memory.take_ready(queues::NOTIFICATIONS);
    assert_eq!(reports.len(), 1);
    let (_, payload) = StagePayload::decode(PayloadKind::StageReport, &reports[0]).unwrap();
    let StagePayload::StageReport(report) = payload else {
        panic!("expected a stage report");
    };
    assert_eq!(report.completed_tasks, 4);
    assert_eq!(report.detail, "4 maps rendered");
}

#[tokio::test]
async fn test_one_failed_map_fails_the_stage_once() {
    let (memory, handle) = pipeline_broker().await;
    let publisher = publisher(&handle);
    let temp = tempfile::tempdir().unwrap();
    let worker = VisualizationWorker::new(
        Arc::new(FakeRenderer::failing_hours(&["12"])),
        StageNotifier::new(publisher.clone()),
        ProgressNotifier::new(publisher.clone()),
    );

    let request = request_with("req-5", json!({"years": [2020], "hours": [0, 12]}));
    let body = encode(StagePayload::VisualizationCommand(visualization_command(
        temp.path(),
        request,
    )));
    worker.handle(&body).await.unwrap();

    let reports = memory.take_ready(queues::NOTIFICATIONS);
    assert_eq!(reports.len(), 1);
    let wire = raw(&reports[0]);
    assert_eq!(wire["status"], "ERROR");
    assert_eq!(wire["requestId"], "req-5");
    assert!(wire["message"]
        .as_str()
        .unwrap()
        .contains("1 of 2 render tasks failed"));
}

#[tokio::test]
async fn test_fan_out_respects_pool_bound() {
    let temp = tempfile::tempdir().unwrap();
    let request = request_with(
        "req-6",
        json!({"years": [2020], "days": [1, 2, 3, 4], "hours": [0, 6, 12, 18]}),
    );
    let tasks = plan_render_tasks(&visualization_command(temp.path(), request)).unwrap();
    assert_eq!(tasks.len(), 16);

    let renderer = Arc::new(FakeRenderer::new().with_delay(Duration::from_millis(20)));
    let started = tokio::time::Instant::now();
    let summary = render_all(renderer.clone(), tasks, 4).await;
    let elapsed = started.elapsed();

    assert!(summary.is_success());
    assert_eq!(summary.completed.len(), 16);
    // Four waves of four tasks
    assert!(elapsed >= Duration::from_millis(80), "{:?}", elapsed);
}

#[tokio::test]
async fn test_configurator_prepares_data_and_forwards() {
    let (memory, handle) = pipeline_broker().await;
    let publisher = publisher(&handle);
    let data_dir = tempfile::tempdir().unwrap();
    let preparer = Arc::new(FakePreparer::new());
    let configurator = Configurator::new(preparer.clone(), publisher, data_dir.path());

    let request = request_with("req-7", json!({"sourceFile": null}));
    let body = encode(StagePayload::ConfigRequest(request));
    configurator.handle(&body).await.unwrap();

    let expected = data_dir
        .path()
        .join("geopotential_500hPa_2022-03-(14)_00-12UTC.nc");
    assert_eq!(preparer.fetched(), vec![expected.clone()]);
    assert_eq!(preparer.adapted(), vec![expected.clone()]);

    let forwarded = memory.take_ready(queues::HANDLER);
    assert_eq!(forwarded.len(), 1);
    let (_, payload) = StagePayload::decode(PayloadKind::ConfigRequest, &forwarded[0]).unwrap();
    let StagePayload::ConfigRequest(forwarded) = payload else {
        panic!("expected a config request");
    };
    assert_eq!(forwarded.source_file, Some(expected.to_string_lossy().into_owned()));

    // Second request for the same data reuses the file
    let body = encode(StagePayload::ConfigRequest(request_with("req-8", json!({"sourceFile": null}))));
    configurator.handle(&body).await.unwrap();
    assert_eq!(preparer.fetched().len(), 1);
}

#[tokio::test]
async fn test_configurator_failure_answers_with_error_result() {
    let (memory, handle) = pipeline_broker().await;
    let publisher = publisher(&handle);
    let data_dir = tempfile::tempdir().unwrap();
    let configurator = Configurator::new(Arc::new(FakePreparer::failing()), publisher, data_dir.path());

    let body = encode(StagePayload::ConfigRequest(request("req-9")));
    configurator.handle(&body).await.unwrap();

    assert!(memory.take_ready(queues::HANDLER).is_empty());
    let results = memory.take_ready(queues::RESULTS);
    assert_eq!(results.len(), 1);
    let wire = raw(&results[0]);
    assert_eq!(wire["status"], "ERROR");
    assert!(wire["message"]
        .as_str()
        .unwrap()
        .contains("download service unavailable"));
    assert!(memory
        .published_to(exchanges::REQUESTS, routing_keys::HANDLER_START)
        .is_empty());
}
