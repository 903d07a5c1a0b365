//! Execution lifecycle against fake providers.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use runvoy::authorization::{AccessGrant, ResourceAccessValidator};
use runvoy::execution::{ExecutionRequest, ExecutionStatus};
use runvoy::ErrorKind;

use crate::support::{image, FakeTaskManager, Harness, RecordingEnforcer};

const CLIENT: &str = "203.0.113.7";

fn grant(request: &ExecutionRequest) -> AccessGrant {
    let validator = ResourceAccessValidator::new(Arc::new(RecordingEnforcer::allow_all()));
    let ubuntu = image("ubuntu:22.04", "ubuntu-22.04-abcd1234");
    validator
        .validate_execution_resource_access("dev@example.com", request, Some(&ubuntu))
        .expect("allowed")
}

fn grant_without_image(request: &ExecutionRequest) -> AccessGrant {
    let validator = ResourceAccessValidator::new(Arc::new(RecordingEnforcer::allow_all()));
    validator
        .validate_execution_resource_access("dev@example.com", request, None)
        .expect("allowed")
}

async fn start(harness: &Harness, command: &str) -> String {
    let request = ExecutionRequest::new(command);
    harness
        .orchestrator
        .run_command(&grant(&request), &request, CLIENT)
        .await
        .expect("run")
        .execution_id
}

#[tokio::test]
async fn run_provisions_task_and_returns_stream_url() {
    let harness = Harness::new();
    let request = ExecutionRequest {
        env: BTreeMap::from([("MODE".to_owned(), "ci".to_owned())]),
        secrets: vec![" db-password ".to_owned()],
        timeout_seconds: Some(30),
        ..ExecutionRequest::new("echo hello")
    };

    let response = harness
        .orchestrator
        .run_command(&grant(&request), &request, CLIENT)
        .await
        .expect("run");

    assert_eq!(response.status, ExecutionStatus::Running);
    assert_eq!(response.image_id, "ubuntu-22.04-abcd1234");
    let url = response.websocket_url.expect("stream url");
    assert!(url.contains(&response.execution_id));
    assert!(url.contains("subject=dev@example.com"));
    assert!(url.contains(CLIENT));

    let started = harness.tasks.started();
    assert_eq!(started.len(), 1);
    let (subject, spec) = &started[0];
    assert_eq!(subject, "dev@example.com");
    assert_eq!(spec.execution_id, response.execution_id);
    assert_eq!(spec.image, "ubuntu:22.04");
    assert_eq!(spec.secrets, vec!["db-password".to_owned()]);
    assert_eq!(spec.timeout, Duration::from_secs(30));

    let stored = harness
        .orchestrator
        .get_execution(&response.execution_id)
        .await
        .expect("stored");
    assert_eq!(stored.status, ExecutionStatus::Running);
    assert_eq!(stored.created_by, "dev@example.com");
    assert_eq!(stored.task_ref, Some(format!("task-{}", response.execution_id)));
    assert!(stored.started_at.is_some());
}

#[tokio::test]
async fn start_failure_marks_execution_failed() {
    let harness = Harness::with_tasks(FakeTaskManager::failing());
    let request = ExecutionRequest::new("echo hello");

    let err = harness
        .orchestrator
        .run_command(&grant(&request), &request, CLIENT)
        .await
        .expect_err("start fails");
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    let executions = harness.orchestrator.list_executions(0, None).await.expect("list");
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert!(executions[0]
        .reason
        .as_deref()
        .is_some_and(|r| r.contains("capacity exhausted")));
    assert!(executions[0].completed_at.is_some());
}

#[tokio::test]
async fn stream_url_failure_does_not_fail_the_run() {
    let harness = Harness::new();
    harness.websockets.fail.store(true, Ordering::SeqCst);
    let request = ExecutionRequest::new("true");

    let response = harness
        .orchestrator
        .run_command(&grant(&request), &request, CLIENT)
        .await
        .expect("run");
    assert_eq!(response.status, ExecutionStatus::Running);
    assert!(response.websocket_url.is_none());
}

#[tokio::test]
async fn invalid_requests_never_reach_the_provider() {
    let harness = Harness::new();

    let blank = ExecutionRequest::new("   ");
    let err = harness
        .orchestrator
        .run_command(&grant(&blank), &blank, CLIENT)
        .await
        .expect_err("blank command");
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let too_long = ExecutionRequest {
        timeout_seconds: Some(18_000),
        ..ExecutionRequest::new("sleep 1")
    };
    let err = harness
        .orchestrator
        .run_command(&grant(&too_long), &too_long, CLIENT)
        .await
        .expect_err("timeout over max");
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let no_image = ExecutionRequest::new("true");
    let err = harness
        .orchestrator
        .run_command(&grant_without_image(&no_image), &no_image, CLIENT)
        .await
        .expect_err("no image");
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    assert!(harness.tasks.started().is_empty());
}

#[tokio::test]
async fn kill_running_execution_requests_termination() {
    let harness = Harness::new();
    let id = start(&harness, "sleep 600").await;

    let body = harness
        .orchestrator
        .kill_execution(&id)
        .await
        .expect("kill")
        .expect("body");
    assert_eq!(body.execution_id, id);
    assert_eq!(body.message, "termination requested");
    assert_eq!(harness.tasks.killed(), vec![id.clone()]);

    let status = harness.orchestrator.get_execution_status(&id).await.expect("status");
    assert_eq!(status.status, ExecutionStatus::Terminating);
}

#[tokio::test]
async fn kill_after_exit_returns_nothing() {
    let harness = Harness::new();
    let id = start(&harness, "sleep 600").await;

    harness.orchestrator.kill_execution(&id).await.expect("kill");
    harness
        .orchestrator
        .record_task_exit(&id, Some(137), None)
        .await
        .expect("exit");

    let execution = harness.orchestrator.get_execution(&id).await.expect("load");
    assert_eq!(execution.status, ExecutionStatus::Terminated);
    assert_eq!(execution.reason.as_deref(), Some("killed"));

    let second = harness.orchestrator.kill_execution(&id).await.expect("kill");
    assert!(second.is_none());
    assert_eq!(harness.tasks.killed().len(), 1);
}

#[tokio::test]
async fn kill_while_terminating_reissues_the_kill() {
    let harness = Harness::new();
    let id = start(&harness, "sleep 600").await;

    harness.orchestrator.kill_execution(&id).await.expect("first kill");
    let again = harness
        .orchestrator
        .kill_execution(&id)
        .await
        .expect("second kill");
    assert!(again.is_some());
    assert_eq!(harness.tasks.killed().len(), 2);
}

#[tokio::test]
async fn kill_without_task_terminates_immediately() {
    let harness = Harness::new();
    let id = start(&harness, "sleep 600").await;
    harness.tasks.missing_on_kill.store(true, Ordering::SeqCst);

    let body = harness
        .orchestrator
        .kill_execution(&id)
        .await
        .expect("kill")
        .expect("body");
    assert_eq!(body.message, "execution terminated");

    let execution = harness.orchestrator.get_execution(&id).await.expect("load");
    assert_eq!(execution.status, ExecutionStatus::Terminated);
    assert!(execution.completed_at.is_some());
}

#[tokio::test]
async fn concurrent_kills_issue_one_transition() {
    let harness = Harness::new();
    let id = start(&harness, "sleep 600").await;
    harness.tasks.missing_on_kill.store(true, Ordering::SeqCst);

    let (a, b) = tokio::join!(
        harness.orchestrator.kill_execution(&id),
        harness.orchestrator.kill_execution(&id)
    );
    let outcomes = [a.expect("kill a"), b.expect("kill b")];
    assert_eq!(outcomes.iter().filter(|o| o.is_some()).count(), 1);
}

#[tokio::test]
async fn unknown_execution_is_not_found() {
    let harness = Harness::new();
    for err in [
        harness.orchestrator.kill_execution("nope").await.expect_err("kill"),
        harness
            .orchestrator
            .get_execution_status("nope")
            .await
            .expect_err("status"),
        harness
            .orchestrator
            .get_logs_by_execution_id("nope", "dev@example.com", CLIENT)
            .await
            .expect_err("logs"),
    ] {
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.resource_id(), Some("nope"));
    }
}

#[tokio::test]
async fn exit_codes_map_to_terminal_states() {
    let harness = Harness::new();
    let ok = start(&harness, "true").await;
    let bad = start(&harness, "false").await;
    let lost = start(&harness, "sleep 600").await;

    harness.orchestrator.record_task_exit(&ok, Some(0), None).await.expect("ok");
    harness.orchestrator.record_task_exit(&bad, Some(2), None).await.expect("bad");
    harness
        .orchestrator
        .record_task_exit(&lost, None, Some("timed out after 600s".to_owned()))
        .await
        .expect("lost");

    let ok = harness.orchestrator.get_execution(&ok).await.expect("load");
    assert_eq!(ok.status, ExecutionStatus::Succeeded);
    assert_eq!(ok.exit_code, Some(0));
    assert!(ok.reason.is_none());

    let bad = harness.orchestrator.get_execution(&bad).await.expect("load");
    assert_eq!(bad.status, ExecutionStatus::Failed);
    assert_eq!(bad.reason.as_deref(), Some("exited with code 2"));

    let lost = harness.orchestrator.get_execution(&lost).await.expect("load");
    assert_eq!(lost.status, ExecutionStatus::Failed);
    assert_eq!(lost.reason.as_deref(), Some("timed out after 600s"));
}

#[tokio::test]
async fn late_exit_report_is_ignored() {
    let harness = Harness::new();
    let id = start(&harness, "true").await;
    harness.orchestrator.record_task_exit(&id, Some(0), None).await.expect("exit");
    harness.orchestrator.record_task_exit(&id, Some(1), None).await.expect("late");

    let execution = harness.orchestrator.get_execution(&id).await.expect("load");
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.exit_code, Some(0));
}

#[tokio::test]
async fn list_applies_limit_and_status_filter() {
    let harness = Harness::new();
    let done = start(&harness, "true").await;
    let _running = start(&harness, "sleep 600").await;
    let failed = start(&harness, "false").await;
    harness.orchestrator.record_task_exit(&done, Some(0), None).await.expect("exit");
    harness.orchestrator.record_task_exit(&failed, Some(1), None).await.expect("exit");

    let all = harness.orchestrator.list_executions(0, None).await.expect("list");
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));

    let limited = harness.orchestrator.list_executions(2, None).await.expect("list");
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].execution_id, all[0].execution_id);

    let filter = vec!["RUNNING".to_owned(), " PENDING ".to_owned(), "SUCCEEDED".to_owned()];
    let filtered = harness
        .orchestrator
        .list_executions(0, Some(&filter))
        .await
        .expect("list");
    let mut statuses: Vec<_> = filtered.iter().map(|e| e.status).collect();
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![ExecutionStatus::Running, ExecutionStatus::Succeeded]);
}

#[tokio::test]
async fn list_filter_edge_cases() {
    let harness = Harness::new();
    start(&harness, "true").await;

    let unknown = vec!["running".to_owned(), "BOGUS".to_owned()];
    let none = harness
        .orchestrator
        .list_executions(0, Some(&unknown))
        .await
        .expect("list");
    assert!(none.is_empty());

    let blanks = vec![String::new(), "  ".to_owned()];
    let none = harness
        .orchestrator
        .list_executions(0, Some(&blanks))
        .await
        .expect("list");
    assert!(none.is_empty());

    let empty: Vec<String> = Vec::new();
    let all = harness
        .orchestrator
        .list_executions(0, Some(&empty))
        .await
        .expect("list");
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn logs_carry_stream_url_only_while_running() {
    let harness = Harness::new();
    let id = start(&harness, "echo hello").await;

    let running = harness
        .orchestrator
        .get_logs_by_execution_id(&id, "dev@example.com", CLIENT)
        .await
        .expect("logs");
    let messages: Vec<_> = running.events.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["hello", "world"]);
    assert!(running.websocket_url.is_some());

    harness.orchestrator.record_task_exit(&id, Some(0), None).await.expect("exit");
    let finished = harness
        .orchestrator
        .get_logs_by_execution_id(&id, "dev@example.com", CLIENT)
        .await
        .expect("logs");
    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert!(finished.websocket_url.is_none());
}

#[tokio::test]
async fn logs_fail_when_stream_url_cannot_be_issued() {
    let harness = Harness::new();
    let id = start(&harness, "sleep 600").await;
    harness.websockets.fail.store(true, Ordering::SeqCst);

    let err = harness
        .orchestrator
        .get_logs_by_execution_id(&id, "dev@example.com", CLIENT)
        .await
        .expect_err("issuer down");
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}

#[tokio::test]
async fn exit_report_for_abandoned_start_uses_the_exit_code() {
    use runvoy::store::ExecutionRepository;

    let harness = Harness::new();
    let clean = start(&harness, "true").await;
    let broken = start(&harness, "false").await;

    // A submission dropped between launch and the RUNNING write.
    for id in [&clean, &broken] {
        let mut execution = harness.orchestrator.get_execution(id).await.expect("load");
        execution.status = ExecutionStatus::Starting;
        assert!(harness.store.update_execution(&execution).await.expect("update"));
    }

    harness.orchestrator.record_task_exit(&clean, Some(0), None).await.expect("exit");
    harness.orchestrator.record_task_exit(&broken, Some(2), None).await.expect("exit");

    let clean = harness.orchestrator.get_execution(&clean).await.expect("load");
    assert_eq!(clean.status, ExecutionStatus::Succeeded);
    assert_eq!(clean.exit_code, Some(0));

    let broken = harness.orchestrator.get_execution(&broken).await.expect("load");
    assert_eq!(broken.status, ExecutionStatus::Failed);
    assert_eq!(broken.reason.as_deref(), Some("exited with code 2"));
}
