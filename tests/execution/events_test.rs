//! Provider exit events flowing into the orchestrator.

use std::sync::Arc;

use tokio::sync::mpsc;

use runvoy::authorization::ResourceAccessValidator;
use runvoy::execution::{spawn_event_loop, ExecutionRequest, ExecutionStatus, TaskEvent};

use crate::support::{image, Harness, RecordingEnforcer};

#[tokio::test]
async fn events_are_recorded_until_senders_drop() {
    let harness = Harness::new();
    let validator = ResourceAccessValidator::new(Arc::new(RecordingEnforcer::allow_all()));
    let ubuntu = image("ubuntu:22.04", "ubuntu-22.04-abcd1234");

    let mut ids = Vec::new();
    for command in ["true", "false"] {
        let request = ExecutionRequest::new(command);
        let grant = validator
            .validate_execution_resource_access("dev@example.com", &request, Some(&ubuntu))
            .expect("allowed");
        let response = harness
            .orchestrator
            .run_command(&grant, &request, "127.0.0.1")
            .await
            .expect("run");
        ids.push(response.execution_id);
    }

    let (tx, rx) = mpsc::channel(8);
    let handle = spawn_event_loop(Arc::clone(&harness.orchestrator), rx);

    tx.send(TaskEvent::exited(&ids[0], 0)).await.expect("send");
    tx.send(TaskEvent::exited(&ids[1], 3)).await.expect("send");
    tx.send(TaskEvent::lost("unknown-execution", "container vanished".to_owned()))
        .await
        .expect("send");
    drop(tx);
    handle.await.expect("event loop");

    let first = harness.orchestrator.get_execution(&ids[0]).await.expect("load");
    assert_eq!(first.status, ExecutionStatus::Succeeded);
    let second = harness.orchestrator.get_execution(&ids[1]).await.expect("load");
    assert_eq!(second.status, ExecutionStatus::Failed);
    assert_eq!(second.exit_code, Some(3));
}
