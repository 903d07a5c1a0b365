//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use runvoy::authorization::{Action, Enforcer};
use runvoy::catalog::ImageInfo;
use runvoy::execution::ExecutionOrchestrator;
use runvoy::providers::{
    LogEvent, LogManager, ProviderError, TaskHandle, TaskManager, TaskSpec, WebSocketManager,
};
use runvoy::store::memory::MemoryStore;

/// Enforcer that records every query and allows everything except listed objects.
#[derive(Default)]
pub struct RecordingEnforcer {
    deny_all: bool,
    denied: HashSet<String>,
    calls: Mutex<Vec<(String, String, Action)>>,
}

impl RecordingEnforcer {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn deny_all() -> Self {
        Self {
            deny_all: true,
            ..Self::default()
        }
    }

    pub fn deny(objects: &[&str]) -> Self {
        Self {
            denied: objects.iter().map(|o| (*o).to_owned()).collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, String, Action)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn objects(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, object, _)| object).collect()
    }
}

impl Enforcer for RecordingEnforcer {
    fn enforce(&self, subject: &str, object: &str, action: Action) -> runvoy::Result<bool> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((subject.to_owned(), object.to_owned(), action));
        Ok(!self.deny_all && !self.denied.contains(object))
    }
}

/// Task manager that records starts and kills without running anything.
#[derive(Default)]
pub struct FakeTaskManager {
    pub fail_start: AtomicBool,
    pub missing_on_kill: AtomicBool,
    started: Mutex<Vec<(String, TaskSpec)>>,
    killed: Mutex<Vec<String>>,
}

impl FakeTaskManager {
    pub fn failing() -> Self {
        let tasks = Self::default();
        tasks.fail_start.store(true, Ordering::SeqCst);
        tasks
    }

    pub fn started(&self) -> Vec<(String, TaskSpec)> {
        self.started.lock().expect("started lock").clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().expect("killed lock").clone()
    }
}

#[async_trait]
impl TaskManager for FakeTaskManager {
    async fn start_task(&self, subject: &str, spec: &TaskSpec) -> Result<TaskHandle, ProviderError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ProviderError::InvalidTask("capacity exhausted".to_owned()));
        }
        self.started
            .lock()
            .expect("started lock")
            .push((subject.to_owned(), spec.clone()));
        Ok(TaskHandle {
            task_ref: format!("task-{}", spec.execution_id),
            started_at: Utc::now(),
        })
    }

    async fn kill_task(&self, execution_id: &str) -> Result<(), ProviderError> {
        if self.missing_on_kill.load(Ordering::SeqCst) {
            return Err(ProviderError::TaskNotFound(execution_id.to_owned()));
        }
        self.killed
            .lock()
            .expect("killed lock")
            .push(execution_id.to_owned());
        Ok(())
    }
}

/// Log manager that returns a fixed set of lines for every execution.
#[derive(Default)]
pub struct FakeLogManager {
    pub lines: Vec<String>,
}

impl FakeLogManager {
    pub fn with_lines(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| (*l).to_owned()).collect(),
        }
    }
}

#[async_trait]
impl LogManager for FakeLogManager {
    async fn fetch_logs(&self, _execution_id: &str) -> Result<Vec<LogEvent>, ProviderError> {
        Ok(self
            .lines
            .iter()
            .map(|line| LogEvent {
                timestamp: Utc::now(),
                message: line.clone(),
            })
            .collect())
    }
}

/// URL issuer that encodes its inputs in the URL.
#[derive(Default)]
pub struct FakeWebSocketManager {
    pub fail: AtomicBool,
}

#[async_trait]
impl WebSocketManager for FakeWebSocketManager {
    async fn generate_url(
        &self,
        execution_id: &str,
        subject: &str,
        client_addr: &str,
    ) -> Result<String, ProviderError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::StreamUrl("issuer offline".to_owned()));
        }
        Ok(format!(
            "wss://stream.test/{execution_id}?subject={subject}&client={client_addr}"
        ))
    }
}

/// Everything an orchestrator test needs.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub tasks: Arc<FakeTaskManager>,
    pub logs: Arc<FakeLogManager>,
    pub websockets: Arc<FakeWebSocketManager>,
    pub orchestrator: Arc<ExecutionOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_tasks(FakeTaskManager::default())
    }

    pub fn with_tasks(tasks: FakeTaskManager) -> Self {
        let store = Arc::new(MemoryStore::new());
        let tasks = Arc::new(tasks);
        let logs = Arc::new(FakeLogManager::with_lines(&["hello", "world"]));
        let websockets = Arc::new(FakeWebSocketManager::default());
        let orchestrator = Arc::new(ExecutionOrchestrator::new(
            store.clone(),
            tasks.clone(),
            logs.clone(),
            websockets.clone(),
        ));
        Self {
            store,
            tasks,
            logs,
            websockets,
            orchestrator,
        }
    }
}

/// A registered-looking image record.
pub fn image(reference: &str, image_id: &str) -> ImageInfo {
    ImageInfo {
        image: reference.to_owned(),
        image_id: image_id.to_owned(),
        name: reference.split(':').next().unwrap_or(reference).to_owned(),
        tag: "latest".to_owned(),
        registry: None,
        is_default: false,
        created_by: "admin@example.com".to_owned(),
        created_at: Utc::now(),
    }
}
