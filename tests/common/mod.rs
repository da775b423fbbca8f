#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use taskhub::providers::Provider;
use taskhub::providers::in_memory::InMemoryProvider;
use taskhub::providers::sqlite::SqliteProvider;
use taskhub::runtime::{ExecutionResults, ExecutorError, OrchestratorExecutor};
use taskhub::{Event, EventKind};
use tempfile::TempDir;

/// One recorded executor invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub instance_id: String,
    pub old_events: Vec<Event>,
    pub new_events: Vec<Event>,
}

type Behavior = dyn Fn(&Invocation) -> Result<ExecutionResults, ExecutorError> + Send + Sync;

/// Executor that records every call and answers through a closure.
pub struct RecordingExecutor {
    behavior: Box<Behavior>,
    calls: Mutex<Vec<Invocation>>,
}

impl RecordingExecutor {
    pub fn new(
        behavior: impl Fn(&Invocation) -> Result<ExecutionResults, ExecutorError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            behavior: Box::new(behavior),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Executor that never produces actions.
    pub fn idle() -> Arc<Self> {
        Self::new(|_| Ok(ExecutionResults::default()))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl OrchestratorExecutor for RecordingExecutor {
    async fn execute_orchestrator(
        &self,
        instance_id: &str,
        old_events: &[Event],
        new_events: &[Event],
    ) -> Result<ExecutionResults, ExecutorError> {
        let invocation = Invocation {
            instance_id: instance_id.to_string(),
            old_events: old_events.to_vec(),
            new_events: new_events.to_vec(),
        };
        let result = (self.behavior)(&invocation);
        self.calls.lock().unwrap().push(invocation);
        result
    }
}

pub fn kinds(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.name()).collect()
}

pub fn has_kind(events: &[Event], name: &str) -> bool {
    events.iter().any(|e| e.kind.name() == name)
}

pub fn task_completed_for(events: &[Event], slot: i32) -> bool {
    events
        .iter()
        .any(|e| matches!(e.kind, EventKind::TaskCompleted { task_scheduled_id, .. } if task_scheduled_id == slot))
}

pub fn in_memory() -> Arc<dyn Provider> {
    Arc::new(InMemoryProvider::default())
}

pub async fn create_sqlite_store_disk() -> (Arc<SqliteProvider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    let db_url = format!("sqlite:{}", db_path.display());
    let store = Arc::new(SqliteProvider::new(&db_url, None).await.unwrap());
    (store, td)
}
