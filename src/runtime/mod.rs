//! Orchestration runtime: the event-sourced state machine, the work-item
//! processor that drives it, and the polling worker that hosts processors.
use crate::{Action, Event};
use async_trait::async_trait;

pub mod limits;
pub mod observability;
mod processor;
mod state;
mod worker;

pub use observability::{LogFormat, ObservabilityConfig, init_logging};
pub use processor::{DropReason, OrchestrationProcessor, ProcessError, ProcessOutcome, ProcessorOptions};
pub use state::{AddEventError, OrchestrationRuntimeState, OrchestratorMessage, StateError};
pub use worker::{TaskProcessor, TaskWorker, TaskWorkerOptions};

/// Output of one orchestrator invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResults {
    pub actions: Vec<Action>,
    pub custom_status: Option<String>,
}

impl ExecutionResults {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            actions,
            custom_status: None,
        }
    }

    pub fn with_custom_status(mut self, custom_status: impl Into<String>) -> Self {
        self.custom_status = Some(custom_status.into());
        self
    }
}

/// Error reported by an orchestrator executor. Propagated verbatim by the processor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Runs user orchestration code against replayed history.
///
/// Implementations replay `old_events`, then feed `new_events`, and return
/// the actions the orchestration produced. They are expected to be
/// deterministic for a given history.
#[async_trait]
pub trait OrchestratorExecutor: Send + Sync {
    async fn execute_orchestrator(
        &self,
        instance_id: &str,
        old_events: &[Event],
        new_events: &[Event],
    ) -> Result<ExecutionResults, ExecutorError>;
}

/// Function wrapper that implements [`OrchestratorExecutor`] for a plain closure.
pub struct FnExecutor<F>(F);

impl<F> FnExecutor<F>
where
    F: Fn(&str, &[Event], &[Event]) -> Result<ExecutionResults, ExecutorError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> OrchestratorExecutor for FnExecutor<F>
where
    F: Fn(&str, &[Event], &[Event]) -> Result<ExecutionResults, ExecutorError> + Send + Sync + 'static,
{
    async fn execute_orchestrator(
        &self,
        instance_id: &str,
        old_events: &[Event],
        new_events: &[Event],
    ) -> Result<ExecutionResults, ExecutorError> {
        (self.0)(instance_id, old_events, new_events)
    }
}
