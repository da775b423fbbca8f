use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::OrchestrationRuntimeState;
use crate::{Event, EventKind, FailureDetails, OrchestrationStatus};

mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::{ProviderError, ProviderErrorKind};

/// A leased batch of undelivered events for one orchestration instance.
///
/// The work item is owned by the processing pass that fetched it and is
/// handed back by value to the provider on completion or abandonment.
#[derive(Debug)]
pub struct OrchestrationWorkItem {
    pub instance_id: String,
    /// Newly delivered events, in delivery order.
    pub new_events: Vec<Event>,
    /// Runtime state, loaded on demand during processing.
    pub state: Option<OrchestrationRuntimeState>,
    /// Provider lease on the instance; required to complete or abandon.
    pub lock_token: String,
    /// Highest number of times any of the carried events has been dequeued.
    pub dequeue_count: u32,
}

/// A `TaskScheduled` event recorded for an activity worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityWorkItem {
    pub instance_id: String,
    pub event: Event,
}

/// Summary of an orchestration instance as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationMetadata {
    pub instance_id: String,
    pub name: String,
    pub runtime_status: OrchestrationStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub failure_details: Option<FailureDetails>,
    pub termination_reason: Option<String>,
}

impl OrchestrationMetadata {
    /// Metadata for an instance that has been created but not yet run.
    ///
    /// Returns `None` unless `start_event` is an `ExecutionStarted` event.
    pub fn pending(start_event: &Event) -> Option<Self> {
        let EventKind::ExecutionStarted {
            name,
            instance_id,
            input,
            ..
        } = &start_event.kind
        else {
            return None;
        };
        Some(Self {
            instance_id: instance_id.clone(),
            name: name.clone(),
            runtime_status: OrchestrationStatus::Pending,
            created_at: start_event.timestamp,
            last_updated_at: start_event.timestamp,
            input: input.clone(),
            output: None,
            custom_status: None,
            failure_details: None,
            termination_reason: None,
        })
    }

    /// Metadata derived from folded runtime state. `None` if the state has not started.
    pub fn from_state(state: &OrchestrationRuntimeState) -> Option<Self> {
        let name = state.name().ok()?;
        let created_at = state.created_time().ok()?;
        Some(Self {
            instance_id: state.instance_id().to_string(),
            name: name.to_string(),
            runtime_status: state.runtime_status(),
            created_at,
            last_updated_at: state.last_updated_time().unwrap_or(created_at),
            input: state.input().map(str::to_string),
            output: state.output().map(str::to_string),
            custom_status: state.custom_status().map(str::to_string),
            failure_details: state.failure_details().cloned(),
            termination_reason: state.termination_reason().map(str::to_string),
        })
    }

    pub fn is_complete(&self) -> bool {
        self.runtime_status.is_terminal()
    }

    pub fn is_running(&self) -> bool {
        !self.is_complete() && self.runtime_status != OrchestrationStatus::Pending
    }
}

/// Storage and queue backend.
///
/// Providers persist per-instance history plus a status summary, queue
/// events addressed to instances, and lease each instance's pending events
/// to at most one processor at a time. The runtime holds no locks of its own
/// and relies on these leases for mutual exclusion.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Create an instance from its `ExecutionStarted` event and enqueue that
    /// event for processing. Fails with `AlreadyExists` for a known id.
    async fn create_orchestration_instance(&self, start_event: Event) -> Result<(), ProviderError>;

    /// Enqueue an event for an existing instance. Fails with `InstanceNotFound` otherwise.
    async fn add_new_orchestration_event(&self, instance_id: &str, event: Event) -> Result<(), ProviderError>;

    async fn get_orchestration_metadata(&self, instance_id: &str) -> Result<OrchestrationMetadata, ProviderError>;

    /// Lease the visible pending events of one unleased instance, if any.
    async fn get_orchestration_work_item(&self) -> Result<Option<OrchestrationWorkItem>, ProviderError>;

    /// Load committed history for the work item's instance.
    async fn get_orchestration_runtime_state(
        &self,
        work_item: &OrchestrationWorkItem,
    ) -> Result<OrchestrationRuntimeState, ProviderError>;

    /// Persist the work item's state, consume its events, dispatch the
    /// state's pending timers, tasks and messages, and release the lease.
    async fn complete_orchestration_work_item(&self, work_item: OrchestrationWorkItem) -> Result<(), ProviderError>;

    /// Release the lease and make the work item's events visible again.
    async fn abandon_orchestration_work_item(&self, work_item: OrchestrationWorkItem) -> Result<(), ProviderError>;

    /// Committed history of an instance, oldest first.
    async fn read_history(&self, instance_id: &str) -> Result<Vec<Event>, ProviderError>;
}
