//! # taskhub
//!
//! Durable orchestration engine. Orchestration state is an event-sourced
//! history that is persisted by a [`providers::Provider`] and replayed on
//! every resumption. A worker pulls orchestration work items, folds newly
//! delivered events into the instance's runtime state, asks an
//! [`runtime::OrchestratorExecutor`] for the next actions, and hands the
//! updated state back to the provider.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskhub::providers::in_memory::InMemoryProvider;
//! use taskhub::providers::Provider;
//! use taskhub::runtime::{ExecutionResults, FnExecutor, OrchestrationProcessor, TaskWorker, TaskWorkerOptions};
//! use taskhub::{Action, Client, NewOrchestrationOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider: Arc<dyn Provider> = Arc::new(InMemoryProvider::default());
//! let executor = Arc::new(FnExecutor::new(|_id, _old, _new| {
//!     Ok(ExecutionResults::new(vec![Action::complete(1, Some("done".to_string()))]))
//! }));
//!
//! let worker = TaskWorker::new(
//!     OrchestrationProcessor::new(provider.clone(), executor),
//!     TaskWorkerOptions::default(),
//! );
//! worker.start().await;
//!
//! let client = Client::new(provider);
//! let id = client
//!     .schedule_new_orchestration("Hello", NewOrchestrationOptions::default())
//!     .await?;
//! # let _ = id;
//! worker.stop().await;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod client;
pub mod providers;
pub mod runtime;

pub use client::{Client, ClientError, ClientOptions, NewOrchestrationOptions};
pub use providers::{OrchestrationMetadata, OrchestrationWorkItem, Provider, ProviderError};
pub use runtime::{OrchestrationRuntimeState, OrchestratorExecutor};

/// Event id carried by events that were not produced from an orchestrator action.
pub const UNSEQUENCED_EVENT_ID: i32 = -1;

/// Number of entries shown by [`history_summary`] and [`action_summary`] before eliding.
const SUMMARY_LIMIT: usize = 10;

/// Runtime status of an orchestration instance, derived from its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    ContinuedAsNew,
}

impl OrchestrationStatus {
    /// Completed, Failed and Terminated are terminal. ContinuedAsNew is not:
    /// the instance keeps running with truncated history.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Terminated => "Terminated",
            Self::ContinuedAsNew => "ContinuedAsNew",
        }
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrchestrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Running" => Ok(Self::Running),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            "Terminated" => Ok(Self::Terminated),
            "ContinuedAsNew" => Ok(Self::ContinuedAsNew),
            other => Err(format!("unknown orchestration status: {other}")),
        }
    }
}

/// Structured failure information for failed tasks and orchestrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetails {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl FailureDetails {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack_trace: None,
        }
    }
}

impl fmt::Display for FailureDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// Link from a sub-orchestration back to the orchestration that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInstance {
    /// Id of the `CreateSubOrchestration` action in the parent.
    pub task_scheduled_id: i32,
    pub name: String,
    pub instance_id: String,
}

/// One immutable fact in an orchestration's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Sequence slot assigned by the orchestration for events produced from
    /// actions; [`UNSEQUENCED_EVENT_ID`] for externally delivered events.
    pub event_id: i32,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    ExecutionStarted {
        name: String,
        instance_id: String,
        input: Option<String>,
        parent: Option<ParentInstance>,
    },
    ExecutionCompleted {
        status: OrchestrationStatus,
        result: Option<String>,
        failure: Option<FailureDetails>,
    },
    ExecutionTerminated {
        reason: Option<String>,
    },
    /// Bookkeeping event that opens every processing pass and advances the
    /// orchestration's notion of the current time.
    OrchestratorStarted,
    TaskScheduled {
        name: String,
        input: Option<String>,
    },
    TaskCompleted {
        task_scheduled_id: i32,
        result: Option<String>,
    },
    TaskFailed {
        task_scheduled_id: i32,
        failure: FailureDetails,
    },
    TimerCreated {
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        timer_id: i32,
        fire_at: DateTime<Utc>,
    },
    SubOrchestrationInstanceCreated {
        name: String,
        instance_id: String,
        input: Option<String>,
    },
    SubOrchestrationInstanceCompleted {
        task_scheduled_id: i32,
        result: Option<String>,
    },
    SubOrchestrationInstanceFailed {
        task_scheduled_id: i32,
        failure: FailureDetails,
    },
    EventRaised {
        name: String,
        input: Option<String>,
    },
    EventSent {
        instance_id: String,
        name: String,
        input: Option<String>,
    },
}

/// Canonical identity used for duplicate suppression.
///
/// Lifecycle events are singletons per execution. Events bound to a sequence
/// slot are identified by their family and slot, so a second event for an
/// occupied slot is a duplicate regardless of payload. Raised events have no
/// slot and are identified by content plus their send time, which is fixed
/// when the event is created and survives redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventIdentity {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionTerminated,
    TaskScheduled(i32),
    TaskResult(i32),
    TimerCreated(i32),
    TimerFired(i32),
    SubOrchestrationCreated(i32),
    SubOrchestrationResult(i32),
    EventSent(i32),
    EventRaised {
        name: String,
        input: Option<String>,
        sent_at: DateTime<Utc>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "ExecutionStarted",
            Self::ExecutionCompleted { .. } => "ExecutionCompleted",
            Self::ExecutionTerminated { .. } => "ExecutionTerminated",
            Self::OrchestratorStarted => "OrchestratorStarted",
            Self::TaskScheduled { .. } => "TaskScheduled",
            Self::TaskCompleted { .. } => "TaskCompleted",
            Self::TaskFailed { .. } => "TaskFailed",
            Self::TimerCreated { .. } => "TimerCreated",
            Self::TimerFired { .. } => "TimerFired",
            Self::SubOrchestrationInstanceCreated { .. } => "SubOrchestrationInstanceCreated",
            Self::SubOrchestrationInstanceCompleted { .. } => "SubOrchestrationInstanceCompleted",
            Self::SubOrchestrationInstanceFailed { .. } => "SubOrchestrationInstanceFailed",
            Self::EventRaised { .. } => "EventRaised",
            Self::EventSent { .. } => "EventSent",
        }
    }
}

impl Event {
    pub fn new(event_id: i32, kind: EventKind) -> Self {
        Self::at(event_id, Utc::now(), kind)
    }

    pub fn at(event_id: i32, timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            event_id,
            timestamp,
            kind,
        }
    }

    pub fn orchestrator_started() -> Self {
        Self::new(UNSEQUENCED_EVENT_ID, EventKind::OrchestratorStarted)
    }

    pub fn execution_started(
        name: impl Into<String>,
        instance_id: impl Into<String>,
        input: Option<String>,
        parent: Option<ParentInstance>,
    ) -> Self {
        Self::new(
            UNSEQUENCED_EVENT_ID,
            EventKind::ExecutionStarted {
                name: name.into(),
                instance_id: instance_id.into(),
                input,
                parent,
            },
        )
    }

    pub fn execution_terminated(reason: Option<String>) -> Self {
        Self::new(UNSEQUENCED_EVENT_ID, EventKind::ExecutionTerminated { reason })
    }

    pub fn task_completed(task_scheduled_id: i32, result: Option<String>) -> Self {
        Self::new(
            UNSEQUENCED_EVENT_ID,
            EventKind::TaskCompleted {
                task_scheduled_id,
                result,
            },
        )
    }

    pub fn task_failed(task_scheduled_id: i32, failure: FailureDetails) -> Self {
        Self::new(
            UNSEQUENCED_EVENT_ID,
            EventKind::TaskFailed {
                task_scheduled_id,
                failure,
            },
        )
    }

    pub fn timer_fired(timer_id: i32, fire_at: DateTime<Utc>) -> Self {
        Self::new(UNSEQUENCED_EVENT_ID, EventKind::TimerFired { timer_id, fire_at })
    }

    pub fn event_raised(name: impl Into<String>, input: Option<String>) -> Self {
        Self::new(
            UNSEQUENCED_EVENT_ID,
            EventKind::EventRaised {
                name: name.into(),
                input,
            },
        )
    }

    /// Identity used for duplicate detection. `None` for events that are
    /// never deduplicated.
    pub fn identity(&self) -> Option<EventIdentity> {
        let id = self.event_id;
        match &self.kind {
            EventKind::OrchestratorStarted => None,
            EventKind::ExecutionStarted { .. } => Some(EventIdentity::ExecutionStarted),
            EventKind::ExecutionCompleted { .. } => Some(EventIdentity::ExecutionCompleted),
            EventKind::ExecutionTerminated { .. } => Some(EventIdentity::ExecutionTerminated),
            EventKind::TaskScheduled { .. } => Some(EventIdentity::TaskScheduled(id)),
            EventKind::TaskCompleted { task_scheduled_id, .. } | EventKind::TaskFailed { task_scheduled_id, .. } => {
                Some(EventIdentity::TaskResult(*task_scheduled_id))
            }
            EventKind::TimerCreated { .. } => Some(EventIdentity::TimerCreated(id)),
            EventKind::TimerFired { timer_id, .. } => Some(EventIdentity::TimerFired(*timer_id)),
            EventKind::SubOrchestrationInstanceCreated { .. } => Some(EventIdentity::SubOrchestrationCreated(id)),
            EventKind::SubOrchestrationInstanceCompleted { task_scheduled_id, .. }
            | EventKind::SubOrchestrationInstanceFailed { task_scheduled_id, .. } => {
                Some(EventIdentity::SubOrchestrationResult(*task_scheduled_id))
            }
            EventKind::EventSent { .. } => Some(EventIdentity::EventSent(id)),
            EventKind::EventRaised { name, input } => Some(EventIdentity::EventRaised {
                name: name.clone(),
                input: input.clone(),
                sent_at: self.timestamp,
            }),
        }
    }
}

/// An orchestrator directive returned by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Sequence slot of the action; becomes the `event_id` of the event it produces.
    pub id: i32,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ActionKind {
    ScheduleTask {
        name: String,
        input: Option<String>,
    },
    CreateTimer {
        fire_at: DateTime<Utc>,
    },
    CreateSubOrchestration {
        name: String,
        instance_id: Option<String>,
        input: Option<String>,
    },
    SendEvent {
        instance_id: String,
        name: String,
        data: Option<String>,
    },
    CompleteOrchestration {
        status: OrchestrationStatus,
        result: Option<String>,
        failure: Option<FailureDetails>,
    },
    ContinueAsNew {
        input: Option<String>,
        #[serde(default)]
        carryover_events: Vec<Event>,
    },
    /// Any action kind emitted by an executor that this engine does not know.
    #[serde(other)]
    Unknown,
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScheduleTask { .. } => "ScheduleTask",
            Self::CreateTimer { .. } => "CreateTimer",
            Self::CreateSubOrchestration { .. } => "CreateSubOrchestration",
            Self::SendEvent { .. } => "SendEvent",
            Self::CompleteOrchestration { .. } => "CompleteOrchestration",
            Self::ContinueAsNew { .. } => "ContinueAsNew",
            Self::Unknown => "Unknown",
        }
    }
}

impl Action {
    pub fn new(id: i32, kind: ActionKind) -> Self {
        Self { id, kind }
    }

    pub fn schedule_task(id: i32, name: impl Into<String>, input: Option<String>) -> Self {
        Self::new(
            id,
            ActionKind::ScheduleTask {
                name: name.into(),
                input,
            },
        )
    }

    pub fn create_timer(id: i32, fire_at: DateTime<Utc>) -> Self {
        Self::new(id, ActionKind::CreateTimer { fire_at })
    }

    pub fn complete(id: i32, result: Option<String>) -> Self {
        Self::new(
            id,
            ActionKind::CompleteOrchestration {
                status: OrchestrationStatus::Completed,
                result,
                failure: None,
            },
        )
    }

    pub fn fail(id: i32, failure: FailureDetails) -> Self {
        Self::new(
            id,
            ActionKind::CompleteOrchestration {
                status: OrchestrationStatus::Failed,
                result: None,
                failure: Some(failure),
            },
        )
    }

    pub fn continue_as_new(id: i32, input: Option<String>) -> Self {
        Self::new(
            id,
            ActionKind::ContinueAsNew {
                input,
                carryover_events: Vec::new(),
            },
        )
    }
}

/// Compact, bounded rendering of an event list for log lines, e.g.
/// `[OrchestratorStarted, ExecutionStarted, ...2 more]`.
pub fn history_summary(events: &[Event]) -> String {
    summarize(events.iter().map(|e| e.kind.name()), events.len())
}

/// Compact, bounded rendering of an action list for log lines.
pub fn action_summary(actions: &[Action]) -> String {
    summarize(actions.iter().map(|a| a.kind.name()), actions.len())
}

fn summarize<'a>(names: impl Iterator<Item = &'a str>, total: usize) -> String {
    let mut parts: Vec<String> = names.take(SUMMARY_LIMIT).map(str::to_string).collect();
    if total > SUMMARY_LIMIT {
        parts.push(format!("...{} more", total - SUMMARY_LIMIT));
    }
    format!("[{}]", parts.join(", "))
}
