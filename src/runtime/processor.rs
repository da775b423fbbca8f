//! Orchestration work-item processor.
//!
//! Turns one leased [`OrchestrationWorkItem`] into zero or more executor
//! invocations:
//! - loads the instance's runtime state if the provider did not supply it
//! - merges newly delivered events, dropping duplicates
//! - invokes the executor and applies its actions, looping while the
//!   orchestration continues as new
//!
//! Duplicate, stale and poisoned work items are not errors; they are
//! reported as [`ProcessOutcome::Dropped`] so the worker completes them
//! instead of retrying.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::limits::MAX_CONTINUE_AS_NEW_COUNT;
use super::state::{AddEventError, StateError};
use super::worker::TaskProcessor;
use super::{ExecutorError, OrchestratorExecutor};
use crate::providers::{OrchestrationWorkItem, Provider, ProviderError};
use crate::{Event, EventKind, OrchestrationStatus, action_summary, history_summary};

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Executor invocations allowed in one pass while the orchestration keeps
    /// continuing as new. Default: [`MAX_CONTINUE_AS_NEW_COUNT`].
    pub max_continue_as_new: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_continue_as_new: MAX_CONTINUE_AS_NEW_COUNT,
        }
    }
}

/// Why a work item was completed without invoking the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The stored history is structurally inconsistent.
    InvalidState,
    /// The instance already reached a terminal status.
    AlreadyCompleted,
    /// Every delivered event was a duplicate or otherwise rejected.
    NoNewEvents,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The executor ran `invocations` times and left the instance in `status`.
    Executed {
        status: OrchestrationStatus,
        invocations: usize,
    },
    /// A delivered `ExecutionTerminated` ended the instance; the executor was not invoked.
    Terminated,
    Dropped(DropReason),
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("error executing orchestrator: {0}")]
    Executor(#[from] ExecutorError),
    #[error("failed to apply the execution result actions: {0}")]
    ApplyActions(#[from] StateError),
    #[error("exceeded tight-loop continue-as-new limit of {0} iterations")]
    ContinueAsNewLimit(usize),
    #[error("processing was cancelled")]
    Cancelled,
}

pub struct OrchestrationProcessor {
    provider: Arc<dyn Provider>,
    executor: Arc<dyn OrchestratorExecutor>,
    options: ProcessorOptions,
}

impl OrchestrationProcessor {
    pub fn new(provider: Arc<dyn Provider>, executor: Arc<dyn OrchestratorExecutor>) -> Self {
        Self::with_options(provider, executor, ProcessorOptions::default())
    }

    pub fn with_options(
        provider: Arc<dyn Provider>,
        executor: Arc<dyn OrchestratorExecutor>,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            provider,
            executor,
            options,
        }
    }

    pub fn with_max_continue_as_new(mut self, max_continue_as_new: usize) -> Self {
        self.options.max_continue_as_new = max_continue_as_new;
        self
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Process one work item: load, merge, execute.
    ///
    /// On `Ok` the caller completes the work item; on `Err` it abandons it.
    pub async fn process(
        &self,
        wi: &mut OrchestrationWorkItem,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ProcessError> {
        let instance = wi.instance_id.clone();
        debug!(
            target: "taskhub::runtime::processor",
            instance_id = %instance,
            event_count = wi.new_events.len(),
            events = %history_summary(&wi.new_events),
            "received work item"
        );

        if wi.state.is_none() {
            ensure_not_cancelled(cancel)?;
            let state = self
                .provider
                .get_orchestration_runtime_state(wi)
                .await?;
            wi.state = Some(state);
        }
        debug!(
            target: "taskhub::runtime::processor",
            instance_id = %instance,
            state = %describe_state(wi),
            "got orchestration runtime state"
        );

        if let Some(reason) = merge_work_item(wi) {
            return Ok(ProcessOutcome::Dropped(reason));
        }

        let Some(state) = wi.state.as_mut() else {
            return Err(ProcessError::Provider(ProviderError::permanent(
                "get_orchestration_runtime_state",
                "work item has no runtime state",
            )));
        };

        if state.is_completed() {
            info!(
                target: "taskhub::runtime::processor",
                instance_id = %instance,
                status = %state.runtime_status(),
                reason = state.termination_reason().unwrap_or(""),
                "orchestration terminated"
            );
            return Ok(ProcessOutcome::Terminated);
        }

        let mut invocations = 0usize;
        loop {
            ensure_not_cancelled(cancel)?;
            if invocations > 0 {
                debug!(
                    target: "taskhub::runtime::processor",
                    instance_id = %instance,
                    event_count = state.new_events().len(),
                    events = %history_summary(state.new_events()),
                    "continuing as new"
                );
            } else {
                debug!(target: "taskhub::runtime::processor", instance_id = %instance, "invoking orchestrator");
            }

            let results = self
                .executor
                .execute_orchestrator(&instance, state.old_events(), state.new_events())
                .await?;
            invocations += 1;
            debug!(
                target: "taskhub::runtime::processor",
                instance_id = %instance,
                action_count = results.actions.len(),
                actions = %action_summary(&results.actions),
                "orchestrator returned actions"
            );

            let continued_as_new = state.apply_actions(results.actions)?;
            state.set_custom_status(results.custom_status);

            if continued_as_new {
                let dropped = state.dropped_carryover_events();
                if dropped > 0 {
                    warn!(
                        target: "taskhub::runtime::processor",
                        instance_id = %instance,
                        dropped,
                        "dropping carry-over events rejected by the new execution"
                    );
                }
                debug!(
                    target: "taskhub::runtime::processor",
                    instance_id = %instance,
                    event_count = state.new_events().len(),
                    invocations,
                    "continued as new"
                );
                if invocations >= self.options.max_continue_as_new {
                    return Err(ProcessError::ContinueAsNewLimit(self.options.max_continue_as_new));
                }
                continue;
            }

            if state.is_completed() {
                info!(
                    target: "taskhub::runtime::processor",
                    instance_id = %instance,
                    orchestration_name = state.name().unwrap_or("(unknown)"),
                    status = %state.runtime_status(),
                    "orchestration completed"
                );
            }
            return Ok(ProcessOutcome::Executed {
                status: state.runtime_status(),
                invocations,
            });
        }
    }
}

#[async_trait::async_trait]
impl TaskProcessor for OrchestrationProcessor {
    type WorkItem = OrchestrationWorkItem;
    type Outcome = ProcessOutcome;
    type Error = ProcessError;

    fn name(&self) -> &'static str {
        "orchestration-processor"
    }

    async fn fetch_work_item(&self) -> Result<Option<OrchestrationWorkItem>, ProviderError> {
        self.provider.get_orchestration_work_item().await
    }

    async fn process_work_item(
        &self,
        wi: &mut OrchestrationWorkItem,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ProcessError> {
        self.process(wi, cancel).await
    }

    async fn complete_work_item(&self, wi: OrchestrationWorkItem) -> Result<(), ProviderError> {
        self.provider.complete_orchestration_work_item(wi).await
    }

    async fn abandon_work_item(&self, wi: OrchestrationWorkItem) -> Result<(), ProviderError> {
        self.provider.abandon_orchestration_work_item(wi).await
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), ProcessError> {
    if cancel.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }
    Ok(())
}

/// Fold the work item's events into its state.
///
/// Returns the drop reason when the executor must not run. A dropped work
/// item leaves the state exactly as loaded.
fn merge_work_item(wi: &mut OrchestrationWorkItem) -> Option<DropReason> {
    let instance = wi.instance_id.as_str();
    let state = wi.state.as_mut()?;

    if !state.is_valid() {
        warn!(
            target: "taskhub::runtime::processor",
            instance_id = %instance,
            "orchestration state is invalid; dropping work item"
        );
        return Some(DropReason::InvalidState);
    }
    if state.is_completed() {
        warn!(
            target: "taskhub::runtime::processor",
            instance_id = %instance,
            "orchestration already completed; dropping work item"
        );
        return Some(DropReason::AlreadyCompleted);
    }
    if wi.new_events.is_empty() {
        warn!(target: "taskhub::runtime::processor", instance_id = %instance, "the work item had no events");
    }

    // Stage into a copy so an all-duplicate batch leaves no trace.
    let mut staged = state.clone();
    if let Err(e) = staged.add_event(Event::orchestrator_started()) {
        warn!(
            target: "taskhub::runtime::processor",
            instance_id = %instance,
            error = %e,
            "could not open processing pass"
        );
        return Some(DropReason::InvalidState);
    }

    let mut added = 0usize;
    for event in &wi.new_events {
        if let EventKind::ExecutionStarted { name, .. } = &event.kind {
            info!(
                target: "taskhub::runtime::processor",
                instance_id = %instance,
                orchestration_name = %name,
                "starting new instance"
            );
        }
        match staged.add_event(event.clone()) {
            Ok(()) => added += 1,
            Err(AddEventError::Duplicate) => {
                warn!(
                    target: "taskhub::runtime::processor",
                    instance_id = %instance,
                    event = event.kind.name(),
                    "dropping duplicate event"
                );
            }
            Err(e) => {
                warn!(
                    target: "taskhub::runtime::processor",
                    instance_id = %instance,
                    event = event.kind.name(),
                    error = %e,
                    "dropping event"
                );
            }
        }
    }

    if added == 0 {
        warn!(target: "taskhub::runtime::processor", instance_id = %instance, "all new events were dropped");
        return Some(DropReason::NoNewEvents);
    }

    *state = staged;
    None
}

/// Human-readable summary of a work item's state for log lines:
/// `name=Foo, status=Running, events=12, age=3s`.
pub(crate) fn describe_state(wi: &OrchestrationWorkItem) -> String {
    let Some(state) = wi.state.as_ref() else {
        return "(not loaded)".to_string();
    };

    let name = state
        .name()
        .ok()
        .map(str::to_string)
        .or_else(|| {
            wi.new_events.iter().find_map(|e| match &e.kind {
                EventKind::ExecutionStarted { name, .. } => Some(name.clone()),
                _ => None,
            })
        })
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "(unknown)".to_string());

    let age = match state.created_time() {
        Ok(created) => {
            let secs = (Utc::now() - created).num_seconds();
            if secs > 0 { format!("{secs}s") } else { "0s".to_string() }
        }
        Err(_) => "(new)".to_string(),
    };

    format!(
        "name={name}, status={}, events={}, age={age}",
        state.runtime_status(),
        state.old_events().len()
    )
}
