//! Event-sourced runtime state of a single orchestration instance.
//!
//! The state is a fold over the instance's history: committed events
//! (`old_events`) are folded when the state is loaded, and events delivered
//! or produced during a processing pass are folded through [`add_event`] and
//! [`apply_actions`] into `new_events`. Everything here is pure; logging and
//! I/O stay with the processor and the provider.
//!
//! [`add_event`]: OrchestrationRuntimeState::add_event
//! [`apply_actions`]: OrchestrationRuntimeState::apply_actions

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::{
    Action, ActionKind, Event, EventIdentity, EventKind, FailureDetails, OrchestrationStatus, ParentInstance,
    UNSEQUENCED_EVENT_ID,
};

/// Why an event was not folded into the state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddEventError {
    #[error("duplicate event")]
    Duplicate,
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("orchestration is already in a terminal state")]
    InstanceCompleted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("orchestration has not started")]
    NotStarted,
    #[error("unknown action type (action id {id})")]
    UnknownAction { id: i32 },
    #[error("malformed {kind} action (action id {id}): {reason}")]
    MalformedAction { id: i32, kind: &'static str, reason: String },
}

/// An event addressed to another orchestration instance, delivered by the
/// provider when the work item completes.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorMessage {
    pub target_instance_id: String,
    pub event: Event,
}

#[derive(Debug, Clone)]
struct StartInfo {
    name: String,
    input: Option<String>,
    parent: Option<ParentInstance>,
    created_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CompletionInfo {
    status: OrchestrationStatus,
    output: Option<String>,
    failure: Option<FailureDetails>,
    reason: Option<String>,
    completed_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrchestrationRuntimeState {
    instance_id: String,
    old_events: Vec<Event>,
    new_events: Vec<Event>,
    custom_status: Option<String>,

    start: Option<StartInfo>,
    completion: Option<CompletionInfo>,
    current_time: Option<DateTime<Utc>>,
    last_updated_time: Option<DateTime<Utc>>,
    seen: HashSet<EventIdentity>,
    corrupted: bool,
    continued_as_new: bool,
    dropped_carryover: usize,

    pending_tasks: Vec<Event>,
    pending_timers: Vec<Event>,
    pending_messages: Vec<OrchestratorMessage>,
}

impl OrchestrationRuntimeState {
    /// Rebuild state from committed history.
    ///
    /// History that cannot be folded (events before `ExecutionStarted`,
    /// duplicates, events after a terminal event) marks the state invalid
    /// instead of failing, so a poisoned instance is dropped by the processor
    /// rather than crash-looping.
    pub fn new(instance_id: impl Into<String>, history: Vec<Event>) -> Self {
        let mut state = Self::empty(instance_id.into());
        for event in history {
            if state.fold(&event).is_err() {
                state.corrupted = true;
            }
            state.old_events.push(event);
        }
        state
    }

    fn empty(instance_id: String) -> Self {
        Self {
            instance_id,
            old_events: Vec::new(),
            new_events: Vec::new(),
            custom_status: None,
            start: None,
            completion: None,
            current_time: None,
            last_updated_time: None,
            seen: HashSet::new(),
            corrupted: false,
            continued_as_new: false,
            dropped_carryover: 0,
            pending_tasks: Vec::new(),
            pending_timers: Vec::new(),
            pending_messages: Vec::new(),
        }
    }

    /// Fold one newly delivered event into the state and append it to `new_events`.
    ///
    /// `ExecutionCompleted` is only produced by a completion action and is
    /// rejected when delivered.
    pub fn add_event(&mut self, event: Event) -> Result<(), AddEventError> {
        if matches!(event.kind, EventKind::ExecutionCompleted { .. }) {
            return Err(AddEventError::InvalidTransition(
                "ExecutionCompleted can only come from a completion action".to_string(),
            ));
        }
        self.append(event)
    }

    fn append(&mut self, event: Event) -> Result<(), AddEventError> {
        self.fold(&event)?;
        if matches!(event.kind, EventKind::ExecutionTerminated { .. }) {
            self.notify_parent();
        }
        self.new_events.push(event);
        Ok(())
    }

    fn fold(&mut self, event: &Event) -> Result<(), AddEventError> {
        if self.completion.is_some() {
            return Err(AddEventError::InstanceCompleted);
        }

        if let EventKind::OrchestratorStarted = event.kind {
            self.current_time = Some(event.timestamp);
            self.last_updated_time = Some(event.timestamp);
            return Ok(());
        }

        let identity = event.identity();
        if let Some(identity) = &identity {
            if self.seen.contains(identity) {
                return Err(AddEventError::Duplicate);
            }
        }

        match &event.kind {
            EventKind::ExecutionStarted { name, input, parent, .. } => {
                self.start = Some(StartInfo {
                    name: name.clone(),
                    input: input.clone(),
                    parent: parent.clone(),
                    created_time: event.timestamp,
                });
            }
            _ if self.start.is_none() => {
                return Err(AddEventError::InvalidTransition(format!(
                    "{} before ExecutionStarted",
                    event.kind.name()
                )));
            }
            EventKind::ExecutionCompleted { status, result, failure } => {
                if !status.is_terminal() {
                    return Err(AddEventError::InvalidTransition(format!(
                        "ExecutionCompleted with non-terminal status {status}"
                    )));
                }
                self.completion = Some(CompletionInfo {
                    status: *status,
                    output: result.clone(),
                    failure: failure.clone(),
                    reason: None,
                    completed_time: event.timestamp,
                });
            }
            EventKind::ExecutionTerminated { reason } => {
                self.completion = Some(CompletionInfo {
                    status: OrchestrationStatus::Terminated,
                    output: None,
                    failure: None,
                    reason: reason.clone(),
                    completed_time: event.timestamp,
                });
            }
            _ => {}
        }

        if let Some(identity) = identity {
            self.seen.insert(identity);
        }
        self.last_updated_time = Some(event.timestamp);
        Ok(())
    }

    /// Fold the executor's action batch into the state.
    ///
    /// Returns `true` when the batch ended in continue-as-new; the state has
    /// then been replaced by a fresh execution and any actions after the
    /// continue-as-new action were not applied. Actions that follow a
    /// completion action are not applied either. The batch is applied
    /// atomically: on error the state is left untouched.
    pub fn apply_actions(&mut self, actions: Vec<Action>) -> Result<bool, StateError> {
        let start = self.start.clone().ok_or(StateError::NotStarted)?;
        let mut next = self.clone();

        for action in actions {
            if next.is_completed() {
                break;
            }
            let now = next.current_time();
            let id = action.id;
            let kind_name = action.kind.name();

            match action.kind {
                ActionKind::ScheduleTask { name, input } => {
                    let event = Event::at(id, now, EventKind::TaskScheduled { name, input });
                    next.push_produced(event.clone(), kind_name)?;
                    next.pending_tasks.push(event);
                }
                ActionKind::CreateTimer { fire_at } => {
                    next.push_produced(Event::at(id, now, EventKind::TimerCreated { fire_at }), kind_name)?;
                    next.pending_timers.push(Event::at(
                        UNSEQUENCED_EVENT_ID,
                        now,
                        EventKind::TimerFired { timer_id: id, fire_at },
                    ));
                }
                ActionKind::CreateSubOrchestration {
                    name,
                    instance_id,
                    input,
                } => {
                    let child_id = instance_id.unwrap_or_else(|| format!("{}:{:04x}", next.instance_id, id));
                    next.push_produced(
                        Event::at(
                            id,
                            now,
                            EventKind::SubOrchestrationInstanceCreated {
                                name: name.clone(),
                                instance_id: child_id.clone(),
                                input: input.clone(),
                            },
                        ),
                        kind_name,
                    )?;
                    let parent = ParentInstance {
                        task_scheduled_id: id,
                        name: start.name.clone(),
                        instance_id: next.instance_id.clone(),
                    };
                    next.pending_messages.push(OrchestratorMessage {
                        target_instance_id: child_id.clone(),
                        event: Event::at(
                            UNSEQUENCED_EVENT_ID,
                            now,
                            EventKind::ExecutionStarted {
                                name,
                                instance_id: child_id,
                                input,
                                parent: Some(parent),
                            },
                        ),
                    });
                }
                ActionKind::SendEvent {
                    instance_id,
                    name,
                    data,
                } => {
                    next.push_produced(
                        Event::at(
                            id,
                            now,
                            EventKind::EventSent {
                                instance_id: instance_id.clone(),
                                name: name.clone(),
                                input: data.clone(),
                            },
                        ),
                        kind_name,
                    )?;
                    // Offset by the action id so identical sends in one pass stay distinct.
                    let sent_at = now + chrono::Duration::nanoseconds(i64::from(id));
                    next.pending_messages.push(OrchestratorMessage {
                        target_instance_id: instance_id,
                        event: Event::at(UNSEQUENCED_EVENT_ID, sent_at, EventKind::EventRaised { name, input: data }),
                    });
                }
                ActionKind::CompleteOrchestration { status, result, failure } => {
                    if !status.is_terminal() {
                        return Err(StateError::MalformedAction {
                            id,
                            kind: kind_name,
                            reason: format!("status {status} is not a completion status"),
                        });
                    }
                    next.push_produced(
                        Event::at(id, now, EventKind::ExecutionCompleted { status, result, failure }),
                        kind_name,
                    )?;
                    next.notify_parent();
                }
                ActionKind::ContinueAsNew {
                    input,
                    carryover_events,
                } => {
                    let mut fresh = Self::empty(next.instance_id.clone());
                    fresh.continued_as_new = true;
                    fresh.custom_status = next.custom_status.take();
                    let seeded = [
                        Event::at(UNSEQUENCED_EVENT_ID, now, EventKind::OrchestratorStarted),
                        Event::at(
                            UNSEQUENCED_EVENT_ID,
                            now,
                            EventKind::ExecutionStarted {
                                name: start.name.clone(),
                                instance_id: next.instance_id.clone(),
                                input,
                                parent: start.parent.clone(),
                            },
                        ),
                    ];
                    for event in seeded {
                        if fresh.add_event(event).is_err() {
                            fresh.corrupted = true;
                        }
                    }
                    for event in carryover_events {
                        if fresh.add_event(event).is_err() {
                            fresh.dropped_carryover += 1;
                        }
                    }
                    *self = fresh;
                    return Ok(true);
                }
                ActionKind::Unknown => return Err(StateError::UnknownAction { id }),
            }
        }

        *self = next;
        Ok(false)
    }

    fn push_produced(&mut self, event: Event, kind: &'static str) -> Result<(), StateError> {
        let id = event.event_id;
        self.append(event).map_err(|e| StateError::MalformedAction {
            id,
            kind,
            reason: e.to_string(),
        })
    }

    /// Queue a completion or failure notice for the parent orchestration, if any.
    fn notify_parent(&mut self) {
        let (Some(start), Some(completion)) = (&self.start, &self.completion) else {
            return;
        };
        let Some(parent) = &start.parent else {
            return;
        };
        let now = completion.completed_time;
        let kind = match completion.status {
            OrchestrationStatus::Completed => EventKind::SubOrchestrationInstanceCompleted {
                task_scheduled_id: parent.task_scheduled_id,
                result: completion.output.clone(),
            },
            status => EventKind::SubOrchestrationInstanceFailed {
                task_scheduled_id: parent.task_scheduled_id,
                failure: completion.failure.clone().unwrap_or_else(|| {
                    FailureDetails::new(
                        status.as_str(),
                        completion
                            .reason
                            .clone()
                            .unwrap_or_else(|| format!("sub-orchestration {status}")),
                    )
                }),
            },
        };
        self.pending_messages.push(OrchestratorMessage {
            target_instance_id: parent.instance_id.clone(),
            event: Event::at(UNSEQUENCED_EVENT_ID, now, kind),
        });
    }

    /// Time as seen by the orchestration: the latest `OrchestratorStarted`
    /// timestamp, falling back to the last folded event.
    fn current_time(&self) -> DateTime<Utc> {
        self.current_time
            .or(self.last_updated_time)
            .or(self.start.as_ref().map(|s| s.created_time))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// False when the folded history is structurally inconsistent.
    pub fn is_valid(&self) -> bool {
        if self.corrupted {
            return false;
        }
        if self.old_events.is_empty() && self.new_events.is_empty() {
            return true;
        }
        self.start.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.runtime_status().is_terminal()
    }

    pub fn runtime_status(&self) -> OrchestrationStatus {
        match (&self.start, &self.completion) {
            (None, _) => OrchestrationStatus::Pending,
            (Some(_), Some(completion)) => completion.status,
            (Some(_), None) => OrchestrationStatus::Running,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn name(&self) -> Result<&str, StateError> {
        self.start.as_ref().map(|s| s.name.as_str()).ok_or(StateError::NotStarted)
    }

    pub fn created_time(&self) -> Result<DateTime<Utc>, StateError> {
        self.start.as_ref().map(|s| s.created_time).ok_or(StateError::NotStarted)
    }

    pub fn input(&self) -> Option<&str> {
        self.start.as_ref().and_then(|s| s.input.as_deref())
    }

    pub fn parent(&self) -> Option<&ParentInstance> {
        self.start.as_ref().and_then(|s| s.parent.as_ref())
    }

    pub fn last_updated_time(&self) -> Option<DateTime<Utc>> {
        self.last_updated_time
    }

    pub fn completed_time(&self) -> Option<DateTime<Utc>> {
        self.completion.as_ref().map(|c| c.completed_time)
    }

    pub fn output(&self) -> Option<&str> {
        self.completion.as_ref().and_then(|c| c.output.as_deref())
    }

    pub fn failure_details(&self) -> Option<&FailureDetails> {
        self.completion.as_ref().and_then(|c| c.failure.as_ref())
    }

    pub fn termination_reason(&self) -> Option<&str> {
        self.completion.as_ref().and_then(|c| c.reason.as_deref())
    }

    pub fn custom_status(&self) -> Option<&str> {
        self.custom_status.as_deref()
    }

    pub fn set_custom_status(&mut self, custom_status: Option<String>) {
        self.custom_status = custom_status;
    }

    pub fn old_events(&self) -> &[Event] {
        &self.old_events
    }

    pub fn new_events(&self) -> &[Event] {
        &self.new_events
    }

    /// True when this state replaced its history through continue-as-new;
    /// providers must overwrite rather than append the stored history.
    pub fn continued_as_new(&self) -> bool {
        self.continued_as_new
    }

    /// Carry-over events rejected by the last continue-as-new.
    pub fn dropped_carryover_events(&self) -> usize {
        self.dropped_carryover
    }

    pub fn pending_tasks(&self) -> &[Event] {
        &self.pending_tasks
    }

    pub fn pending_timers(&self) -> &[Event] {
        &self.pending_timers
    }

    pub fn pending_messages(&self) -> &[OrchestratorMessage] {
        &self.pending_messages
    }
}
