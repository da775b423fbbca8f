//! Process-local provider backed by a single tokio mutex.
//!
//! Intended for tests, demos and single-process hosts. Nothing survives a restart.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ActivityWorkItem, OrchestrationMetadata, OrchestrationWorkItem, Provider, ProviderError};
use crate::runtime::OrchestrationRuntimeState;
use crate::runtime::limits::DEFAULT_LOCK_TIMEOUT;
use crate::{Event, EventKind};

#[derive(Debug, Clone)]
pub struct InMemoryProviderOptions {
    /// How long a fetched work item stays leased. Default: 30s.
    pub lock_timeout: Duration,
    /// Delay before abandoned events become visible again. Default: none.
    pub abandon_delay: Duration,
}

impl Default for InMemoryProviderOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            abandon_delay: Duration::ZERO,
        }
    }
}

struct InstanceRecord {
    metadata: OrchestrationMetadata,
    history: Vec<Event>,
    lease: Option<Lease>,
}

struct Lease {
    token: String,
    expires_at: Instant,
}

struct QueuedMessage {
    instance_id: String,
    event: Event,
    visible_at: DateTime<Utc>,
    dequeue_count: u32,
    locked_by: Option<String>,
}

#[derive(Default)]
struct Store {
    instances: HashMap<String, InstanceRecord>,
    /// Orchestrator queue in enqueue order.
    messages: Vec<QueuedMessage>,
    activities: Vec<ActivityWorkItem>,
}

impl Store {
    fn enqueue(&mut self, instance_id: &str, event: Event, visible_at: DateTime<Utc>) {
        self.messages.push(QueuedMessage {
            instance_id: instance_id.to_string(),
            event,
            visible_at,
            dequeue_count: 0,
            locked_by: None,
        });
    }

    fn release_expired_leases(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (id, record) in self.instances.iter_mut() {
            if record.lease.as_ref().is_some_and(|l| l.expires_at <= now) {
                if let Some(lease) = record.lease.take() {
                    debug!(target: "taskhub::providers::in_memory", instance_id = %id, "lease expired");
                    expired.push(lease.token);
                }
            }
        }
        if expired.is_empty() {
            return;
        }
        for message in &mut self.messages {
            if message.locked_by.as_ref().is_some_and(|t| expired.contains(t)) {
                message.locked_by = None;
            }
        }
    }

    /// Look up the instance leased by `token`; stale and unknown tokens are permanent errors.
    fn leased_instance(
        &mut self,
        operation: &str,
        instance_id: &str,
        token: &str,
    ) -> Result<&mut InstanceRecord, ProviderError> {
        let record = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::not_found(operation, instance_id))?;
        match &record.lease {
            Some(lease) if lease.token == token => Ok(record),
            _ => Err(ProviderError::permanent(
                operation,
                format!("lock token for instance '{instance_id}' is stale or unknown"),
            )),
        }
    }
}

/// In-memory [`Provider`].
pub struct InMemoryProvider {
    options: InMemoryProviderOptions,
    store: Mutex<Store>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new(InMemoryProviderOptions::default())
    }
}

impl InMemoryProvider {
    pub fn new(options: InMemoryProviderOptions) -> Self {
        Self {
            options,
            store: Mutex::new(Store::default()),
        }
    }

    /// Activity tasks recorded by completed work items, oldest first.
    pub async fn pending_activities(&self) -> Vec<ActivityWorkItem> {
        self.store.lock().await.activities.clone()
    }

    /// Remove and return every recorded activity task, oldest first.
    pub async fn take_pending_activities(&self) -> Vec<ActivityWorkItem> {
        std::mem::take(&mut self.store.lock().await.activities)
    }

    /// Number of queued orchestrator messages, leased or not.
    pub async fn queued_message_count(&self) -> usize {
        self.store.lock().await.messages.len()
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn create_orchestration_instance(&self, start_event: Event) -> Result<(), ProviderError> {
        const OP: &str = "create_orchestration_instance";
        let metadata = OrchestrationMetadata::pending(&start_event)
            .ok_or_else(|| ProviderError::permanent(OP, "start event must be ExecutionStarted"))?;
        let instance_id = metadata.instance_id.clone();

        let mut store = self.store.lock().await;
        if store.instances.contains_key(&instance_id) {
            return Err(ProviderError::already_exists(OP, &instance_id));
        }
        store.instances.insert(
            instance_id.clone(),
            InstanceRecord {
                metadata,
                history: Vec::new(),
                lease: None,
            },
        );
        store.enqueue(&instance_id, start_event, Utc::now());
        debug!(target: "taskhub::providers::in_memory", instance_id = %instance_id, "created orchestration instance");
        Ok(())
    }

    async fn add_new_orchestration_event(&self, instance_id: &str, event: Event) -> Result<(), ProviderError> {
        let mut store = self.store.lock().await;
        if !store.instances.contains_key(instance_id) {
            return Err(ProviderError::not_found("add_new_orchestration_event", instance_id));
        }
        store.enqueue(instance_id, event, Utc::now());
        Ok(())
    }

    async fn get_orchestration_metadata(&self, instance_id: &str) -> Result<OrchestrationMetadata, ProviderError> {
        let store = self.store.lock().await;
        store
            .instances
            .get(instance_id)
            .map(|r| r.metadata.clone())
            .ok_or_else(|| ProviderError::not_found("get_orchestration_metadata", instance_id))
    }

    async fn get_orchestration_work_item(&self) -> Result<Option<OrchestrationWorkItem>, ProviderError> {
        let mut store = self.store.lock().await;
        let now = Utc::now();
        let now_instant = Instant::now();
        store.release_expired_leases(now_instant);

        let candidate = store.messages.iter().find_map(|m| {
            let available = m.locked_by.is_none()
                && m.visible_at <= now
                && store.instances.get(&m.instance_id).is_some_and(|r| r.lease.is_none());
            available.then(|| m.instance_id.clone())
        });
        let Some(instance_id) = candidate else {
            return Ok(None);
        };

        let lock_token = uuid::Uuid::new_v4().to_string();
        let mut new_events = Vec::new();
        let mut dequeue_count = 0;
        for message in store
            .messages
            .iter_mut()
            .filter(|m| m.instance_id == instance_id && m.locked_by.is_none() && m.visible_at <= now)
        {
            message.locked_by = Some(lock_token.clone());
            message.dequeue_count += 1;
            dequeue_count = dequeue_count.max(message.dequeue_count);
            new_events.push(message.event.clone());
        }

        if let Some(record) = store.instances.get_mut(&instance_id) {
            record.lease = Some(Lease {
                token: lock_token.clone(),
                expires_at: now_instant + self.options.lock_timeout,
            });
        }

        debug!(
            target: "taskhub::providers::in_memory",
            instance_id = %instance_id,
            event_count = new_events.len(),
            dequeue_count,
            "leased orchestration work item"
        );
        Ok(Some(OrchestrationWorkItem {
            instance_id,
            new_events,
            state: None,
            lock_token,
            dequeue_count,
        }))
    }

    async fn get_orchestration_runtime_state(
        &self,
        work_item: &OrchestrationWorkItem,
    ) -> Result<OrchestrationRuntimeState, ProviderError> {
        let store = self.store.lock().await;
        let record = store
            .instances
            .get(&work_item.instance_id)
            .ok_or_else(|| ProviderError::not_found("get_orchestration_runtime_state", &work_item.instance_id))?;
        Ok(OrchestrationRuntimeState::new(
            work_item.instance_id.clone(),
            record.history.clone(),
        ))
    }

    async fn complete_orchestration_work_item(&self, work_item: OrchestrationWorkItem) -> Result<(), ProviderError> {
        const OP: &str = "complete_orchestration_work_item";
        let OrchestrationWorkItem {
            instance_id,
            state,
            lock_token,
            ..
        } = work_item;

        let mut store = self.store.lock().await;
        let record = store.leased_instance(OP, &instance_id, &lock_token)?;

        // A dropped pass leaves no new events; keep the stored summary as is.
        if let Some(state) = state.as_ref().filter(|s| !s.new_events().is_empty()) {
            if state.continued_as_new() {
                record.history = state.new_events().to_vec();
            } else {
                record.history.extend_from_slice(state.new_events());
            }
            if let Some(metadata) = OrchestrationMetadata::from_state(state) {
                record.metadata = metadata;
            }
        }
        record.lease = None;

        store.messages.retain(|m| m.locked_by.as_deref() != Some(lock_token.as_str()));

        let Some(state) = state else {
            return Ok(());
        };

        for timer in state.pending_timers() {
            let fire_at = match &timer.kind {
                EventKind::TimerFired { fire_at, .. } => *fire_at,
                _ => Utc::now(),
            };
            store.enqueue(&instance_id, timer.clone(), fire_at);
        }

        for message in state.pending_messages() {
            let target = message.target_instance_id.as_str();
            if !store.instances.contains_key(target) {
                match OrchestrationMetadata::pending(&message.event) {
                    Some(metadata) => {
                        store.instances.insert(
                            target.to_string(),
                            InstanceRecord {
                                metadata,
                                history: Vec::new(),
                                lease: None,
                            },
                        );
                    }
                    None => {
                        warn!(
                            target: "taskhub::providers::in_memory",
                            instance_id = %instance_id,
                            target_instance_id = %target,
                            event = message.event.kind.name(),
                            "dropping message for unknown instance"
                        );
                        continue;
                    }
                }
            }
            store.enqueue(target, message.event.clone(), Utc::now());
        }

        store.activities.extend(state.pending_tasks().iter().map(|event| ActivityWorkItem {
            instance_id: instance_id.clone(),
            event: event.clone(),
        }));

        debug!(
            target: "taskhub::providers::in_memory",
            instance_id = %instance_id,
            status = %state.runtime_status(),
            "completed orchestration work item"
        );
        Ok(())
    }

    async fn abandon_orchestration_work_item(&self, work_item: OrchestrationWorkItem) -> Result<(), ProviderError> {
        let mut store = self.store.lock().await;
        let record = store.leased_instance(
            "abandon_orchestration_work_item",
            &work_item.instance_id,
            &work_item.lock_token,
        )?;
        record.lease = None;

        let delay = chrono::Duration::from_std(self.options.abandon_delay).unwrap_or_else(|_| chrono::Duration::zero());
        let visible_at = Utc::now() + delay;
        for message in store
            .messages
            .iter_mut()
            .filter(|m| m.locked_by.as_deref() == Some(work_item.lock_token.as_str()))
        {
            message.locked_by = None;
            message.visible_at = visible_at;
        }
        debug!(
            target: "taskhub::providers::in_memory",
            instance_id = %work_item.instance_id,
            "abandoned orchestration work item"
        );
        Ok(())
    }

    async fn read_history(&self, instance_id: &str) -> Result<Vec<Event>, ProviderError> {
        let store = self.store.lock().await;
        store
            .instances
            .get(instance_id)
            .map(|r| r.history.clone())
            .ok_or_else(|| ProviderError::not_found("read_history", instance_id))
    }
}
