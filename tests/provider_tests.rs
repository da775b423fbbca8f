//! Behaviour shared by every provider, run against each implementation.

mod common;

use chrono::Utc;
use common::{create_sqlite_store_disk, in_memory, kinds};
use std::sync::Arc;
use std::time::Duration;
use taskhub::providers::Provider;
use taskhub::providers::in_memory::{InMemoryProvider, InMemoryProviderOptions};
use taskhub::providers::sqlite::{SqliteOptions, SqliteProvider};
use taskhub::runtime::OrchestrationRuntimeState;
use taskhub::{Action, Event, EventKind, OrchestrationStatus};

fn start(id: &str) -> Event {
    Event::execution_started("Foo", id, Some("1".into()), None)
}

async fn sqlite_in_memory() -> Arc<dyn Provider> {
    Arc::new(SqliteProvider::new_in_memory().await.unwrap())
}

/// Lease the instance's start event, fold it, apply `actions`, and complete.
async fn run_pass(provider: &Arc<dyn Provider>, actions: Vec<Action>) -> OrchestrationRuntimeState {
    let mut wi = provider.get_orchestration_work_item().await.unwrap().unwrap();
    let mut state = provider.get_orchestration_runtime_state(&wi).await.unwrap();
    state.add_event(Event::orchestrator_started()).unwrap();
    for event in wi.new_events.clone() {
        let _ = state.add_event(event);
    }
    state.apply_actions(actions).unwrap();
    wi.state = Some(state.clone());
    provider.complete_orchestration_work_item(wi).await.unwrap();
    state
}

async fn create_and_lookup(provider: Arc<dyn Provider>) {
    provider.create_orchestration_instance(start("a")).await.unwrap();
    assert!(
        provider
            .create_orchestration_instance(start("a"))
            .await
            .unwrap_err()
            .is_already_exists()
    );
    assert!(
        provider
            .add_new_orchestration_event("zzz", Event::event_raised("x", None))
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(provider.get_orchestration_metadata("zzz").await.unwrap_err().is_not_found());

    let metadata = provider.get_orchestration_metadata("a").await.unwrap();
    assert_eq!(metadata.runtime_status, OrchestrationStatus::Pending);
    assert_eq!(metadata.input.as_deref(), Some("1"));
}

async fn delivery_order_and_lease_exclusivity(provider: Arc<dyn Provider>) {
    provider.create_orchestration_instance(start("a")).await.unwrap();
    provider
        .add_new_orchestration_event("a", Event::event_raised("first", None))
        .await
        .unwrap();
    provider
        .add_new_orchestration_event("a", Event::event_raised("second", None))
        .await
        .unwrap();

    let wi = provider.get_orchestration_work_item().await.unwrap().unwrap();
    assert_eq!(wi.instance_id, "a");
    assert_eq!(kinds(&wi.new_events), vec!["ExecutionStarted", "EventRaised", "EventRaised"]);
    assert!(matches!(&wi.new_events[1].kind, EventKind::EventRaised { name, .. } if name == "first"));

    // Leased: nothing else to hand out, even with new events arriving.
    provider
        .add_new_orchestration_event("a", Event::event_raised("third", None))
        .await
        .unwrap();
    assert!(provider.get_orchestration_work_item().await.unwrap().is_none());
}

async fn abandon_redelivers(provider: Arc<dyn Provider>) {
    provider.create_orchestration_instance(start("a")).await.unwrap();
    let wi = provider.get_orchestration_work_item().await.unwrap().unwrap();
    let token = wi.lock_token.clone();
    provider.abandon_orchestration_work_item(wi).await.unwrap();

    let again = provider.get_orchestration_work_item().await.unwrap().unwrap();
    assert_ne!(again.lock_token, token);
    assert_eq!(again.dequeue_count, 2);
    assert_eq!(kinds(&again.new_events), vec!["ExecutionStarted"]);
}

async fn stale_token_is_permanent(provider: Arc<dyn Provider>) {
    provider.create_orchestration_instance(start("a")).await.unwrap();
    let mut wi = provider.get_orchestration_work_item().await.unwrap().unwrap();
    wi.lock_token = "not-the-lease".into();
    let err = provider.complete_orchestration_work_item(wi).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(!err.is_not_found());
}

async fn completion_persists_history_and_effects(provider: Arc<dyn Provider>) {
    provider.create_orchestration_instance(start("a")).await.unwrap();
    let past = Utc::now() - chrono::Duration::seconds(1);
    let future = Utc::now() + chrono::Duration::hours(1);
    let state = run_pass(
        &provider,
        vec![
            Action::schedule_task(1, "SayHello", Some("x".into())),
            Action::create_timer(2, past),
            Action::create_timer(3, future),
        ],
    )
    .await;

    let history = provider.read_history("a").await.unwrap();
    assert_eq!(history, state.new_events());
    assert_eq!(
        kinds(&history),
        vec!["OrchestratorStarted", "ExecutionStarted", "TaskScheduled", "TimerCreated", "TimerCreated"]
    );
    assert_eq!(
        provider.get_orchestration_metadata("a").await.unwrap().runtime_status,
        OrchestrationStatus::Running
    );

    // Only the timer that is already due is visible.
    let wi = provider.get_orchestration_work_item().await.unwrap().unwrap();
    assert_eq!(wi.new_events.len(), 1);
    assert!(matches!(wi.new_events[0].kind, EventKind::TimerFired { timer_id: 2, .. }));
}

async fn continue_as_new_replaces_history(provider: Arc<dyn Provider>) {
    provider.create_orchestration_instance(start("a")).await.unwrap();
    run_pass(&provider, vec![Action::schedule_task(1, "A", None)]).await;
    provider
        .add_new_orchestration_event("a", Event::event_raised("go", None))
        .await
        .unwrap();
    run_pass(&provider, vec![Action::continue_as_new(2, Some("2".into()))]).await;

    let history = provider.read_history("a").await.unwrap();
    assert_eq!(kinds(&history), vec!["OrchestratorStarted", "ExecutionStarted"]);
    let metadata = provider.get_orchestration_metadata("a").await.unwrap();
    assert_eq!(metadata.input.as_deref(), Some("2"));
    assert_eq!(metadata.runtime_status, OrchestrationStatus::Running);
}

async fn sub_orchestration_start_creates_child(provider: Arc<dyn Provider>) {
    provider.create_orchestration_instance(start("p")).await.unwrap();
    run_pass(
        &provider,
        vec![Action::new(
            1,
            taskhub::ActionKind::CreateSubOrchestration {
                name: "Child".into(),
                instance_id: None,
                input: Some("c".into()),
            },
        )],
    )
    .await;

    let child = provider.get_orchestration_metadata("p:0001").await.unwrap();
    assert_eq!(child.name, "Child");
    assert_eq!(child.runtime_status, OrchestrationStatus::Pending);
    let wi = provider.get_orchestration_work_item().await.unwrap().unwrap();
    assert_eq!(wi.instance_id, "p:0001");
}

macro_rules! provider_suite {
    ($module:ident, $make:expr) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn create_and_lookup() {
                super::create_and_lookup($make).await;
            }

            #[tokio::test]
            async fn delivery_order_and_lease_exclusivity() {
                super::delivery_order_and_lease_exclusivity($make).await;
            }

            #[tokio::test]
            async fn abandon_redelivers() {
                super::abandon_redelivers($make).await;
            }

            #[tokio::test]
            async fn stale_token_is_permanent() {
                super::stale_token_is_permanent($make).await;
            }

            #[tokio::test]
            async fn completion_persists_history_and_effects() {
                super::completion_persists_history_and_effects($make).await;
            }

            #[tokio::test]
            async fn continue_as_new_replaces_history() {
                super::continue_as_new_replaces_history($make).await;
            }

            #[tokio::test]
            async fn sub_orchestration_start_creates_child() {
                super::sub_orchestration_start_creates_child($make).await;
            }
        }
    };
}

provider_suite!(in_memory_provider, in_memory());
provider_suite!(sqlite_provider, sqlite_in_memory().await);

#[tokio::test]
async fn sqlite_file_database_survives_reopen() {
    let (store, dir) = create_sqlite_store_disk().await;
    let provider: Arc<dyn Provider> = store;
    provider.create_orchestration_instance(start("a")).await.unwrap();
    run_pass(&provider, vec![Action::schedule_task(1, "A", None)]).await;
    drop(provider);

    let url = format!("sqlite:{}", dir.path().join("test.db").display());
    let reopened = SqliteProvider::new(&url, None).await.unwrap();
    let history = reopened.read_history("a").await.unwrap();
    assert_eq!(kinds(&history), vec!["OrchestratorStarted", "ExecutionStarted", "TaskScheduled"]);
    let activities = reopened.pending_activities().await.unwrap();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].instance_id, "a");
}

#[tokio::test]
async fn sqlite_take_pending_activities_drains_queue() {
    let store = Arc::new(SqliteProvider::new_in_memory().await.unwrap());
    let provider: Arc<dyn Provider> = store.clone();
    provider.create_orchestration_instance(start("a")).await.unwrap();
    run_pass(
        &provider,
        vec![Action::schedule_task(1, "A", None), Action::schedule_task(2, "B", None)],
    )
    .await;

    let taken = store.take_pending_activities().await.unwrap();
    let ids: Vec<i32> = taken.iter().map(|a| a.event.event_id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(store.pending_activities().await.unwrap().is_empty());
    assert!(store.take_pending_activities().await.unwrap().is_empty());
}

#[tokio::test]
async fn sqlite_expired_lease_is_reclaimed() {
    let provider = SqliteProvider::new(
        "sqlite::memory:",
        Some(SqliteOptions {
            lock_timeout: Duration::from_millis(50),
            ..Default::default()
        }),
    )
    .await
    .unwrap();
    provider.create_orchestration_instance(start("a")).await.unwrap();
    let first = provider.get_orchestration_work_item().await.unwrap().unwrap();
    assert!(provider.get_orchestration_work_item().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = provider.get_orchestration_work_item().await.unwrap().unwrap();
    assert_eq!(second.dequeue_count, 2);
    assert!(provider.complete_orchestration_work_item(first).await.is_err());
}

#[tokio::test]
async fn abandon_delay_hides_events() {
    let provider = InMemoryProvider::new(InMemoryProviderOptions {
        abandon_delay: Duration::from_secs(60),
        ..Default::default()
    });
    provider.create_orchestration_instance(start("a")).await.unwrap();
    let wi = provider.get_orchestration_work_item().await.unwrap().unwrap();
    provider.abandon_orchestration_work_item(wi).await.unwrap();
    assert!(provider.get_orchestration_work_item().await.unwrap().is_none());
    assert_eq!(provider.queued_message_count().await, 1);
}

#[tokio::test]
async fn in_memory_records_scheduled_activities() {
    let provider = Arc::new(InMemoryProvider::default());
    let dyn_provider: Arc<dyn Provider> = provider.clone();
    dyn_provider.create_orchestration_instance(start("a")).await.unwrap();
    run_pass(&dyn_provider, vec![Action::schedule_task(1, "SayHello", Some("x".into()))]).await;

    let activities = provider.pending_activities().await;
    assert_eq!(activities.len(), 1);
    assert!(matches!(&activities[0].event.kind, EventKind::TaskScheduled { name, .. } if name == "SayHello"));
}

#[tokio::test]
async fn in_memory_take_pending_activities_drains_queue() {
    let provider = Arc::new(InMemoryProvider::default());
    let dyn_provider: Arc<dyn Provider> = provider.clone();
    dyn_provider.create_orchestration_instance(start("a")).await.unwrap();
    run_pass(&dyn_provider, vec![Action::schedule_task(1, "SayHello", None)]).await;

    assert_eq!(provider.take_pending_activities().await.len(), 1);
    assert!(provider.pending_activities().await.is_empty());
    assert!(provider.take_pending_activities().await.is_empty());
}
