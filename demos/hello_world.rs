//! Hello World - schedule an orchestration, run it on a worker, and wait for the result.
//!
//! The orchestrator schedules one "Greet" task and completes with its
//! result. A small loop stands in for an activity worker by answering
//! scheduled tasks directly through the provider.
//!
//! Run with: `cargo run --example hello_world`

use std::sync::Arc;
use std::time::Duration;
use taskhub::providers::Provider;
use taskhub::providers::sqlite::SqliteProvider;
use taskhub::runtime::{
    ExecutionResults, FnExecutor, LogFormat, ObservabilityConfig, OrchestrationProcessor, TaskWorker,
    TaskWorkerOptions, init_logging,
};
use taskhub::{Action, Client, Event, EventKind, NewOrchestrationOptions};
use tokio_util::sync::CancellationToken;

fn greet_orchestrator(
    _instance_id: &str,
    old_events: &[Event],
    new_events: &[Event],
) -> Result<ExecutionResults, taskhub::runtime::ExecutorError> {
    let history = old_events.iter().chain(new_events);
    let mut name = None;
    let mut greeting = None;
    for event in history {
        match &event.kind {
            EventKind::ExecutionStarted { input, .. } => name = input.clone(),
            EventKind::TaskCompleted { task_scheduled_id: 1, result } => greeting = result.clone(),
            _ => {}
        }
    }

    let actions = match greeting {
        Some(greeting) => vec![Action::complete(2, Some(greeting))],
        None if old_events.is_empty() => vec![Action::schedule_task(1, "Greet", name)],
        None => vec![],
    };
    Ok(ExecutionResults::new(actions))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&ObservabilityConfig {
        log_format: LogFormat::Compact,
        log_level: "debug".to_string(),
    })?;

    let temp_dir = tempfile::tempdir()?;
    let db_url = format!("sqlite:{}", temp_dir.path().join("hello_world.db").display());
    let store = Arc::new(SqliteProvider::new(&db_url, None).await?);
    let provider: Arc<dyn Provider> = store.clone();

    let worker = TaskWorker::new(
        OrchestrationProcessor::new(provider.clone(), Arc::new(FnExecutor::new(greet_orchestrator))),
        TaskWorkerOptions::default(),
    );
    worker.start().await;

    let client = Client::new(provider.clone());
    let instance_id = client
        .schedule_new_orchestration("HelloWorld", NewOrchestrationOptions::default().with_input("World"))
        .await?;
    println!("scheduled {instance_id}");

    // Stand-in activity worker.
    let activity_store = store.clone();
    let activity_provider = provider.clone();
    let activities = tokio::spawn(async move {
        let mut answered = 0;
        while answered == 0 {
            for task in activity_store.take_pending_activities().await? {
                if let EventKind::TaskScheduled { input, .. } = &task.event.kind {
                    let greeting = format!("Hello, {}!", input.as_deref().unwrap_or("stranger"));
                    activity_provider
                        .add_new_orchestration_event(
                            &task.instance_id,
                            Event::task_completed(task.event.event_id, Some(greeting)),
                        )
                        .await?;
                    answered += 1;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok::<_, taskhub::ProviderError>(())
    });

    let metadata = client
        .wait_for_orchestration_completion(&instance_id, &CancellationToken::new())
        .await?;
    println!("{} finished: {:?}", metadata.runtime_status, metadata.output);

    activities.await??;
    worker.stop().await;
    Ok(())
}
