mod common;

use common::{RecordingExecutor, has_kind, in_memory, kinds};
use std::sync::Arc;
use taskhub::providers::Provider;
use taskhub::runtime::limits::MAX_CONTINUE_AS_NEW_COUNT;
use taskhub::runtime::{
    DropReason, ExecutionResults, ExecutorError, OrchestrationProcessor, ProcessError, ProcessOutcome,
};
use taskhub::{Action, ActionKind, Client, Event, NewOrchestrationOptions, OrchestrationStatus};
use tokio_util::sync::CancellationToken;

/// Fetch one work item, process it and settle it the way the worker does.
async fn run_once(
    provider: &Arc<dyn Provider>,
    processor: &OrchestrationProcessor,
) -> Result<ProcessOutcome, ProcessError> {
    let mut wi = provider
        .get_orchestration_work_item()
        .await
        .unwrap()
        .expect("expected a work item");
    let result = processor.process(&mut wi, &CancellationToken::new()).await;
    match &result {
        Ok(_) => provider.complete_orchestration_work_item(wi).await.unwrap(),
        Err(_) => provider.abandon_orchestration_work_item(wi).await.unwrap(),
    }
    result
}

async fn schedule(provider: &Arc<dyn Provider>, id: &str) {
    Client::new(provider.clone())
        .schedule_new_orchestration(
            "Foo",
            NewOrchestrationOptions::default().with_instance_id(id).with_input("1"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn new_instance_commits_started_events_and_runs() {
    let provider = in_memory();
    let executor = RecordingExecutor::new(|_| Ok(ExecutionResults::new(vec![Action::schedule_task(1, "Hello", None)])));
    let processor = OrchestrationProcessor::new(provider.clone(), executor.clone());
    schedule(&provider, "a").await;

    let outcome = run_once(&provider, &processor).await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Executed {
            status: OrchestrationStatus::Running,
            invocations: 1
        }
    );

    let history = provider.read_history("a").await.unwrap();
    assert_eq!(kinds(&history), vec!["OrchestratorStarted", "ExecutionStarted", "TaskScheduled"]);

    let calls = executor.calls();
    assert!(calls[0].old_events.is_empty());
    assert_eq!(kinds(&calls[0].new_events), vec!["OrchestratorStarted", "ExecutionStarted"]);

    let metadata = provider.get_orchestration_metadata("a").await.unwrap();
    assert_eq!(metadata.runtime_status, OrchestrationStatus::Running);
    assert_eq!(metadata.name, "Foo");
    assert_eq!(metadata.input.as_deref(), Some("1"));
}

#[tokio::test]
async fn immediate_completion_reports_completed() {
    let provider = in_memory();
    let executor =
        RecordingExecutor::new(|_| Ok(ExecutionResults::new(vec![Action::complete(1, Some("done".into()))])));
    let processor = OrchestrationProcessor::new(provider.clone(), executor);
    schedule(&provider, "a").await;

    let outcome = run_once(&provider, &processor).await.unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Executed {
            status: OrchestrationStatus::Completed,
            ..
        }
    ));
    let metadata = provider.get_orchestration_metadata("a").await.unwrap();
    assert!(metadata.is_complete());
    assert_eq!(metadata.output.as_deref(), Some("done"));
}

#[tokio::test]
async fn redelivered_batch_is_dropped_without_invoking_executor() {
    let provider = in_memory();
    let executor = RecordingExecutor::new(|inv| {
        if has_kind(&inv.new_events, "ExecutionStarted") {
            Ok(ExecutionResults::new(vec![Action::schedule_task(1, "Hello", None)]))
        } else {
            Ok(ExecutionResults::default())
        }
    });
    let processor = OrchestrationProcessor::new(provider.clone(), executor.clone());
    schedule(&provider, "a").await;
    run_once(&provider, &processor).await.unwrap();

    let done = Event::task_completed(1, Some("hi".into()));
    provider.add_new_orchestration_event("a", done.clone()).await.unwrap();
    run_once(&provider, &processor).await.unwrap();
    assert_eq!(executor.call_count(), 2);
    let before = provider.read_history("a").await.unwrap();

    // Same content again, then a conflicting result for the same slot.
    provider.add_new_orchestration_event("a", done).await.unwrap();
    let outcome = run_once(&provider, &processor).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Dropped(DropReason::NoNewEvents));

    provider
        .add_new_orchestration_event("a", Event::task_failed(1, taskhub::FailureDetails::new("Boom", "late")))
        .await
        .unwrap();
    let outcome = run_once(&provider, &processor).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Dropped(DropReason::NoNewEvents));

    assert_eq!(executor.call_count(), 2);
    assert_eq!(provider.read_history("a").await.unwrap(), before);
}

#[tokio::test]
async fn repeated_raise_event_is_delivered_each_time() {
    let provider = in_memory();
    let executor = RecordingExecutor::idle();
    let processor = OrchestrationProcessor::new(provider.clone(), executor.clone());
    let client = Client::new(provider.clone());
    schedule(&provider, "a").await;
    run_once(&provider, &processor).await.unwrap();

    for _ in 0..2 {
        client.raise_event("a", "increment", None).await.unwrap();
        let outcome = run_once(&provider, &processor).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Executed {
                status: OrchestrationStatus::Running,
                invocations: 1
            }
        );
    }

    let history = provider.read_history("a").await.unwrap();
    let raised = history.iter().filter(|e| e.kind.name() == "EventRaised").count();
    assert_eq!(raised, 2);
    assert_eq!(executor.call_count(), 3);
}

#[tokio::test]
async fn redelivered_raise_event_is_dropped() {
    let provider = in_memory();
    let executor = RecordingExecutor::idle();
    let processor = OrchestrationProcessor::new(provider.clone(), executor.clone());
    schedule(&provider, "a").await;
    run_once(&provider, &processor).await.unwrap();

    let raised = Event::event_raised("go", None);
    provider.add_new_orchestration_event("a", raised.clone()).await.unwrap();
    run_once(&provider, &processor).await.unwrap();
    provider.add_new_orchestration_event("a", raised).await.unwrap();
    let outcome = run_once(&provider, &processor).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Dropped(DropReason::NoNewEvents));

    let history = provider.read_history("a").await.unwrap();
    assert_eq!(history.iter().filter(|e| e.kind.name() == "EventRaised").count(), 1);
    assert_eq!(executor.call_count(), 2);
}

#[tokio::test]
async fn delivered_completion_does_not_end_the_instance() {
    let provider = in_memory();
    let executor = RecordingExecutor::idle();
    let processor = OrchestrationProcessor::new(provider.clone(), executor.clone());
    schedule(&provider, "a").await;
    run_once(&provider, &processor).await.unwrap();

    let forged = Event::new(
        taskhub::UNSEQUENCED_EVENT_ID,
        taskhub::EventKind::ExecutionCompleted {
            status: OrchestrationStatus::Completed,
            result: Some("forged".into()),
            failure: None,
        },
    );
    provider.add_new_orchestration_event("a", forged).await.unwrap();
    let outcome = run_once(&provider, &processor).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Dropped(DropReason::NoNewEvents));

    let metadata = provider.get_orchestration_metadata("a").await.unwrap();
    assert_eq!(metadata.runtime_status, OrchestrationStatus::Running);
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn completed_instance_drops_late_events() {
    let provider = in_memory();
    let executor = RecordingExecutor::new(|_| Ok(ExecutionResults::new(vec![Action::complete(1, None)])));
    let processor = OrchestrationProcessor::new(provider.clone(), executor.clone());
    schedule(&provider, "a").await;
    run_once(&provider, &processor).await.unwrap();
    let before = provider.read_history("a").await.unwrap();

    provider
        .add_new_orchestration_event("a", Event::task_completed(7, None))
        .await
        .unwrap();
    let outcome = run_once(&provider, &processor).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Dropped(DropReason::AlreadyCompleted));
    assert_eq!(executor.call_count(), 1);
    assert_eq!(provider.read_history("a").await.unwrap(), before);
    // The late event was consumed, not left for redelivery.
    assert!(provider.get_orchestration_work_item().await.unwrap().is_none());
}

#[tokio::test]
async fn termination_skips_executor_and_reports_reason() {
    let provider = in_memory();
    let executor = RecordingExecutor::idle();
    let processor = OrchestrationProcessor::new(provider.clone(), executor.clone());
    schedule(&provider, "a").await;
    run_once(&provider, &processor).await.unwrap();

    Client::new(provider.clone())
        .terminate_orchestration("a", Some("stop".into()))
        .await
        .unwrap();
    let outcome = run_once(&provider, &processor).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Terminated);
    assert_eq!(executor.call_count(), 1);
    let metadata = provider.get_orchestration_metadata("a").await.unwrap();
    assert_eq!(metadata.runtime_status, OrchestrationStatus::Terminated);
    assert_eq!(metadata.termination_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn continue_as_new_loop_is_bounded() {
    let provider = in_memory();
    let executor = RecordingExecutor::new(|_| Ok(ExecutionResults::new(vec![Action::continue_as_new(1, None)])));
    let processor = OrchestrationProcessor::new(provider.clone(), executor.clone());
    schedule(&provider, "a").await;

    let err = run_once(&provider, &processor).await.unwrap_err();
    assert!(matches!(err, ProcessError::ContinueAsNewLimit(MAX_CONTINUE_AS_NEW_COUNT)));
    assert_eq!(executor.call_count(), MAX_CONTINUE_AS_NEW_COUNT);
    // The pass was abandoned: nothing committed.
    assert!(provider.read_history("a").await.unwrap().is_empty());
}

#[tokio::test]
async fn continue_as_new_within_bound_commits_truncated_history() {
    let provider = in_memory();
    let executor = RecordingExecutor::new(|inv| {
        let generation: u32 = inv
            .new_events
            .iter()
            .find_map(|e| match &e.kind {
                taskhub::EventKind::ExecutionStarted { input, .. } => input.as_deref().and_then(|i| i.parse().ok()),
                _ => None,
            })
            .unwrap_or(0);
        if generation < 5 {
            Ok(ExecutionResults::new(vec![Action::continue_as_new(1, Some((generation + 1).to_string()))])
                .with_custom_status(format!("gen-{generation}")))
        } else {
            Ok(ExecutionResults::new(vec![Action::schedule_task(1, "Work", None)]))
        }
    });
    let processor = OrchestrationProcessor::new(provider.clone(), executor.clone());
    schedule(&provider, "a").await;

    let outcome = run_once(&provider, &processor).await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Executed {
            status: OrchestrationStatus::Running,
            invocations: 5
        }
    );
    let history = provider.read_history("a").await.unwrap();
    assert_eq!(kinds(&history), vec!["OrchestratorStarted", "ExecutionStarted", "TaskScheduled"]);
    let metadata = provider.get_orchestration_metadata("a").await.unwrap();
    assert_eq!(metadata.input.as_deref(), Some("5"));
    // The last invocation did not set a custom status.
    assert_eq!(metadata.custom_status, None);
}

#[tokio::test]
async fn max_continue_as_new_is_configurable() {
    let provider = in_memory();
    let executor = RecordingExecutor::new(|_| Ok(ExecutionResults::new(vec![Action::continue_as_new(1, None)])));
    let processor = OrchestrationProcessor::new(provider.clone(), executor.clone()).with_max_continue_as_new(3);
    schedule(&provider, "a").await;

    assert!(matches!(
        run_once(&provider, &processor).await,
        Err(ProcessError::ContinueAsNewLimit(3))
    ));
    assert_eq!(executor.call_count(), 3);
}

#[tokio::test]
async fn executor_error_abandons_and_redelivers() {
    let provider = in_memory();
    let executor = RecordingExecutor::new(|_| Err(ExecutorError::new("boom")));
    let processor = OrchestrationProcessor::new(provider.clone(), executor.clone());
    schedule(&provider, "a").await;

    let err = run_once(&provider, &processor).await.unwrap_err();
    assert!(matches!(&err, ProcessError::Executor(e) if e.message == "boom"));

    let wi = provider.get_orchestration_work_item().await.unwrap().unwrap();
    assert_eq!(wi.dequeue_count, 2);
    assert_eq!(kinds(&wi.new_events), vec!["ExecutionStarted"]);
}

#[tokio::test]
async fn unknown_action_fails_the_pass() {
    let provider = in_memory();
    let executor = RecordingExecutor::new(|_| Ok(ExecutionResults::new(vec![Action::new(4, ActionKind::Unknown)])));
    let processor = OrchestrationProcessor::new(provider.clone(), executor);
    schedule(&provider, "a").await;

    let err = run_once(&provider, &processor).await.unwrap_err();
    assert!(matches!(err, ProcessError::ApplyActions(_)));
    assert!(provider.read_history("a").await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_pass_does_not_load_or_execute() {
    let provider = in_memory();
    let executor = RecordingExecutor::idle();
    let processor = OrchestrationProcessor::new(provider.clone(), executor.clone());
    schedule(&provider, "a").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut wi = provider.get_orchestration_work_item().await.unwrap().unwrap();
    let err = processor.process(&mut wi, &cancel).await.unwrap_err();

    assert!(matches!(err, ProcessError::Cancelled));
    assert!(wi.state.is_none());
    assert_eq!(executor.call_count(), 0);
    provider.abandon_orchestration_work_item(wi).await.unwrap();
}

#[tokio::test]
async fn sub_orchestration_round_trip() {
    let provider = in_memory();
    let executor = RecordingExecutor::new(|inv| {
        if inv.instance_id == "parent" {
            if has_kind(&inv.new_events, "SubOrchestrationInstanceCompleted") {
                return Ok(ExecutionResults::new(vec![Action::complete(2, Some("parent-done".into()))]));
            }
            return Ok(ExecutionResults::new(vec![Action::new(
                1,
                ActionKind::CreateSubOrchestration {
                    name: "Child".into(),
                    instance_id: Some("child".into()),
                    input: None,
                },
            )]));
        }
        Ok(ExecutionResults::new(vec![Action::complete(1, Some("child-done".into()))]))
    });
    let processor = OrchestrationProcessor::new(provider.clone(), executor);
    schedule(&provider, "parent").await;

    // parent start, child start, parent resume
    for _ in 0..3 {
        run_once(&provider, &processor).await.unwrap();
    }

    let child = provider.get_orchestration_metadata("child").await.unwrap();
    assert_eq!(child.output.as_deref(), Some("child-done"));
    let parent = provider.get_orchestration_metadata("parent").await.unwrap();
    assert_eq!(parent.runtime_status, OrchestrationStatus::Completed);
    assert_eq!(parent.output.as_deref(), Some("parent-done"));
}
