//! Polling worker that hosts a [`TaskProcessor`].
//!
//! Each poll loop fetches a work item, processes it, then completes it on
//! success or abandons it on error. Idle loops back off exponentially from
//! `poll_interval` up to `max_poll_interval`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::providers::ProviderError;

/// A unit of work that a [`TaskWorker`] knows how to fetch and settle.
#[async_trait::async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    type WorkItem: Send + 'static;
    type Outcome: fmt::Debug + Send;
    type Error: fmt::Display + Send;

    fn name(&self) -> &'static str;

    async fn fetch_work_item(&self) -> Result<Option<Self::WorkItem>, ProviderError>;

    async fn process_work_item(
        &self,
        work_item: &mut Self::WorkItem,
        cancel: &CancellationToken,
    ) -> Result<Self::Outcome, Self::Error>;

    async fn complete_work_item(&self, work_item: Self::WorkItem) -> Result<(), ProviderError>;

    async fn abandon_work_item(&self, work_item: Self::WorkItem) -> Result<(), ProviderError>;
}

#[derive(Debug, Clone)]
pub struct TaskWorkerOptions {
    /// Delay after an empty fetch. Default: 100ms.
    pub poll_interval: Duration,
    /// Upper bound for the idle backoff. Default: 5s.
    pub max_poll_interval: Duration,
    /// Number of independent poll loops. Default: 1.
    pub concurrency: usize,
}

impl Default for TaskWorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(5),
            concurrency: 1,
        }
    }
}

pub struct TaskWorker<P: TaskProcessor> {
    processor: Arc<P>,
    options: TaskWorkerOptions,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: TaskProcessor> TaskWorker<P> {
    pub fn new(processor: P, options: TaskWorkerOptions) -> Self {
        Self {
            processor: Arc::new(processor),
            options,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Spawn the poll loops. Calling `start` on a running worker is a no-op.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }
        let concurrency = self.options.concurrency.max(1);
        debug!(target: "taskhub::runtime::worker", worker = self.processor.name(), concurrency, "starting worker");
        for _ in 0..concurrency {
            let processor = Arc::clone(&self.processor);
            let options = self.options.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(poll_loop(processor, options, cancel)));
        }
    }

    /// Cancel the poll loops and wait for in-flight work to settle.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(
                    target: "taskhub::runtime::worker",
                    worker = self.processor.name(),
                    error = %e,
                    "poll loop panicked"
                );
            }
        }
        debug!(target: "taskhub::runtime::worker", worker = self.processor.name(), "worker stopped");
    }

    /// Fetch and settle at most one work item on the caller's task.
    ///
    /// Returns `Ok(false)` when no work was available.
    pub async fn process_next(&self) -> Result<bool, ProviderError> {
        process_next(self.processor.as_ref(), &self.cancel).await
    }
}

async fn poll_loop<P: TaskProcessor>(processor: Arc<P>, options: TaskWorkerOptions, cancel: CancellationToken) {
    let mut delay = options.poll_interval;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match process_next(processor.as_ref(), &cancel).await {
            Ok(true) => {
                delay = options.poll_interval;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    target: "taskhub::runtime::worker",
                    worker = processor.name(),
                    error = %e,
                    "failed to fetch work item"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(options.max_poll_interval);
    }
}

async fn process_next<P: TaskProcessor>(processor: &P, cancel: &CancellationToken) -> Result<bool, ProviderError> {
    let Some(mut work_item) = processor.fetch_work_item().await? else {
        return Ok(false);
    };

    match processor.process_work_item(&mut work_item, cancel).await {
        Ok(outcome) => {
            debug!(target: "taskhub::runtime::worker", worker = processor.name(), ?outcome, "work item processed");
            if let Err(e) = processor.complete_work_item(work_item).await {
                error!(
                    target: "taskhub::runtime::worker",
                    worker = processor.name(),
                    error = %e,
                    "failed to complete work item"
                );
            }
        }
        Err(e) => {
            warn!(
                target: "taskhub::runtime::worker",
                worker = processor.name(),
                error = %e,
                "work item processing failed; abandoning"
            );
            if let Err(e) = processor.abandon_work_item(work_item).await {
                error!(
                    target: "taskhub::runtime::worker",
                    worker = processor.name(),
                    error = %e,
                    "failed to abandon work item"
                );
            }
        }
    }
    Ok(true)
}
