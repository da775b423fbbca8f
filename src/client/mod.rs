use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::providers::{OrchestrationMetadata, Provider, ProviderError};
use crate::runtime::limits::DEFAULT_CLIENT_POLL_INTERVAL;
use crate::Event;

/// Error returned by [`Client`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The instance was never created.
    #[error("orchestration instance not found: {0}")]
    NotFound(String),
    /// The caller's cancellation token fired while waiting.
    #[error("wait was cancelled")]
    Cancelled,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl ClientError {
    fn from_provider(instance_id: &str, e: ProviderError) -> Self {
        if e.is_not_found() {
            Self::NotFound(instance_id.to_string())
        } else {
            Self::Provider(e)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Interval between metadata polls in the wait helpers. Default: 1s.
    pub poll_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_CLIENT_POLL_INTERVAL,
        }
    }
}

/// Options for [`Client::schedule_new_orchestration`].
#[derive(Debug, Clone, Default)]
pub struct NewOrchestrationOptions {
    /// Instance id to use; a random UUID when `None`.
    pub instance_id: Option<String>,
    pub input: Option<String>,
}

impl NewOrchestrationOptions {
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }
}

/// Thin client for control-plane operations.
///
/// The client talks to workers only through the shared [`Provider`]: every
/// operation is an enqueue or a metadata read.
#[derive(Clone)]
pub struct Client {
    provider: Arc<dyn Provider>,
    options: ClientOptions,
}

impl Client {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self::with_options(provider, ClientOptions::default())
    }

    pub fn with_options(provider: Arc<dyn Provider>, options: ClientOptions) -> Self {
        Self { provider, options }
    }

    /// Create an orchestration instance and return its id.
    pub async fn schedule_new_orchestration(
        &self,
        name: impl Into<String>,
        options: NewOrchestrationOptions,
    ) -> Result<String, ClientError> {
        let instance_id = options
            .instance_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let name = name.into();
        let start = Event::execution_started(name.as_str(), instance_id.as_str(), options.input, None);
        self.provider.create_orchestration_instance(start).await?;
        debug!(
            target: "taskhub::client",
            instance_id = %instance_id,
            orchestration_name = %name,
            "scheduled orchestration"
        );
        Ok(instance_id)
    }

    pub async fn fetch_orchestration_metadata(&self, instance_id: &str) -> Result<OrchestrationMetadata, ClientError> {
        self.provider
            .get_orchestration_metadata(instance_id)
            .await
            .map_err(|e| ClientError::from_provider(instance_id, e))
    }

    /// Poll until the instance leaves `Pending`.
    pub async fn wait_for_orchestration_start(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<OrchestrationMetadata, ClientError> {
        self.wait_for(instance_id, cancel, |m| m.is_running() || m.is_complete())
            .await
    }

    /// Poll until the instance reaches a terminal status.
    pub async fn wait_for_orchestration_completion(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<OrchestrationMetadata, ClientError> {
        self.wait_for(instance_id, cancel, OrchestrationMetadata::is_complete).await
    }

    async fn wait_for(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
        done: impl Fn(&OrchestrationMetadata) -> bool,
    ) -> Result<OrchestrationMetadata, ClientError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let metadata = self.fetch_orchestration_metadata(instance_id).await?;
            if done(&metadata) {
                return Ok(metadata);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
    }

    /// Request termination. Takes effect once a worker processes the event.
    pub async fn terminate_orchestration(&self, instance_id: &str, reason: Option<String>) -> Result<(), ClientError> {
        self.provider
            .add_new_orchestration_event(instance_id, Event::execution_terminated(reason))
            .await
            .map_err(|e| ClientError::from_provider(instance_id, e))
    }

    /// Deliver an external event to a running instance.
    pub async fn raise_event(
        &self,
        instance_id: &str,
        name: impl Into<String>,
        data: Option<String>,
    ) -> Result<(), ClientError> {
        self.provider
            .add_new_orchestration_event(instance_id, Event::event_raised(name, data))
            .await
            .map_err(|e| ClientError::from_provider(instance_id, e))
    }
}
