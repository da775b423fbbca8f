/// Classification carried by every [`ProviderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Transient: busy database, timeouts, lost connections.
    Retryable,
    /// Will not succeed on retry: corrupt payloads, stale lock tokens, bad input.
    Permanent,
    /// The addressed orchestration instance does not exist.
    InstanceNotFound,
    /// An instance with the requested id already exists.
    AlreadyExists,
}

/// Provider-specific error with retry classification
///
/// Providers return this error type to tell callers whether an operation may
/// succeed when retried, and to keep "instance not found" separate from
/// infrastructure failures so clients can tell "never existed" apart from
/// "temporarily unreachable".
///
/// ```rust
/// use taskhub::providers::ProviderError;
///
/// let busy = ProviderError::retryable("complete_orchestration_work_item", "database is locked");
/// assert!(busy.is_retryable());
///
/// let missing = ProviderError::not_found("get_orchestration_metadata", "abc");
/// assert!(missing.is_not_found());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct ProviderError {
    /// Operation that failed (e.g., "get_orchestration_work_item")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind,
        }
    }

    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Retryable, operation, message)
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Permanent, operation, message)
    }

    pub fn not_found(operation: impl Into<String>, instance_id: &str) -> Self {
        Self::new(
            ProviderErrorKind::InstanceNotFound,
            operation,
            format!("instance not found: {instance_id}"),
        )
    }

    pub fn already_exists(operation: impl Into<String>, instance_id: &str) -> Self {
        Self::new(
            ProviderErrorKind::AlreadyExists,
            operation,
            format!("instance already exists: {instance_id}"),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Retryable
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::InstanceNotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == ProviderErrorKind::AlreadyExists
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        Self::permanent("serde", format!("payload encoding error: {e}"))
    }
}
