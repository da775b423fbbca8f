//! Structured logging setup.
//!
//! The runtime only emits `tracing` events; installing a subscriber is left
//! to the host. [`init_logging`] is a convenience for binaries, demos and
//! tests that want the standard formats.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable multi-line output for development
    Pretty,
    /// Single-line output: timestamp level target fields message
    #[default]
    Compact,
}

/// Logging configuration.
///
/// ```rust,no_run
/// # use taskhub::runtime::{ObservabilityConfig, LogFormat, init_logging};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
/// };
/// init_logging(&config).ok();
/// ```
///
/// Runtime log lines carry `instance_id` and, where known,
/// `orchestration_name` fields.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Level applied to `taskhub` targets when `RUST_LOG` is not set (e.g. "info", "debug").
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,taskhub={level}")
}

/// Install a global subscriber. `RUST_LOG` overrides `config.log_level`.
///
/// Fails if a global subscriber is already installed; callers that may run
/// more than once (tests, multiple workers in one process) can ignore the error.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}
