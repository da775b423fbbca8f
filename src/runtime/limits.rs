//! Runtime limits and constants.
//!
//! Collect all hard limits in one place so they're easy to find, document,
//! and reference from runtime code and tests.

use std::time::Duration;

/// Maximum number of executor invocations a single work item may spend in a
/// tight continue-as-new loop. An orchestration that keeps continuing as new
/// without awaiting anything fails the pass once this is reached.
pub const MAX_CONTINUE_AS_NEW_COUNT: usize = 20;

/// Interval at which client wait helpers poll instance metadata.
pub const DEFAULT_CLIENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a provider lease on an instance's work item stays valid.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
