//! Security-event reporting.
//!
//! Client-submitted failure reports and relay-detected abuse (third
//! participants, blacklist promotions) are forwarded to a
//! [`FailureReporter`]. The relay never waits on it.

use std::sync::Mutex;

/// Tracing target of security events.
pub const SECURITY_TARGET: &str = "keyexchange::security";

/// Sink for security events.
pub trait FailureReporter: Send + Sync {
    /// Record `message`. Must not block.
    fn report(&self, message: &str);
}

/// Emits every report as a `WARN` event on [`SECURITY_TARGET`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl FailureReporter for TracingReporter {
    fn report(&self, message: &str) {
        tracing::warn!(target: SECURITY_TARGET, "{}", message);
    }
}

/// Keeps reports in memory, for tests and local debugging.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    messages: Mutex<Vec<String>>,
}

impl MemoryReporter {
    /// Create an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports received so far, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

impl FailureReporter for MemoryReporter {
    fn report(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}
