//! Notifier capability trait.
//!
//! The engine pushes structured events; formatting and delivery (telegram,
//! reports) live outside the core. `ERROR` is reserved for strategy and
//! loop exceptions, terminal order-submit failures and critical
//! reconciliation verdicts.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, severity: Severity, kind: &str, payload: Value);
}

/// Default notifier: renders events into the structured log stream.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, severity: Severity, kind: &str, payload: Value) {
        match severity {
            Severity::Info => tracing::info!(kind, %payload, "event"),
            Severity::Warning => tracing::warn!(kind, %payload, "event"),
            Severity::Error => tracing::error!(kind, %payload, "event"),
        }
    }
}

pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Captures events for assertions in tests.
    #[derive(Default)]
    pub struct MemoryNotifier {
        pub events: Mutex<Vec<(Severity, String, Value)>>,
    }

    impl MemoryNotifier {
        pub fn kinds_at(&self, severity: Severity) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _, _)| *s == severity)
                .map(|(_, k, _)| k.clone())
                .collect()
        }
    }

    impl Notifier for MemoryNotifier {
        fn notify(&self, severity: Severity, kind: &str, payload: Value) {
            self.events
                .lock()
                .unwrap()
                .push((severity, kind.to_string(), payload));
        }
    }
}
