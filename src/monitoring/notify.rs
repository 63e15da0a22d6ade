//! Failure Notification
//!
//! Escalation path for plugins that keep failing. Mail formatting and
//! delivery live outside this crate; a [`Notifier`] receives the facts.

use std::sync::Mutex;

use log::{error, warn};
use serde::{Deserialize, Serialize};

/// How loudly a plugin failure should be reported.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
}

/// One escalation.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub plugin: String,
    pub severity: Severity,
    pub consecutive_failures: u32,
    pub message: String,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Reports escalations through the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: &Notification) {
        match n.severity {
            Severity::High => error!(
                "Plugin {} failed {} times in a row: {}",
                n.plugin, n.consecutive_failures, n.message
            ),
            _ => warn!(
                "Plugin {} failed {} times in a row: {}",
                n.plugin, n.consecutive_failures, n.message
            ),
        }
    }
}

/// Collects escalations in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: &Notification) {
        match self.sent.lock() {
            Ok(mut sent) => sent.push(notification.clone()),
            Err(poisoned) => poisoned.into_inner().push(notification.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_yaml() {
        let s: Severity = serde_yaml::from_str("high").unwrap();
        assert_eq!(s, Severity::High);
        assert_eq!(Severity::default(), Severity::Medium);
    }
}
