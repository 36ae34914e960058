//! User-facing notification boundary.
//!
//! Notifications are fire-and-forget. The core never consumes a return value
//! from the notifier; presentation is entirely up to the implementation.

use parking_lot::Mutex;
use std::fmt;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyKind {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for NotifyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotifyKind::Info => "info",
            NotifyKind::Success => "success",
            NotifyKind::Warning => "warning",
            NotifyKind::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Recovery the user may pick from a blocking notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    Reload,
    GoOffline,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotifyKind,
    pub title: String,
    pub message: String,
    pub actions: Vec<RecoveryAction>,
}

impl Notification {
    pub fn new(kind: NotifyKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            actions: Vec::new(),
        }
    }

    pub fn with_actions(mut self, actions: &[RecoveryAction]) -> Self {
        self.actions = actions.to_vec();
        self
    }
}

pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, notification: Notification);
}

/// Forwards notifications to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: Notification) {
        match n.kind {
            NotifyKind::Info | NotifyKind::Success => {
                info!(kind = %n.kind, title = %n.title, actions = ?n.actions, "{}", n.message)
            }
            NotifyKind::Warning => {
                warn!(title = %n.title, actions = ?n.actions, "{}", n.message)
            }
            NotifyKind::Error => {
                error!(title = %n.title, actions = ?n.actions, "{}", n.message)
            }
        }
    }
}

/// Captures notifications in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    /// Number of captured notifications whose title equals `title`.
    pub fn count_titled(&self, title: &str) -> usize {
        self.seen.lock().iter().filter(|n| n.title == title).count()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier.notify(Notification::new(NotifyKind::Warning, "Offline", "working locally"));
        notifier.notify(
            Notification::new(NotifyKind::Error, "Connection lost", "gave up")
                .with_actions(&[RecoveryAction::Reload, RecoveryAction::GoOffline]),
        );

        assert_eq!(notifier.count_titled("Offline"), 1);
        assert_eq!(notifier.notifications()[1].actions.len(), 2);
        notifier.clear();
        assert!(notifier.notifications().is_empty());
    }
}
