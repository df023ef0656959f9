//! Fire-and-forget mark notifications.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tally_core::{MarkEvent, PrincipalId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub principal: PrincipalId,
    pub contact: String,
    pub event: MarkEvent,
    pub timestamp: DateTime<Utc>,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Records the notification as a tracing event.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            principal = %n.principal,
            contact = %n.contact,
            event = %n.event,
            timestamp = %n.timestamp,
            "attendance notification"
        );
        Ok(())
    }
}

/// Appends one JSON line per notification for an external mailer to drain.
pub struct SpoolNotifier {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SpoolNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl Notifier for SpoolNotifier {
    fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        let mut line = serde_json::to_vec(n)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

/// Deliver in the background. Failures are logged and dropped; the mark
/// that produced the notification is already committed.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::task::spawn_blocking(move || {
        if let Err(err) = notifier.notify(&notification) {
            tracing::warn!(
                error = %err,
                principal = %notification.principal,
                event = %notification.event,
                "notification failed; not retrying"
            );
        }
    });
}
