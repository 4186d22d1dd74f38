//! Boundary ports — notification and enforcement collaborators.
//!
//! The engine never blocks on delivery: notifications are queued onto a
//! worker thread and sent fire-and-forget, so a slow Telegram call can't
//! stall a sweep. Enforcement calls go through the same trait-seam style;
//! their failures are logged and retried on the next sweep, never allowed
//! to veto a recorded state transition.

use std::sync::mpsc;
use std::thread;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

/// How loudly a notification should present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

/// An action button carried with a notification (accept/decline flows).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
    /// Stable identifier the caller echoes back (e.g. "suggestion:accept").
    pub id: String,
    pub label: String,
}

impl NotificationAction {
    pub fn new(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
        }
    }
}

/// One outbound message.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub user_id: String,
    pub level: u8,
    pub message: String,
    pub urgency: Urgency,
    pub actions: Vec<NotificationAction>,
}

/// Outbound message sink. Implementations must tolerate being called from
/// the queue worker thread.
pub trait NotificationPort: Send + Sync + 'static {
    fn send(&self, notification: &Notification) -> Result<()>;
}

/// External restriction capability. Implementations shell out, call an OS
/// API, or do nothing; the engine only cares about success/failure.
pub trait EnforcementPort: Send + Sync + 'static {
    fn set_allowed_apps(&self, user_id: &str, allowed_apps: &[String]) -> Result<()>;
    fn clear(&self, user_id: &str) -> Result<()>;
}

/// Fire-and-forget dispatch queue in front of a `NotificationPort`.
///
/// Dropping the queue closes the channel and joins the worker, flushing
/// whatever was already enqueued.
pub struct NotifyQueue {
    tx: Option<mpsc::Sender<Notification>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl NotifyQueue {
    pub fn new(port: Box<dyn NotificationPort>) -> Self {
        let (tx, rx) = mpsc::channel::<Notification>();
        let worker = thread::spawn(move || {
            for notification in rx {
                debug!(
                    user = %notification.user_id,
                    level = notification.level,
                    "delivering notification"
                );
                if let Err(err) = port.send(&notification) {
                    warn!(
                        user = %notification.user_id,
                        error = %err,
                        "notification delivery failed"
                    );
                }
            }
        });
        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Enqueue a notification. Never blocks on delivery; a closed queue
    /// (shutdown race) only logs.
    pub fn push(&self, notification: Notification) {
        if let Some(tx) = &self.tx {
            if tx.send(notification).is_err() {
                warn!("notification queue closed; message dropped");
            }
        }
    }
}

impl Drop for NotifyQueue {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
