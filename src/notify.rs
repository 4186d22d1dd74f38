//! Notification adapters.
//!
//! `LogNotifier` is the default sink: every message lands in the tracing
//! output and nothing leaves the machine. `TelegramNotifier` pushes the
//! same messages through the Telegram Bot API for phones that need to buzz.

use anyhow::{Context, Result};
use tracing::info;

use crate::ports::{Notification, NotificationPort, Urgency};

/// Render a notification as a single human-readable line.
///
/// Shared by both adapters so the Telegram text and the log line agree.
pub fn render_message(notification: &Notification) -> String {
    let urgency = match notification.urgency {
        Urgency::Low => "",
        Urgency::Normal => "",
        Urgency::High => "[!] ",
        Urgency::Critical => "[!!] ",
    };
    let mut line = format!(
        "{urgency}L{} — {}",
        notification.level, notification.message
    );
    if !notification.actions.is_empty() {
        let labels: Vec<&str> = notification
            .actions
            .iter()
            .map(|a| a.label.as_str())
            .collect();
        line.push_str(&format!(" ({})", labels.join(" / ")));
    }
    line
}

/// Default sink: structured log output only.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl NotificationPort for LogNotifier {
    fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            user = %notification.user_id,
            level = notification.level,
            urgency = ?notification.urgency,
            "{}",
            render_message(notification)
        );
        Ok(())
    }
}

/// Telegram Bot API sink.
pub struct TelegramNotifier {
    token: String,
    chat_id: String,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Self {
        Self {
            token,
            chat_id,
            api_base: "https://api.telegram.org".to_string(),
        }
    }

    /// Point the adapter at a different API host (tests, proxies).
    #[allow(dead_code)]
    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base;
        self
    }
}

impl NotificationPort for TelegramNotifier {
    fn send(&self, notification: &Notification) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let response = ureq::post(&url)
            .send_json(serde_json::json!({
                "chat_id": self.chat_id,
                "text": render_message(notification),
            }))
            .context("telegram sendMessage failed")?;
        if response.status() != 200 {
            anyhow::bail!("telegram sendMessage returned {}", response.status());
        }
        Ok(())
    }
}
