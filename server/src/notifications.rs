//! In-process reminder hub.
//!
//! The scheduler publishes pending-reminder events here; in-app feeds
//! subscribe per agent. Channels are per-recipient broadcast senders, so
//! delivery to one recipient is FIFO in event-creation order. The hub is
//! process-local and not durable; a missed reminder re-fires on the next
//! scheduler scan because `until_time` stays set.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// A reminder addressed to one agent.
#[derive(Debug, Clone)]
pub struct ReminderEvent {
    pub ticket_id: i64,
    pub tn: String,
    pub title: String,
    pub until_time: i64,
    pub fired_at: DateTime<Utc>,
}

/// Shared hub state. Each service instance gets its own hub.
pub struct NotificationHub {
    /// Broadcast channels per recipient (user_id -> sender)
    channels: Arc<RwLock<HashMap<i64, broadcast::Sender<ReminderEvent>>>>,
    /// Max events buffered per subscriber before lagging
    buffer_size: usize,
}

impl NotificationHub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            buffer_size,
        }
    }

    async fn channel(&self, user_id: i64) -> broadcast::Sender<ReminderEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(user_id)
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(self.buffer_size);
                debug!(user_id, "Created reminder channel");
                tx
            })
            .clone()
    }

    /// Subscribe to one agent's reminder feed.
    pub async fn subscribe(&self, user_id: i64) -> broadcast::Receiver<ReminderEvent> {
        self.channel(user_id).await.subscribe()
    }

    /// Publish a reminder to one agent. Events with no live subscriber are
    /// dropped; the feed is advisory.
    pub async fn emit(&self, user_id: i64, event: ReminderEvent) {
        let tx = self.channel(user_id).await;
        let receivers = tx.send(event).unwrap_or(0);
        debug!(user_id, receivers, "Reminder emitted");
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(1024)
    }
}
