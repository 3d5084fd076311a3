//! Notification Queue - durable per-user FIFO of out-of-band messages
//!
//! A notification is written to disk before anything else happens. It stays
//! queued until the event bus reports that at least one attached subscriber
//! received it, so messages sent while a user is offline arrive on their next
//! attach, in the order they were enqueued.
//!
//! Enqueue and drain for one user are serialized by a per-user lock, so a
//! push-on-enqueue never interleaves with a drain-on-attach.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::events::{Event, EventBus, EventKind, Scope};
use crate::metrics::NOTIFICATIONS;
use crate::store::{file_stem, read_json_or_default, write_json_atomic, StoreError};

/// An out-of-band message for a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
}

/// Durable notification queues, one JSON file per user
pub struct NotificationQueue {
    dir: PathBuf,
    bus: EventBus,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NotificationQueue {
    pub fn new(dir: impl Into<PathBuf>, bus: EventBus) -> Self {
        Self {
            dir: dir.into(),
            bus,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, user: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.locks.lock().entry(user.to_string()).or_default())
    }

    fn path(&self, user: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(user)))
    }

    /// Persist a notification, then deliver it right away if the user is attached
    pub async fn enqueue(&self, user: &str, text: &str) -> Result<Notification, StoreError> {
        let lock = self.lock_for(user);
        let _guard = lock.lock().await;

        let mut notification = Notification {
            id: Uuid::now_v7().to_string(),
            user: user.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
            delivered: false,
        };

        let path = self.path(user);
        let mut queue: Vec<Notification> = read_json_or_default(&path).await?;
        queue.push(notification.clone());
        write_json_atomic(&path, &queue).await?;
        NOTIFICATIONS.with_label_values(&["enqueued"]).inc();
        info!(user, id = %notification.id, queued = queue.len(), "notification enqueued");

        if self.bus.has_subscribers(user) {
            let delivered = self.drain_locked(user).await?;
            notification.delivered = delivered.iter().any(|n| n.id == notification.id);
        }
        Ok(notification)
    }

    /// Publish pending notifications in FIFO order, removing each one that
    /// reached a subscriber. Stops at the first undelivered notification.
    pub async fn drain(&self, user: &str) -> Result<Vec<Notification>, StoreError> {
        let lock = self.lock_for(user);
        let _guard = lock.lock().await;
        self.drain_locked(user).await
    }

    async fn drain_locked(&self, user: &str) -> Result<Vec<Notification>, StoreError> {
        let path = self.path(user);
        let mut queue: Vec<Notification> = read_json_or_default(&path).await?;
        if queue.is_empty() {
            return Ok(Vec::new());
        }

        let mut delivered = Vec::new();
        for notification in &queue {
            let event = Event::new(
                Scope::User(user.to_string()),
                EventKind::Notification {
                    id: notification.id.clone(),
                    text: notification.text.clone(),
                },
            );
            if self.bus.publish(event) == 0 {
                break;
            }
            let mut sent = notification.clone();
            sent.delivered = true;
            delivered.push(sent);
        }

        if !delivered.is_empty() {
            queue.drain(..delivered.len());
            write_json_atomic(&path, &queue).await?;
            NOTIFICATIONS
                .with_label_values(&["delivered"])
                .inc_by(delivered.len() as f64);
            debug!(user, delivered = delivered.len(), remaining = queue.len(), "notifications drained");
        }
        Ok(delivered)
    }

    /// Queued notifications, without delivering them
    pub async fn pending(&self, user: &str) -> Result<Vec<Notification>, StoreError> {
        read_json_or_default(&self.path(user)).await
    }
}
