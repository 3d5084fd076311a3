//! Event Multiplexer
//!
//! Merges chat, execution and notification events into one ordered sequence
//! per attached subscriber.
//!
//! ```text
//!  ChatAgent ──────┐
//!  ExecutionChannel├─► EventBus::publish ──► [bounded buffer] ─► Subscription (conn 1)
//!  NotificationQueue┘        │             └► [bounded buffer] ─► Subscription (conn 2)
//!                            └─ buffer full ─► subscriber dropped (SlowConsumer)
//! ```
//!
//! Publishing happens under one lock, so every subscriber sees events in
//! publish order. There is no replay: a subscriber only sees what was
//! published after it subscribed.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ErrorInfo;
use crate::exec::ExecState;
use crate::metrics::SLOW_CONSUMERS;

/// Who an event is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every session of the user
    User(String),
    /// One session of the user
    Session { user: String, session: String },
}

impl Scope {
    pub fn session(user: impl Into<String>, session: impl Into<String>) -> Self {
        Scope::Session {
            user: user.into(),
            session: session.into(),
        }
    }

    pub fn user(&self) -> &str {
        match self {
            Scope::User(user) | Scope::Session { user, .. } => user,
        }
    }

    fn matches(&self, user: &str, session: &str) -> bool {
        match self {
            Scope::User(u) => u == user,
            Scope::Session { user: u, session: s } => u == user && s == session,
        }
    }
}

/// Payload of an event
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    ChatFragment(String),
    ExecOutput(String),
    StdinRequest(String),
    Notification { id: String, text: String },
    Error(ErrorInfo),
    ExecFinished {
        state: ExecState,
        exit_code: Option<i32>,
        duration_ms: u64,
    },
}

/// Unit of outbound information
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub scope: Scope,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(scope: Scope, kind: EventKind) -> Self {
        Self {
            scope,
            kind,
            at: Utc::now(),
        }
    }
}

/// Why a subscription ended on the bus side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    SlowConsumer,
}

struct Subscriber {
    user: String,
    session: String,
    tx: mpsc::Sender<Event>,
    reason: Arc<Mutex<Option<CloseReason>>>,
}

struct BusInner {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

/// Fan-out of events to subscribers
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus; `buffer` is the per-subscriber backlog before it is
    /// dropped as a slow consumer
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Attach a subscriber for (user, session)
    pub fn subscribe(&self, user: &str, session: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let reason = Arc::new(Mutex::new(None));
        self.inner.subscribers.lock().insert(
            id,
            Subscriber {
                user: user.to_string(),
                session: session.to_string(),
                tx,
                reason: Arc::clone(&reason),
            },
        );
        debug!(user, session, id, "subscriber attached");
        Subscription {
            id,
            rx,
            reason,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every matching subscriber; returns how many got it
    pub fn publish(&self, event: Event) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        let mut delivered = 0;
        let mut dropped = Vec::new();

        for (id, sub) in subscribers.iter() {
            if !event.scope.matches(&sub.user, &sub.session) {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(user = %sub.user, session = %sub.session, "dropping slow subscriber");
                    SLOW_CONSUMERS.inc();
                    *sub.reason.lock() = Some(CloseReason::SlowConsumer);
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
            }
        }

        for id in dropped {
            subscribers.remove(&id);
        }
        delivered
    }

    /// Whether any subscription for the user is attached
    pub fn has_subscribers(&self, user: &str) -> bool {
        self.inner
            .subscribers
            .lock()
            .values()
            .any(|sub| sub.user == user && !sub.tx.is_closed())
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Events for one (user, session), in publish order
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    reason: Arc<Mutex<Option<CloseReason>>>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Set once the bus has dropped this subscriber
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.reason.lock()
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.lock().remove(&self.id);
        }
    }
}
