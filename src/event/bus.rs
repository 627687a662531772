//! Broadcast fan-out of session events.
//!
//! One global channel carries every event; each session additionally owns a
//! channel carrying only its own events. Dropping a session's sender is how
//! its subscriptions are terminated.

use std::collections::HashMap;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use super::SessionEvent;
use crate::session::SessionId;

/// Per-subscriber buffer size. Slow readers lose the oldest events first.
///
/// This is a lower bound: tokio rounds broadcast capacity up to the next
/// power of two, so a subscriber actually holds up to 128 events before
/// lagging.
pub const EVENT_BUFFER: usize = 100;

/// Registry-owned event fan-out. Not internally synchronized: the registry
/// only touches it from inside its own lock.
pub struct EventBus {
    capacity: usize,
    global: Option<broadcast::Sender<SessionEvent>>,
    sessions: HashMap<SessionId, broadcast::Sender<SessionEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (global, _) = broadcast::channel(capacity);
        Self {
            capacity,
            global: Some(global),
            sessions: HashMap::new(),
        }
    }

    /// Create the per-session channel. Idempotent.
    pub fn register(&mut self, session_id: &str) {
        let capacity = self.capacity;
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0);
    }

    /// Deliver an event to the global stream and to its session's stream.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, event: &SessionEvent) {
        if let Some(global) = &self.global {
            let _ = global.send(event.clone());
        }
        if let Some(tx) = self.sessions.get(event.session_id()) {
            let _ = tx.send(event.clone());
        }
    }

    /// Subscribe to every session's events.
    ///
    /// After [`close_all`](Self::close_all) the returned subscription is
    /// already terminated.
    pub fn subscribe(&self) -> Subscription {
        match &self.global {
            Some(tx) => Subscription::new(tx.subscribe(), None),
            None => Subscription::closed(None),
        }
    }

    /// Subscribe to one session's events. `None` for an unknown session.
    pub fn subscribe_session(&self, session_id: &str) -> Option<Subscription> {
        self.sessions
            .get(session_id)
            .map(|tx| Subscription::new(tx.subscribe(), Some(session_id.to_string())))
    }

    /// Terminate every subscription for a session and forget its channel.
    ///
    /// Readers drain what is already buffered, then see end-of-stream.
    pub fn close_session(&mut self, session_id: &str) {
        if let Some(tx) = self.sessions.remove(session_id) {
            debug!(
                session_id = %session_id,
                subscribers = tx.receiver_count(),
                "Closing session event stream"
            );
        }
    }

    /// Terminate every subscription, global ones included.
    pub fn close_all(&mut self) {
        self.sessions.clear();
        self.global = None;
    }

    /// Number of live subscriptions for a session (0 if unknown or closed).
    pub fn open_subscriptions(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// An independent stream of events for one consumer.
pub struct Subscription {
    rx: broadcast::Receiver<SessionEvent>,
    /// Session scope, for log context. `None` for the global stream.
    scope: Option<SessionId>,
}

impl Subscription {
    fn new(rx: broadcast::Receiver<SessionEvent>, scope: Option<SessionId>) -> Self {
        Self { rx, scope }
    }

    fn closed(scope: Option<SessionId>) -> Self {
        let (tx, rx) = broadcast::channel(1);
        drop(tx);
        Self { rx, scope }
    }

    /// Wait for the next event. Returns `None` once the stream is closed.
    ///
    /// If this subscriber fell more than the buffer size behind, the skipped
    /// events are logged and reading resumes at the oldest retained event.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.log_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered event without waiting.
    pub fn try_next(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.log_lag(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    fn log_lag(&self, skipped: u64) {
        warn!(
            scope = self.scope.as_deref().unwrap_or("global"),
            skipped,
            "Event subscriber lagged, oldest events dropped"
        );
    }
}
