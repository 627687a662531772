//! Session events and their fan-out.
//!
//! Events are immutable values published by the registry on every real state
//! transition. Observers attach through [`EventBus`] subscriptions.

pub mod bus;

pub use bus::{EventBus, Subscription, EVENT_BUFFER};

use serde::{Deserialize, Serialize};

use crate::session::{SessionId, SessionState};

/// A state-change notification for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session moved to a new state.
    StateChanged {
        session_id: SessionId,
        state: SessionState,
    },
    /// The classifier flagged the screen. `pattern` is the triggering line.
    AttentionDetected {
        session_id: SessionId,
        pattern: String,
    },
    /// The session's process went away. `None` when no exit code was available.
    ProcessExited {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
}

impl SessionEvent {
    /// The session this event belongs to.
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::AttentionDetected { session_id, .. }
            | SessionEvent::ProcessExited { session_id, .. } => session_id,
        }
    }

    /// The new state, for `StateChanged` events.
    pub fn new_state(&self) -> Option<SessionState> {
        match self {
            SessionEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        }
    }
}
