//! Per-session state machine.
//!
//! `idle -> running -> attention -> running -> ... -> idle`. Every method
//! returns the transition that actually happened, or `None` when the trigger
//! was a no-op in the current state. The registry turns transitions into
//! events and counter updates.

use super::types::{SessionId, SessionState};
use crate::event::SessionEvent;

/// Result of the last classification pass. Reset whenever a process starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ScanState {
    attention_found: bool,
}

/// A state change that was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A process was (re)started. `cleared_attention` is set when the session
    /// was in `attention` before a restart.
    Started { cleared_attention: bool },
    /// The screen started asking for a human.
    AttentionRaised { pattern: String },
    /// The attention condition went away.
    AttentionCleared,
    /// The process ended.
    Exited {
        exit_code: Option<i32>,
        cleared_attention: bool,
    },
}

impl Transition {
    /// State the session is in after this transition.
    pub fn new_state(&self) -> SessionState {
        match self {
            Transition::Started { .. } | Transition::AttentionCleared => SessionState::Running,
            Transition::AttentionRaised { .. } => SessionState::Attention,
            Transition::Exited { .. } => SessionState::Idle,
        }
    }

    /// Change to the aggregate "needs attention" count.
    pub fn attention_delta(&self) -> isize {
        match self {
            Transition::AttentionRaised { .. } => 1,
            Transition::AttentionCleared => -1,
            Transition::Started { cleared_attention }
            | Transition::Exited {
                cleared_attention, ..
            } => -isize::from(*cleared_attention),
        }
    }

    /// Events to publish for this transition, in order.
    pub fn events(&self, session_id: &SessionId) -> Vec<SessionEvent> {
        let state_changed = SessionEvent::StateChanged {
            session_id: session_id.clone(),
            state: self.new_state(),
        };
        match self {
            Transition::AttentionRaised { pattern } => vec![
                SessionEvent::AttentionDetected {
                    session_id: session_id.clone(),
                    pattern: pattern.clone(),
                },
                state_changed,
            ],
            Transition::Exited { exit_code, .. } => vec![
                SessionEvent::ProcessExited {
                    session_id: session_id.clone(),
                    exit_code: *exit_code,
                },
                state_changed,
            ],
            Transition::Started { .. } | Transition::AttentionCleared => vec![state_changed],
        }
    }
}

/// State plus scan bookkeeping for one session.
#[derive(Debug, Clone, Default)]
pub struct SessionMachine {
    state: SessionState,
    scan: ScanState,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    fn last_scan_found_attention(&self) -> bool {
        self.scan.attention_found
    }

    /// Explicit start request. Only valid from `idle`.
    pub fn start(&mut self) -> Option<Transition> {
        if self.state != SessionState::Idle {
            return None;
        }
        self.scan = ScanState::default();
        self.state = SessionState::Running;
        Some(Transition::Started {
            cleared_attention: false,
        })
    }

    /// Explicit restart request. Valid from any state.
    pub fn restart(&mut self) -> Transition {
        let cleared_attention = self.state == SessionState::Attention;
        self.scan = ScanState::default();
        self.state = SessionState::Running;
        Transition::Started { cleared_attention }
    }

    /// Feed one classification result.
    ///
    /// Only an edge of the scan flag can change state: a first match while
    /// `running` raises attention, a first miss while in `attention` clears
    /// it. Repeated identical results are no-ops.
    pub fn apply_scan(&mut self, matched: Option<&str>) -> Option<Transition> {
        if self.state == SessionState::Idle {
            return None;
        }
        let found_before = self.scan.attention_found;
        self.scan.attention_found = matched.is_some();
        match (self.state, matched) {
            (SessionState::Running, Some(pattern)) if !found_before => {
                self.state = SessionState::Attention;
                Some(Transition::AttentionRaised {
                    pattern: pattern.to_string(),
                })
            }
            (SessionState::Attention, None) if found_before => {
                self.state = SessionState::Running;
                Some(Transition::AttentionCleared)
            }
            _ => None,
        }
    }

    /// Process-exit callback. No-op when already `idle`.
    pub fn process_exited(&mut self, exit_code: Option<i32>) -> Option<Transition> {
        if self.state == SessionState::Idle {
            return None;
        }
        let cleared_attention = self.state == SessionState::Attention;
        self.scan = ScanState::default();
        self.state = SessionState::Idle;
        Some(Transition::Exited {
            exit_code,
            cleared_attention,
        })
    }
}
