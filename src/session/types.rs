//! Value types shared between the registry and its observers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unique identifier for a tracked session.
pub type SessionId = String;

/// Coarse lifecycle state of a session as seen by front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No process running.
    #[default]
    Idle,
    /// Process started and producing output.
    Running,
    /// The screen looks like it is waiting on a human.
    Attention,
}

impl SessionState {
    /// Whether a process is expected to be alive in this state.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Attention)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Attention => "attention",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only copy of a session, taken at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    /// Canonical project directory.
    pub repo_path: PathBuf,
    /// Display label (final path component).
    pub repo_name: String,
    pub state: SessionState,
    /// Number of explicit restarts so far.
    pub restart_epoch: u64,
    /// Extra launch arguments for this session only.
    pub args: Option<String>,
}

/// Origin of a mutating request, used only for authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerContext {
    /// The local interactive front end.
    Interactive,
    /// A URL-scheme style trigger from another application.
    ExternalScheme { source: String },
    /// An automation channel holding a token.
    PrivilegedChannel { token: String },
}

impl CallerContext {
    /// Whether this caller may inject keystrokes into a session.
    pub fn may_send_input(&self) -> bool {
        matches!(self, CallerContext::Interactive)
    }

    /// Short label for logs. Never includes the token.
    pub fn label(&self) -> &str {
        match self {
            CallerContext::Interactive => "interactive",
            CallerContext::ExternalScheme { source } => source,
            CallerContext::PrivilegedChannel { .. } => "privileged-channel",
        }
    }
}

/// What the UI reports about its own focus, used to suppress notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FocusContext {
    /// The app window is frontmost.
    pub app_focused: bool,
    /// The session currently selected in the UI, if any.
    pub selected: Option<SessionId>,
}

impl FocusContext {
    /// True when the user is already looking at `session_id`.
    pub fn is_watching(&self, session_id: &str) -> bool {
        self.app_focused && self.selected.as_deref() == Some(session_id)
    }
}
