//! Interfaces to the collaborators the registry drives but does not own:
//! the process launcher, the screen reader, the notifier and persistence.

use std::path::PathBuf;

use anyhow::Result;

use crate::persistence::SessionRecord;
use crate::registry::LifecycleSink;
use crate::session::SessionId;

/// Returns the currently visible terminal rows of a session, top to bottom,
/// as plain right-trimmed text.
pub trait ScreenTextSource: Send + Sync {
    fn visible_lines(&self, session_id: &str) -> Vec<String>;
}

/// What to launch for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub session_id: SessionId,
    pub working_dir: PathBuf,
    /// Global args followed by per-session args.
    pub args: Vec<String>,
}

/// Starts processes. Implementations report output and exit through the
/// sink, from any thread. Callbacks may arrive before `launch` returns.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, request: &LaunchRequest, sink: LifecycleSink) -> Result<Box<dyn ProcessHandle>>;
}

/// A running process owned by the registry.
pub trait ProcessHandle: Send {
    /// Write raw input (keystrokes) to the process.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Ask the process to go away. Must not block on the exit callback.
    fn terminate(&mut self);
}

/// Told when a session starts needing attention.
///
/// Only the session id and display name are passed; the matched screen
/// text stays inside the process.
pub trait AttentionNotifier: Send + Sync {
    fn notify_attention(&self, session_id: &str, repo_name: &str);
}

/// Loads and saves the tracked project list.
pub trait SessionPersistence: Send + Sync {
    fn load(&self) -> Result<Vec<SessionRecord>>;
    fn save(&self, records: &[SessionRecord]) -> Result<()>;
}
