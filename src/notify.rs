//! Default attention notifier.

use tracing::info;

use crate::collaborators::AttentionNotifier;

/// Emits a log event per attention transition. Front ends with a real
/// notification center supply their own [`AttentionNotifier`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl AttentionNotifier for LogNotifier {
    fn notify_attention(&self, session_id: &str, repo_name: &str) {
        info!(session_id = %session_id, repo = %repo_name, "Session needs attention");
    }
}
