//! Errors surfaced by the control surface.

use std::path::PathBuf;

use crate::session::SessionId;

/// Structural errors from `add_session`. Everything else on the control
/// surface is a silent no-op.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid project path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: &'static str },

    #[error("project {} is already tracked as session {existing}", path.display())]
    DuplicateSession { path: PathBuf, existing: SessionId },
}
