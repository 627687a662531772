//! Project path validation.

use std::path::{Component, Path, PathBuf};

use super::error::RegistryError;

/// Resolve a user-supplied project path to its canonical directory.
///
/// Any `..` component is rejected, both as given and after symlink
/// resolution.
pub fn resolve_project_path(path: &Path) -> Result<PathBuf, RegistryError> {
    let invalid = |reason| RegistryError::InvalidPath {
        path: path.to_path_buf(),
        reason,
    };

    if has_parent_component(path) {
        return Err(invalid("contains a '..' component"));
    }

    let canonical = std::fs::canonicalize(path).map_err(|_| invalid("does not exist"))?;

    if !canonical.is_dir() {
        return Err(invalid("not a directory"));
    }
    if has_parent_component(&canonical) {
        return Err(invalid("resolves through a '..' component"));
    }

    Ok(canonical)
}

/// Display label for a project: its final path component.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}
