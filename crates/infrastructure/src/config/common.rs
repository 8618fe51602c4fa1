//! Shared helpers and error types used across the config modules.

use std::path::Path;

use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(String),

    #[error("validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("invalid value '{value}' for field '{field}': expected one of {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

impl From<serde_yaml_ng::Error> for ConfigError {
    fn from(e: serde_yaml_ng::Error) -> Self {
        Self::Yaml(e.to_string())
    }
}

// ── Shared serde defaults ──────────────────────────────────────────

pub(super) fn default_true() -> bool {
    true
}

// ── File permission check ──────────────────────────────────────────

/// Log a warning if a file is world-readable (Unix only).
///
/// The config file carries the key-store password and the key container
/// carries the chain secrets; both should be mode 0640 or stricter.
#[cfg(unix)]
pub(super) fn warn_if_world_readable(path: &Path, label: &str) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode();
        if mode & 0o004 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{mode:04o}"),
                "{label} is world-readable — consider chmod 640 or stricter",
            );
        }
    }
}

#[cfg(not(unix))]
pub(super) fn warn_if_world_readable(_path: &Path, _label: &str) {
    // File permission checks not available on non-Unix platforms.
}
