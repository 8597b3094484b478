use std::ffi::OsString;
use std::path::{Path, PathBuf};

use machina_storage_core::StorageError;
use serde::Serialize;

/// Environment variable naming the storage root when no explicit override is given.
pub const STORAGE_ROOT_ENV: &str = "MACHINA_STORAGE_ROOT";

pub const SESSIONS_FILE: &str = "sessions.jsonl";
pub const SCHEMA_STATE_FILE: &str = "schema-state.json";
pub const BACKUP_FILE: &str = "sessions.backup.jsonl";

const DEFAULT_ROOT_SEGMENTS: [&str; 2] = [".machina", "storage"];

/// Process inputs consulted by root resolution.
///
/// Captured once so resolution stays a pure function; tests build this directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageEnv {
    pub storage_root: Option<OsString>,
    pub home_dir: Option<PathBuf>,
}

impl StorageEnv {
    #[must_use]
    pub fn from_process() -> Self {
        Self { storage_root: std::env::var_os(STORAGE_ROOT_ENV), home_dir: dirs::home_dir() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoragePaths {
    pub root: PathBuf,
    pub sessions: PathBuf,
    pub schema_state: PathBuf,
    pub backup: PathBuf,
}

impl StoragePaths {
    #[must_use]
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            sessions: root.join(SESSIONS_FILE),
            schema_state: root.join(SCHEMA_STATE_FILE),
            backup: root.join(BACKUP_FILE),
            root,
        }
    }
}

/// Resolve the storage root: explicit override, then environment, then `<home>/.machina/storage`.
///
/// Empty overrides and empty environment values are ignored.
///
/// # Errors
/// Returns [`StorageError::HomeMissing`] when neither an override nor an
/// environment value is set and no home directory is known.
pub fn resolve_storage_paths(
    root_override: Option<&Path>,
    env: &StorageEnv,
) -> Result<StoragePaths, StorageError> {
    if let Some(root) = root_override.filter(|root| !root.as_os_str().is_empty()) {
        return Ok(StoragePaths::under(root));
    }

    if let Some(root) = env.storage_root.as_ref().filter(|root| !root.is_empty()) {
        return Ok(StoragePaths::under(PathBuf::from(root)));
    }

    let home = env.home_dir.as_ref().ok_or(StorageError::HomeMissing)?;
    let root = DEFAULT_ROOT_SEGMENTS.iter().fold(home.clone(), |path, segment| path.join(segment));
    Ok(StoragePaths::under(root))
}
