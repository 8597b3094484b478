//! File-backed session storage with crash-safe schema migrations.
//!
//! On-disk layout under the storage root:
//!
//! - `sessions.jsonl`: one session record per line, append ordered
//! - `schema-state.json`: current schema version and any in-flight migration
//! - `sessions.backup.jsonl`: pre-image of the log, present only while migrating
//!
//! The functions at the crate root are the entry points used by the CLI and
//! other collaborators; the engine types are exposed for callers that need
//! a custom migration registry.

pub mod compact;
pub mod fsio;
pub mod integrity;
pub mod migrate;
pub mod paths;
pub mod session_log;
pub mod state;

use std::path::{Path, PathBuf};

pub use machina_storage_core::{
    CompactionReport, IntegrityReport, MigrationPlan, MigrationResult, SchemaState,
    SchemaStatusReport, SessionRecord, StorageError,
};
pub use migrate::{MigrationEngine, MigrationRegistry, MigrationTransform};
pub use paths::{resolve_storage_paths, StorageEnv, StoragePaths, STORAGE_ROOT_ENV};
pub use state::{InitializeOutcome, SchemaStateStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    pub root_override: Option<PathBuf>,
    pub target_version: Option<u32>,
}

/// Resolve the storage root and create the directory, state file, and empty log if absent.
///
/// # Errors
/// Returns [`StorageError::HomeMissing`] when no root can be resolved, or an I/O
/// error when initialization fails.
pub async fn ensure_storage_initialized(
    root_override: Option<&Path>,
    env: &StorageEnv,
) -> Result<StoragePaths, StorageError> {
    let paths = resolve_storage_paths(root_override, env)?;
    SchemaStateStore::new(paths.clone()).initialize_if_missing().await?;
    Ok(paths)
}

/// Migrate the resolved store to `options.target_version` (default: latest).
///
/// # Errors
/// See [`MigrationEngine::run`].
pub async fn run_migrations(
    options: &MigrationOptions,
    env: &StorageEnv,
) -> Result<MigrationResult, StorageError> {
    let paths = resolve_storage_paths(options.root_override.as_deref(), env)?;
    MigrationEngine::new(paths).run(options.target_version).await
}

/// Read-only integrity pass over the resolved store.
///
/// # Errors
/// See [`integrity::check_integrity`].
pub async fn check_session_integrity(
    root_override: Option<&Path>,
    env: &StorageEnv,
) -> Result<IntegrityReport, StorageError> {
    let paths = resolve_storage_paths(root_override, env)?;
    integrity::check_integrity(&paths, machina_storage_core::CURRENT_SCHEMA_VERSION).await
}

/// Deduplicate and drop tombstones in the resolved store.
///
/// # Errors
/// See [`compact::compact`].
pub async fn compact_sessions(
    root_override: Option<&Path>,
    env: &StorageEnv,
) -> Result<CompactionReport, StorageError> {
    let paths = resolve_storage_paths(root_override, env)?;
    compact::compact(&MigrationEngine::new(paths)).await
}

/// Replace the whole session log of `paths` with `records`, unmodified.
///
/// # Errors
/// Returns an error when encoding or the atomic replace fails.
pub async fn write_session_records(
    paths: &StoragePaths,
    records: &[SessionRecord],
) -> Result<(), StorageError> {
    session_log::write_records(&paths.sessions, records).await
}

/// Append `records` to the session log of `paths`, unmodified.
///
/// # Errors
/// Returns an error when reading, encoding, or the atomic replace fails.
pub async fn append_session_records(
    paths: &StoragePaths,
    records: &[SessionRecord],
) -> Result<(), StorageError> {
    session_log::append_records(&paths.sessions, records).await
}

/// Read every physical record of the log at `path`; a missing file is empty.
///
/// # Errors
/// Returns [`StorageError::SessionParseFailed`] when a line does not parse.
pub async fn read_session_records(path: &Path) -> Result<Vec<SessionRecord>, StorageError> {
    session_log::read_records(path).await
}
