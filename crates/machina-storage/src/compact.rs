use machina_storage_core::{CompactionReport, SessionRecord, StorageError};
use tracing::info;

use crate::migrate::MigrationEngine;
use crate::session_log;

/// Collapse the log to one live record per id, renormalized for `schema_version`.
///
/// # Errors
/// Returns [`StorageError::Serialization`] when a checksum cannot be computed.
pub fn compact_records(
    records: Vec<SessionRecord>,
    schema_version: u32,
) -> Result<Vec<SessionRecord>, StorageError> {
    session_log::latest_by_id(records)
        .into_iter()
        .filter(|record| !record.is_tombstone())
        .map(|record| record.normalized_for(schema_version))
        .collect()
}

/// Deduplicate, drop tombstones, and atomically rewrite the session log.
///
/// An interrupted migration is recovered first so compaction always works on
/// pre-migration or fully promoted content; the report says whether that happened.
///
/// # Errors
/// Returns an error when recovery fails, the log does not parse, or the rewrite fails.
pub async fn compact(engine: &MigrationEngine) -> Result<CompactionReport, StorageError> {
    let recovered = engine.recover_if_needed().await?;
    let state = engine.state_store().read().await?;
    let sessions = &engine.paths().sessions;

    let records = session_log::read_records(sessions).await?;
    let before = records.len();
    let survivors = compact_records(records, state.schema_version)?;
    let after = survivors.len();
    session_log::write_records(sessions, &survivors).await?;

    info!(before, after, recovered, schema_version = state.schema_version, "session log compacted");
    Ok(CompactionReport { before, after, removed: before - after, recovered })
}
