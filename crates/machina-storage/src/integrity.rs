use machina_storage_core::{
    IntegrityIssue, IntegrityIssueCode, IntegrityReport, SchemaState, StorageError,
    CHECKSUM_SCHEMA_VERSION,
};
use time::OffsetDateTime;

use crate::paths::StoragePaths;
use crate::session_log::{self, NumberedRecord};
use crate::state::SchemaStateStore;

/// Validate every record of the session log. Never writes.
///
/// A store without a state file is checked as a fresh store at `latest_version`.
///
/// # Errors
/// Returns [`StorageError::SchemaStateInvalid`] for an unreadable state file and
/// [`StorageError::SessionParseFailed`] when a log line does not parse.
pub async fn check_integrity(
    paths: &StoragePaths,
    latest_version: u32,
) -> Result<IntegrityReport, StorageError> {
    let state = SchemaStateStore::new(paths.clone())
        .read_optional()
        .await?
        .unwrap_or_else(|| SchemaState::ready(latest_version, OffsetDateTime::UNIX_EPOCH));
    let records = session_log::read_numbered(&paths.sessions).await?;
    let issues = inspect_records(state.schema_version, &records)?;
    Ok(IntegrityReport::from_issues(state.schema_version, issues))
}

/// # Errors
/// Returns [`StorageError::Serialization`] when a checksum cannot be recomputed.
pub fn inspect_records(
    schema_version: u32,
    records: &[NumberedRecord],
) -> Result<Vec<IntegrityIssue>, StorageError> {
    let mut issues = Vec::new();
    for NumberedRecord { line, record } in records {
        let issue = |code: IntegrityIssueCode, message: &str| IntegrityIssue {
            line: *line,
            code,
            record_id: record.id.clone(),
            message: message.to_string(),
        };

        if record.id.trim().is_empty() {
            issues.push(issue(IntegrityIssueCode::SessionIdEmpty, "session id is empty"));
        }
        if record.updated_at.trim().is_empty() {
            issues.push(issue(IntegrityIssueCode::SessionUpdatedAtEmpty, "updatedAt is empty"));
        }

        if schema_version < CHECKSUM_SCHEMA_VERSION {
            continue;
        }
        match &record.checksum {
            None => issues.push(issue(IntegrityIssueCode::ChecksumMissing, "checksum is missing")),
            Some(stored) if *stored != record.compute_checksum()? => issues.push(issue(
                IntegrityIssueCode::ChecksumInvalid,
                "checksum does not match record content",
            )),
            Some(_) => {}
        }
    }
    Ok(issues)
}
