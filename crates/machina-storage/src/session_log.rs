//! Line-delimited session log I/O.
//!
//! Blank lines are skipped but still counted, so reported line numbers match
//! what an editor shows for the file.

use std::collections::HashMap;
use std::path::Path;

use machina_storage_core::{SessionRecord, StorageError};

use crate::fsio;

/// A parsed record and the 1-indexed physical line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberedRecord {
    pub line: usize,
    pub record: SessionRecord,
}

/// Parse raw log bytes.
///
/// # Errors
/// Returns [`StorageError::SessionParseFailed`] for the first line that is not
/// valid UTF-8 or not a valid session record.
pub fn parse_session_log(bytes: &[u8]) -> Result<Vec<NumberedRecord>, StorageError> {
    let content = std::str::from_utf8(bytes).map_err(|err| {
        let valid = &bytes[..err.valid_up_to()];
        let line = valid.iter().filter(|byte| **byte == b'\n').count() + 1;
        StorageError::SessionParseFailed { line, reason: format!("invalid UTF-8: {err}") }
    })?;

    let mut records = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let line = index + 1;
        records.push(NumberedRecord { line, record: SessionRecord::from_line(trimmed, line)? });
    }
    Ok(records)
}

/// Encode records as one JSON object per line, each newline-terminated.
///
/// # Errors
/// Returns [`StorageError::Serialization`] when a record cannot be encoded.
pub fn encode_session_log(records: &[SessionRecord]) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(record.to_line()?.as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}

/// Read and parse the log at `path`; a missing file is an empty log.
///
/// # Errors
/// Returns [`StorageError::Io`] on read failure and
/// [`StorageError::SessionParseFailed`] on malformed content.
pub async fn read_numbered(path: &Path) -> Result<Vec<NumberedRecord>, StorageError> {
    match fsio::read_optional(path).await? {
        Some(bytes) => parse_session_log(&bytes),
        None => Ok(Vec::new()),
    }
}

/// # Errors
/// See [`read_numbered`].
pub async fn read_records(path: &Path) -> Result<Vec<SessionRecord>, StorageError> {
    Ok(read_numbered(path).await?.into_iter().map(|numbered| numbered.record).collect())
}

/// Atomically rewrite the whole log at `path`.
///
/// # Errors
/// Returns an error when encoding or the atomic replace fails.
pub async fn write_records(path: &Path, records: &[SessionRecord]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fsio::ensure_dir(parent).await?;
    }
    fsio::atomic_write(path, &encode_session_log(records)?).await
}

/// Append records after the existing content, replacing the file atomically.
///
/// Existing bytes are kept verbatim; a missing trailing newline is added first.
///
/// # Errors
/// Returns an error when reading, encoding, or the atomic replace fails.
pub async fn append_records(path: &Path, records: &[SessionRecord]) -> Result<(), StorageError> {
    let mut bytes = fsio::read_optional(path).await?.unwrap_or_default();
    if bytes.last().is_some_and(|last| *last != b'\n') {
        bytes.push(b'\n');
    }
    bytes.extend_from_slice(&encode_session_log(records)?);

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fsio::ensure_dir(parent).await?;
    }
    fsio::atomic_write(path, &bytes).await
}

/// Last-write-wins view: one record per id, positioned where its final
/// occurrence sits in the log.
#[must_use]
pub fn latest_by_id(records: Vec<SessionRecord>) -> Vec<SessionRecord> {
    let mut last_index: HashMap<String, usize> = HashMap::new();
    for (index, record) in records.iter().enumerate() {
        last_index.insert(record.id.clone(), index);
    }

    records
        .into_iter()
        .enumerate()
        .filter(|(index, record)| last_index.get(&record.id) == Some(index))
        .map(|(_, record)| record)
        .collect()
}
