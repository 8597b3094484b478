use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// Schema version written by a fresh store and targeted by default.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Oldest schema version the engine understands.
pub const MIN_SCHEMA_VERSION: u32 = 1;

/// First schema version whose records carry a mandatory checksum.
pub const CHECKSUM_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("cannot resolve storage root: no override, no environment value, and no home directory")]
    HomeMissing,
    #[error("schema state is invalid: {0}")]
    SchemaStateInvalid(String),
    #[error("session log line {line} is invalid: {reason}")]
    SessionParseFailed { line: usize, reason: String },
    #[error(
        "target schema version {target} is unsupported; supported range is {min}..={latest}",
        min = MIN_SCHEMA_VERSION
    )]
    TargetUnsupported { target: u32, latest: u32 },
    #[error("schema version {current} is newer than requested target {target}; downgrades are not supported")]
    DowngradeBlocked { current: u32, target: u32 },
    #[error("no migration registered for {migration_id}")]
    PathMissing { migration_id: String },
    #[error("migration {migration_id} failed: {source}")]
    MigrationFailed {
        migration_id: String,
        #[source]
        source: Box<StorageError>,
    },
    #[error("migration recovery failed: {0}")]
    RecoveryFailed(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::HomeMissing => "STORAGE_HOME_MISSING",
            Self::SchemaStateInvalid(_) => "SCHEMA_STATE_INVALID",
            Self::SessionParseFailed { .. } => "SESSION_PARSE_FAILED",
            Self::TargetUnsupported { .. } => "MIGRATION_TARGET_UNSUPPORTED",
            Self::DowngradeBlocked { .. } => "MIGRATION_DOWNGRADE_BLOCKED",
            Self::PathMissing { .. } => "MIGRATION_PATH_MISSING",
            Self::MigrationFailed { .. } => "MIGRATION_FAILED",
            Self::RecoveryFailed(_) => "MIGRATION_RECOVERY_FAILED",
            Self::Io { .. } => "STORAGE_IO_FAILED",
            Self::Serialization(_) => "SERIALIZATION_FAILED",
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }
}

/// Identifier of the single-step migration that starts at `from_version`.
#[must_use]
pub fn migration_id(from_version: u32) -> String {
    format!("v{from_version}-to-v{}", from_version + 1)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateStatus {
    Ready,
    Migrating,
}

impl StateStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Migrating => "MIGRATING",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "READY" => Some(Self::Ready),
            "MIGRATING" => Some(Self::Migrating),
            _ => None,
        }
    }
}

impl Display for StateStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn epoch() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH
}

/// Persisted description of the on-disk schema and any in-flight migration step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaState {
    pub schema_version: u32,
    pub status: StateStatus,
    #[serde(default)]
    pub target_version: Option<u32>,
    #[serde(default)]
    pub migration_id: Option<String>,
    #[serde(default)]
    pub backup_path: Option<PathBuf>,
    #[serde(with = "time::serde::rfc3339", default = "epoch")]
    pub updated_at: OffsetDateTime,
}

impl SchemaState {
    #[must_use]
    pub fn ready(schema_version: u32, updated_at: OffsetDateTime) -> Self {
        Self {
            schema_version,
            status: StateStatus::Ready,
            target_version: None,
            migration_id: None,
            backup_path: None,
            updated_at,
        }
    }

    /// The durability-barrier state for the step `from_version -> from_version + 1`.
    #[must_use]
    pub fn migrating(from_version: u32, backup_path: PathBuf, updated_at: OffsetDateTime) -> Self {
        Self {
            schema_version: from_version,
            status: StateStatus::Migrating,
            target_version: Some(from_version + 1),
            migration_id: Some(migration_id(from_version)),
            backup_path: Some(backup_path),
            updated_at,
        }
    }

    #[must_use]
    pub fn is_migrating(&self) -> bool {
        self.status == StateStatus::Migrating
    }

    /// Parse a state document, rejecting structurally invalid content.
    ///
    /// Only `schemaVersion` and `status` are required; the remaining fields
    /// default to `null` (and `updatedAt` to the Unix epoch).
    ///
    /// # Errors
    /// Returns [`StorageError::SchemaStateInvalid`] when the document is not an
    /// object, `schemaVersion` is not a non-negative integer, `status` is not a
    /// known status, an optional field has the wrong shape, or the migration
    /// fields disagree with `status`.
    pub fn from_json_value(value: Value) -> Result<Self, StorageError> {
        let Value::Object(object) = &value else {
            return Err(StorageError::SchemaStateInvalid("expected a JSON object".to_string()));
        };

        let version_ok = object
            .get("schemaVersion")
            .and_then(Value::as_u64)
            .is_some_and(|version| u32::try_from(version).is_ok());
        if !version_ok {
            return Err(StorageError::SchemaStateInvalid(
                "schemaVersion must be a non-negative integer".to_string(),
            ));
        }

        let status_ok = object.get("status").and_then(Value::as_str).and_then(StateStatus::parse);
        if status_ok.is_none() {
            return Err(StorageError::SchemaStateInvalid(
                "status must be READY or MIGRATING".to_string(),
            ));
        }

        let state: Self = serde_json::from_value(value)
            .map_err(|err| StorageError::SchemaStateInvalid(err.to_string()))?;
        state.check_status_fields()?;
        Ok(state)
    }

    /// READY carries no migration fields; MIGRATING names exactly the next step.
    fn check_status_fields(&self) -> Result<(), StorageError> {
        match self.status {
            StateStatus::Ready => {
                if self.target_version.is_some()
                    || self.migration_id.is_some()
                    || self.backup_path.is_some()
                {
                    return Err(StorageError::SchemaStateInvalid(
                        "READY state must not carry targetVersion, migrationId, or backupPath"
                            .to_string(),
                    ));
                }
            }
            StateStatus::Migrating => {
                let next = self.schema_version.checked_add(1);
                if next.is_none() || self.target_version != next {
                    return Err(StorageError::SchemaStateInvalid(
                        "MIGRATING state must target schemaVersion + 1".to_string(),
                    ));
                }
                if self.migration_id.as_deref() != Some(migration_id(self.schema_version).as_str()) {
                    return Err(StorageError::SchemaStateInvalid(format!(
                        "MIGRATING state must name migration {}",
                        migration_id(self.schema_version)
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One line of the session log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub updated_at: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionRecord {
    #[must_use]
    pub fn new(id: impl Into<String>, updated_at: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            updated_at: updated_at.into(),
            payload,
            deleted: None,
            checksum: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn tombstone(id: impl Into<String>, updated_at: impl Into<String>) -> Self {
        Self { deleted: Some(true), ..Self::new(id, updated_at, Value::Null) }
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.deleted.unwrap_or(false)
    }

    /// Parse one session log line. `line` is the 1-indexed physical line number.
    ///
    /// # Errors
    /// Returns [`StorageError::SessionParseFailed`] when the line is not a JSON
    /// object or lacks a string `id` / `updatedAt`.
    pub fn from_line(raw: &str, line: usize) -> Result<Self, StorageError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| StorageError::SessionParseFailed { line, reason: err.to_string() })?;
        if !value.is_object() {
            return Err(StorageError::SessionParseFailed {
                line,
                reason: "expected a JSON object".to_string(),
            });
        }
        serde_json::from_value(value)
            .map_err(|err| StorageError::SessionParseFailed { line, reason: err.to_string() })
    }

    /// Serialize as a single log line without the trailing newline.
    ///
    /// # Errors
    /// Returns [`StorageError::Serialization`] when the payload cannot be encoded.
    pub fn to_line(&self) -> Result<String, StorageError> {
        serde_json::to_string(self).map_err(|err| StorageError::Serialization(err.to_string()))
    }

    /// Content hash over the canonical form of `(id, updatedAt, payload, deleted)`.
    ///
    /// # Errors
    /// Returns [`StorageError::Serialization`] when the canonical form cannot be encoded.
    pub fn compute_checksum(&self) -> Result<String, StorageError> {
        let content = serde_json::json!({
            "id": self.id,
            "updatedAt": self.updated_at,
            "payload": self.payload,
            "deleted": self.is_tombstone(),
        });
        let canonical = serde_json::to_string(&canonicalize(&content))
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Bring the record into the shape required by `schema_version`.
    ///
    /// # Errors
    /// Returns [`StorageError::Serialization`] when the checksum cannot be computed.
    pub fn normalized_for(mut self, schema_version: u32) -> Result<Self, StorageError> {
        self.checksum = if schema_version >= CHECKSUM_SCHEMA_VERSION {
            Some(self.compute_checksum()?)
        } else {
            None
        };
        Ok(self)
    }
}

/// Rebuild `value` with object keys sorted lexicographically at every depth.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries = object.iter().collect::<Vec<_>>();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, child) in entries {
                sorted.insert(key.clone(), canonicalize(child));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationOutcome {
    UpToDate,
    Migrated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationResult {
    pub status: MigrationOutcome,
    pub from_version: u32,
    pub to_version: u32,
    pub recovered: bool,
    pub applied: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationPlan {
    pub from_version: u32,
    pub status: StateStatus,
    pub to_version: u32,
    pub recovery_required: bool,
    pub pending: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatusReport {
    pub schema_version: u32,
    pub status: StateStatus,
    pub target_version: Option<u32>,
    pub migration_id: Option<String>,
    pub latest_version: u32,
    pub pending_migrations: Vec<String>,
    pub backup_present: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrityIssueCode {
    SessionIdEmpty,
    SessionUpdatedAtEmpty,
    ChecksumMissing,
    ChecksumInvalid,
}

impl IntegrityIssueCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionIdEmpty => "SESSION_ID_EMPTY",
            Self::SessionUpdatedAtEmpty => "SESSION_UPDATED_AT_EMPTY",
            Self::ChecksumMissing => "CHECKSUM_MISSING",
            Self::ChecksumInvalid => "CHECKSUM_INVALID",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub line: usize,
    pub code: IntegrityIssueCode,
    pub record_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub healthy: bool,
    pub schema_version: u32,
    pub issue_count: usize,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    #[must_use]
    pub fn from_issues(schema_version: u32, issues: Vec<IntegrityIssue>) -> Self {
        Self { healthy: issues.is_empty(), schema_version, issue_count: issues.len(), issues }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompactionReport {
    pub before: usize,
    pub after: usize,
    pub removed: usize,
    /// An interrupted migration was rolled back before compacting.
    pub recovered: bool,
}
