//! Crash-safe schema migration.
//!
//! Each step follows backup-then-transform-then-promote:
//!
//! 1. write `MIGRATING(v, v+1)` to the state file (the durability barrier),
//! 2. copy the session log verbatim to the backup file,
//! 3. transform the log and replace it atomically,
//! 4. write `READY(v+1)` and delete the backup.
//!
//! A failure after step 1 leaves the state at `MIGRATING`. The next
//! [`MigrationEngine::run`] observes that and recovers before doing anything
//! else: from the backup when one exists, otherwise by trusting the current
//! log if it still parses.

use std::collections::BTreeMap;
use std::path::Path;

use machina_storage_core::{
    migration_id, MigrationOutcome, MigrationPlan, MigrationResult, SchemaState,
    SchemaStatusReport, SessionRecord, StorageError, CHECKSUM_SCHEMA_VERSION,
    CURRENT_SCHEMA_VERSION, MIN_SCHEMA_VERSION,
};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::fsio;
use crate::paths::StoragePaths;
use crate::session_log;
use crate::state::SchemaStateStore;

const NO_BACKUP_INVALID_DATA: &str =
    "cannot recover without backup because session data is invalid";

/// A pure, deterministic rewrite of every record for one schema step.
pub type MigrationTransform = fn(Vec<SessionRecord>) -> Result<Vec<SessionRecord>, StorageError>;

/// Lookup table from migration id (`v{n}-to-v{n+1}`) to its transform.
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    transforms: BTreeMap<String, MigrationTransform>,
}

impl MigrationRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self { transforms: BTreeMap::new() }
    }

    /// Every transform shipped with this crate.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(1, attach_checksums);
        registry
    }

    /// Register the transform for `from_version -> from_version + 1`, replacing any previous one.
    pub fn register(&mut self, from_version: u32, transform: MigrationTransform) -> &mut Self {
        self.transforms.insert(migration_id(from_version), transform);
        self
    }

    #[must_use]
    pub fn resolve(&self, migration_id: &str) -> Option<MigrationTransform> {
        self.transforms.get(migration_id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.transforms.keys().map(String::as_str)
    }
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// v1 -> v2: every record gains a checksum over its canonical content.
fn attach_checksums(records: Vec<SessionRecord>) -> Result<Vec<SessionRecord>, StorageError> {
    records.into_iter().map(|record| record.normalized_for(CHECKSUM_SCHEMA_VERSION)).collect()
}

fn pending_ids(from_version: u32, to_version: u32) -> Vec<String> {
    (from_version..to_version).map(migration_id).collect()
}

#[derive(Debug, Clone)]
pub struct MigrationEngine {
    paths: StoragePaths,
    registry: MigrationRegistry,
    latest_version: u32,
}

impl MigrationEngine {
    #[must_use]
    pub fn new(paths: StoragePaths) -> Self {
        Self { paths, registry: MigrationRegistry::builtin(), latest_version: CURRENT_SCHEMA_VERSION }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: MigrationRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Highest schema version this engine migrates to; fresh stores start here.
    #[must_use]
    pub fn with_latest_version(mut self, latest_version: u32) -> Self {
        self.latest_version = latest_version;
        self
    }

    #[must_use]
    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    #[must_use]
    pub fn latest_version(&self) -> u32 {
        self.latest_version
    }

    #[must_use]
    pub fn state_store(&self) -> SchemaStateStore {
        SchemaStateStore::new(self.paths.clone()).with_initial_version(self.latest_version)
    }

    /// Bring the store to `target_version` (default: latest), recovering an
    /// interrupted migration first.
    ///
    /// # Errors
    /// - [`StorageError::RecoveryFailed`] when an interrupted migration cannot be resolved.
    /// - [`StorageError::TargetUnsupported`] / [`StorageError::DowngradeBlocked`] for bad targets.
    /// - [`StorageError::PathMissing`] when a step has no registered transform.
    /// - [`StorageError::MigrationFailed`] when a step fails after its durability
    ///   barrier and before promotion; the state is left `MIGRATING` for the
    ///   next run to recover.
    pub async fn run(&self, target_version: Option<u32>) -> Result<MigrationResult, StorageError> {
        let store = self.state_store();
        store.initialize_if_missing().await?;

        let mut state = store.read().await?;
        let recovered = state.is_migrating();
        if recovered {
            state = self.recover(&store, &state).await?;
        } else {
            self.discard_stale_backup().await?;
        }

        let from_version = state.schema_version;
        let target = self.validate_target(from_version, target_version)?;

        let mut applied = Vec::new();
        for version in from_version..target {
            let id = migration_id(version);
            let transform =
                self.registry.resolve(&id).ok_or_else(|| StorageError::PathMissing {
                    migration_id: id.clone(),
                })?;

            let barrier =
                SchemaState::migrating(version, self.paths.backup.clone(), OffsetDateTime::now_utc());
            store.write(&barrier).await?;
            info!(migration_id = %id, "migration step started");

            self.apply_step(&store, version, transform).await.map_err(|source| {
                StorageError::MigrationFailed { migration_id: id.clone(), source: Box::new(source) }
            })?;

            info!(migration_id = %id, schema_version = version + 1, "migration step promoted");
            // Promotion already landed; a leftover backup is removed by the next run.
            if let Err(err) = fsio::remove_if_exists(&self.paths.backup).await {
                warn!(migration_id = %id, error = %err, "backup cleanup after promotion failed");
            }
            applied.push(id);
        }

        let status =
            if applied.is_empty() { MigrationOutcome::UpToDate } else { MigrationOutcome::Migrated };
        Ok(MigrationResult { status, from_version, to_version: target, recovered, applied })
    }

    /// Report what [`Self::run`] would do without touching the disk.
    ///
    /// # Errors
    /// Returns the same validation errors as [`Self::run`], plus
    /// [`StorageError::SchemaStateInvalid`] for an unreadable state file.
    pub async fn plan(&self, target_version: Option<u32>) -> Result<MigrationPlan, StorageError> {
        let state = self.current_state().await?;
        let from_version = state.schema_version;
        let target = self.validate_target(from_version, target_version)?;

        let pending = pending_ids(from_version, target);
        if let Some(missing) = pending.iter().find(|id| self.registry.resolve(id).is_none()) {
            return Err(StorageError::PathMissing { migration_id: missing.clone() });
        }

        Ok(MigrationPlan {
            from_version,
            status: state.status,
            to_version: target,
            recovery_required: state.is_migrating(),
            pending,
        })
    }

    /// Run only the recovery protocol. Returns whether an interrupted migration was found.
    ///
    /// # Errors
    /// Returns [`StorageError::RecoveryFailed`] when recovery is not possible.
    pub async fn recover_if_needed(&self) -> Result<bool, StorageError> {
        let store = self.state_store();
        store.initialize_if_missing().await?;
        let state = store.read().await?;
        if !state.is_migrating() {
            self.discard_stale_backup().await?;
            return Ok(false);
        }
        self.recover(&store, &state).await?;
        Ok(true)
    }

    /// Read-only snapshot of the schema state.
    ///
    /// # Errors
    /// Returns an error when the state file exists but cannot be read or parsed.
    pub async fn schema_status(&self) -> Result<SchemaStatusReport, StorageError> {
        let state = self.current_state().await?;
        let backup = state.backup_path.as_deref().unwrap_or(&self.paths.backup);
        let backup_present = fsio::exists(backup).await?;

        Ok(SchemaStatusReport {
            schema_version: state.schema_version,
            status: state.status,
            target_version: state.target_version,
            migration_id: state.migration_id.clone(),
            latest_version: self.latest_version,
            pending_migrations: pending_ids(state.schema_version, self.latest_version),
            backup_present,
        })
    }

    async fn current_state(&self) -> Result<SchemaState, StorageError> {
        Ok(self
            .state_store()
            .read_optional()
            .await?
            .unwrap_or_else(|| SchemaState::ready(self.latest_version, OffsetDateTime::UNIX_EPOCH)))
    }

    fn validate_target(&self, current: u32, target: Option<u32>) -> Result<u32, StorageError> {
        let target = target.unwrap_or(self.latest_version);
        if !(MIN_SCHEMA_VERSION..=self.latest_version).contains(&target) {
            return Err(StorageError::TargetUnsupported { target, latest: self.latest_version });
        }
        if target < current {
            return Err(StorageError::DowngradeBlocked { current, target });
        }
        Ok(target)
    }

    async fn apply_step(
        &self,
        store: &SchemaStateStore,
        from_version: u32,
        transform: MigrationTransform,
    ) -> Result<(), StorageError> {
        let pre_image = fsio::read_optional(&self.paths.sessions).await?.unwrap_or_default();
        fsio::atomic_write(&self.paths.backup, &pre_image).await?;

        let records = session_log::parse_session_log(&pre_image)?
            .into_iter()
            .map(|numbered| numbered.record)
            .collect();
        let transformed = transform(records)?;
        session_log::write_records(&self.paths.sessions, &transformed).await?;

        store.write(&SchemaState::ready(from_version + 1, OffsetDateTime::now_utc())).await
    }

    /// A backup beside a READY state is left over from a crash between promotion and cleanup.
    async fn discard_stale_backup(&self) -> Result<(), StorageError> {
        if fsio::remove_if_exists(&self.paths.backup).await? {
            info!(backup = %self.paths.backup.display(), "removed backup left by a promoted migration");
        }
        Ok(())
    }

    /// Resolve a `MIGRATING` state back to `READY` at the pre-migration version.
    async fn recover(
        &self,
        store: &SchemaStateStore,
        state: &SchemaState,
    ) -> Result<SchemaState, StorageError> {
        let backup_path = state.backup_path.as_deref();
        let backup = match backup_path {
            Some(path) => fsio::read_optional(path).await.map_err(recovery_failed)?,
            None => None,
        };

        let ready = SchemaState::ready(state.schema_version, OffsetDateTime::now_utc());
        match (backup_path, backup) {
            (Some(path), Some(pre_image)) => {
                info!(
                    migration_id = state.migration_id.as_deref().unwrap_or_default(),
                    backup = %path.display(),
                    "restoring session log from migration backup"
                );
                fsio::atomic_write(&self.paths.sessions, &pre_image)
                    .await
                    .map_err(recovery_failed)?;
                store.write(&ready).await.map_err(recovery_failed)?;
                fsio::remove_if_exists(path).await.map_err(recovery_failed)?;
            }
            _ => {
                self.verify_log_without_backup().await?;
                info!(
                    migration_id = state.migration_id.as_deref().unwrap_or_default(),
                    "no migration backup; current session log parses, resetting to ready"
                );
                store.write(&ready).await.map_err(recovery_failed)?;
            }
        }

        Ok(ready)
    }

    async fn verify_log_without_backup(&self) -> Result<(), StorageError> {
        match session_log::read_numbered(&self.paths.sessions).await {
            Ok(_) => Ok(()),
            Err(StorageError::SessionParseFailed { .. }) => {
                Err(StorageError::RecoveryFailed(NO_BACKUP_INVALID_DATA.to_string()))
            }
            Err(other) => Err(recovery_failed(other)),
        }
    }
}

fn recovery_failed(err: StorageError) -> StorageError {
    StorageError::RecoveryFailed(err.to_string())
}

/// Convenience for callers holding only a root directory.
#[must_use]
pub fn engine_for_root(root: &Path) -> MigrationEngine {
    MigrationEngine::new(StoragePaths::under(root))
}
