use machina_storage_core::{SchemaState, StorageError, CURRENT_SCHEMA_VERSION};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;

use crate::fsio;
use crate::paths::StoragePaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InitializeOutcome {
    pub created_state: bool,
    pub created_log: bool,
}

/// Reader/writer for `schema-state.json`.
#[derive(Debug, Clone)]
pub struct SchemaStateStore {
    paths: StoragePaths,
    initial_version: u32,
}

impl SchemaStateStore {
    #[must_use]
    pub fn new(paths: StoragePaths) -> Self {
        Self { paths, initial_version: CURRENT_SCHEMA_VERSION }
    }

    /// Version written into a freshly initialized state file.
    #[must_use]
    pub fn with_initial_version(mut self, version: u32) -> Self {
        self.initial_version = version;
        self
    }

    #[must_use]
    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// # Errors
    /// Returns [`StorageError::Io`] when the state file cannot be read (including
    /// when it is missing) and [`StorageError::SchemaStateInvalid`] when it does
    /// not parse.
    pub async fn read(&self) -> Result<SchemaState, StorageError> {
        let path = &self.paths.schema_state;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| StorageError::io(format!("failed to read {}", path.display()), err))?;
        self.parse(&bytes)
    }

    /// # Errors
    /// Returns [`StorageError::Io`] when existence cannot be determined.
    pub async fn exists(&self) -> Result<bool, StorageError> {
        fsio::exists(&self.paths.schema_state).await
    }

    /// Like [`Self::read`], but a missing state file yields `None`.
    ///
    /// # Errors
    /// Returns [`StorageError::SchemaStateInvalid`] when the file exists but does not parse.
    pub async fn read_optional(&self) -> Result<Option<SchemaState>, StorageError> {
        match fsio::read_optional(&self.paths.schema_state).await? {
            Some(bytes) => self.parse(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn parse(&self, bytes: &[u8]) -> Result<SchemaState, StorageError> {
        let path = self.paths.schema_state.display();
        let value = serde_json::from_slice(bytes)
            .map_err(|err| StorageError::SchemaStateInvalid(format!("{path}: {err}")))?;
        SchemaState::from_json_value(value).map_err(|err| match err {
            StorageError::SchemaStateInvalid(reason) => {
                StorageError::SchemaStateInvalid(format!("{path}: {reason}"))
            }
            other => other,
        })
    }

    /// Atomically replace the state file with a pretty-printed `state`.
    ///
    /// # Errors
    /// Returns an error when serialization or the atomic replace fails.
    pub async fn write(&self, state: &SchemaState) -> Result<(), StorageError> {
        let mut bytes = serde_json::to_vec_pretty(state)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        bytes.push(b'\n');
        fsio::atomic_write(&self.paths.schema_state, &bytes).await?;
        debug!(
            schema_version = state.schema_version,
            status = %state.status,
            "schema state written"
        );
        Ok(())
    }

    /// Create the storage directory, a `READY` state file, and an empty session
    /// log, each only if absent.
    ///
    /// # Errors
    /// Returns an error when the directory or either file cannot be created.
    pub async fn initialize_if_missing(&self) -> Result<InitializeOutcome, StorageError> {
        fsio::ensure_dir(&self.paths.root).await?;

        let created_state = !self.exists().await?;
        if created_state {
            self.write(&SchemaState::ready(self.initial_version, OffsetDateTime::now_utc())).await?;
        }

        let created_log = !fsio::exists(&self.paths.sessions).await?;
        if created_log {
            fsio::atomic_write(&self.paths.sessions, b"").await?;
        }

        if created_state || created_log {
            debug!(root = %self.paths.root.display(), created_state, created_log, "storage initialized");
        }
        Ok(InitializeOutcome { created_state, created_log })
    }
}
