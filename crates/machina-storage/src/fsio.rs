//! Filesystem primitives. Every mutation goes through [`atomic_write`] so a
//! reader sees either the old or the new content of a file, never a torn write.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use machina_storage_core::StorageError;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use ulid::Ulid;

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map_or_else(|| "storage".to_string(), |name| name.to_string_lossy().into_owned());
    let temp_name = format!(".{file_name}.{}.tmp", Ulid::new());
    match path.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

async fn write_then_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(temp_path, path).await?;
    match path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        Some(parent) => sync_dir(parent).await,
        None => sync_dir(Path::new(".")).await,
    }
}

/// Flush directory entries after a rename.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Replace `path` with `bytes` via a sibling temporary file and a rename.
///
/// # Errors
/// Returns [`StorageError::Io`] when the temporary file cannot be written or renamed.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let temp_path = temp_path_for(path);
    if let Err(err) = write_then_rename(&temp_path, path, bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io(format!("failed to replace {}", path.display()), err));
    }

    debug!(path = %path.display(), bytes = bytes.len(), "replaced file");
    Ok(())
}

/// Read a file, mapping "not found" to `None`.
///
/// # Errors
/// Returns [`StorageError::Io`] for any read failure other than a missing file.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StorageError::io(format!("failed to read {}", path.display()), err)),
    }
}

/// Delete a file if present; returns whether anything was removed.
///
/// # Errors
/// Returns [`StorageError::Io`] when the file exists but cannot be removed.
pub async fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StorageError::io(format!("failed to remove {}", path.display()), err)),
    }
}

/// # Errors
/// Returns [`StorageError::Io`] when existence cannot be determined.
pub async fn exists(path: &Path) -> Result<bool, StorageError> {
    fs::try_exists(path)
        .await
        .map_err(|err| StorageError::io(format!("failed to stat {}", path.display()), err))
}

/// # Errors
/// Returns [`StorageError::Io`] when the directory cannot be created.
pub async fn ensure_dir(path: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(path)
        .await
        .map_err(|err| StorageError::io(format!("failed to create {}", path.display()), err))
}
