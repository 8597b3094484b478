use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::Result;
use machina_storage::{
    append_session_records, check_session_integrity, compact_sessions, ensure_storage_initialized,
    read_session_records, run_migrations, write_session_records, MigrationEngine,
    MigrationOptions, MigrationRegistry, SchemaState, SchemaStateStore, SessionRecord,
    StorageEnv, StorageError, StoragePaths,
};
use machina_storage_core::{MigrationOutcome, StateStatus};
use serde_json::json;
use tempfile::TempDir;
use time::OffsetDateTime;

fn isolated_env() -> StorageEnv {
    StorageEnv { storage_root: None, home_dir: None }
}

fn options(root: &Path, target_version: Option<u32>) -> MigrationOptions {
    MigrationOptions { root_override: Some(root.to_path_buf()), target_version }
}

fn fixture_records() -> Vec<SessionRecord> {
    vec![
        SessionRecord::new("session-1", "2026-02-11T00:00:00.000Z", json!({ "topic": "alpha" })),
        SessionRecord::new("session-2", "2026-02-11T01:00:00.000Z", json!({ "topic": "beta", "n": 2 })),
        SessionRecord::new("session-1", "2026-02-11T02:00:00.000Z", json!({ "topic": "alpha-2" })),
    ]
}

async fn seed_v1(root: &Path, records: &[SessionRecord]) -> Result<StoragePaths> {
    let paths = ensure_storage_initialized(Some(root), &isolated_env()).await?;
    SchemaStateStore::new(paths.clone())
        .write(&SchemaState::ready(1, OffsetDateTime::UNIX_EPOCH))
        .await?;
    write_session_records(&paths, records).await?;
    Ok(paths)
}

/// Session log bytes after an uninterrupted migration of `records` to v2.
async fn reference_log(records: &[SessionRecord]) -> Result<Vec<u8>> {
    let temp = TempDir::new()?;
    let paths = seed_v1(temp.path(), records).await?;
    run_migrations(&options(temp.path(), Some(2)), &isolated_env()).await?;
    Ok(fs::read(&paths.sessions)?)
}

async fn write_barrier(paths: &StoragePaths, backup: Option<&Path>) -> Result<()> {
    let mut state = SchemaState::migrating(1, paths.backup.clone(), OffsetDateTime::UNIX_EPOCH);
    state.backup_path = backup.map(Path::to_path_buf);
    SchemaStateStore::new(paths.clone()).write(&state).await?;
    Ok(())
}

#[tokio::test]
async fn seeded_session_gains_checksum_on_migration() -> Result<()> {
    let temp = TempDir::new()?;
    let record =
        SessionRecord::new("session-1", "2026-02-11T00:00:00.000Z", json!({ "topic": "alpha" }));
    let paths = seed_v1(temp.path(), &[record]).await?;

    let result = run_migrations(&options(temp.path(), Some(2)), &isolated_env()).await?;
    assert_eq!(result.status, MigrationOutcome::Migrated);
    assert_eq!(result.from_version, 1);
    assert_eq!(result.to_version, 2);
    assert_eq!(result.applied, vec!["v1-to-v2".to_string()]);
    assert!(!result.recovered);

    let records = read_session_records(&paths.sessions).await?;
    assert_eq!(records.len(), 1);
    let checksum = records[0].checksum.clone().unwrap_or_default();
    assert_eq!(checksum.len(), 64);
    assert!(checksum.chars().all(|ch| ch.is_ascii_hexdigit()));
    Ok(())
}

#[tokio::test]
async fn second_run_is_up_to_date_and_byte_identical() -> Result<()> {
    let temp = TempDir::new()?;
    let paths = seed_v1(temp.path(), &fixture_records()).await?;

    run_migrations(&options(temp.path(), None), &isolated_env()).await?;
    let log_after_first = fs::read(&paths.sessions)?;
    let state_after_first = fs::read(&paths.schema_state)?;

    let second = run_migrations(&options(temp.path(), None), &isolated_env()).await?;
    assert_eq!(second.status, MigrationOutcome::UpToDate);
    assert!(second.applied.is_empty());
    assert_eq!(fs::read(&paths.sessions)?, log_after_first);
    assert_eq!(fs::read(&paths.schema_state)?, state_after_first);
    Ok(())
}

#[tokio::test]
async fn crash_right_after_barrier_recovers_to_same_content() -> Result<()> {
    let temp = TempDir::new()?;
    let paths = seed_v1(temp.path(), &fixture_records()).await?;
    // Barrier landed, process died before the backup copy.
    write_barrier(&paths, Some(paths.backup.as_path())).await?;

    let result = run_migrations(&options(temp.path(), None), &isolated_env()).await?;
    assert!(result.recovered);
    assert_eq!(result.applied, vec!["v1-to-v2".to_string()]);
    assert_eq!(fs::read(&paths.sessions)?, reference_log(&fixture_records()).await?);
    assert!(!paths.backup.exists());
    Ok(())
}

#[tokio::test]
async fn crash_after_transform_restores_backup_and_redoes_step() -> Result<()> {
    let temp = TempDir::new()?;
    let paths = seed_v1(temp.path(), &fixture_records()).await?;
    fs::copy(&paths.sessions, &paths.backup)?;
    write_barrier(&paths, Some(paths.backup.as_path())).await?;
    // The log was already rewritten with a divergent transform when the crash hit.
    let half_done =
        vec![SessionRecord::new("session-9", "2026-01-01T00:00:00.000Z", json!("partial"))];
    write_session_records(&paths, &half_done).await?;

    let result = run_migrations(&options(temp.path(), None), &isolated_env()).await?;
    assert!(result.recovered);
    assert_eq!(fs::read(&paths.sessions)?, reference_log(&fixture_records()).await?);

    let state = SchemaStateStore::new(paths.clone()).read().await?;
    assert_eq!(state.status, StateStatus::Ready);
    assert_eq!(state.schema_version, 2);
    assert!(!paths.backup.exists());
    Ok(())
}

#[tokio::test]
async fn injected_transform_failure_then_rerun_matches_uninterrupted_run() -> Result<()> {
    fn explode(_: Vec<SessionRecord>) -> Result<Vec<SessionRecord>, StorageError> {
        Err(StorageError::Serialization("disk full".to_string()))
    }

    let temp = TempDir::new()?;
    let paths = seed_v1(temp.path(), &fixture_records()).await?;

    let mut failing = MigrationRegistry::empty();
    failing.register(1, explode);
    let first = MigrationEngine::new(paths.clone()).with_registry(failing).run(None).await;
    assert!(matches!(first, Err(ref err) if err.code() == "MIGRATION_FAILED"));

    let second = run_migrations(&options(temp.path(), None), &isolated_env()).await?;
    assert!(second.recovered);
    assert_eq!(second.status, MigrationOutcome::Migrated);
    assert_eq!(fs::read(&paths.sessions)?, reference_log(&fixture_records()).await?);
    Ok(())
}

#[tokio::test]
async fn no_backup_with_valid_log_resets_and_redoes_step() -> Result<()> {
    let temp = TempDir::new()?;
    let paths = seed_v1(temp.path(), &fixture_records()).await?;
    write_barrier(&paths, None).await?;

    let result = run_migrations(&options(temp.path(), None), &isolated_env()).await?;
    assert!(result.recovered);
    assert_eq!(result.from_version, 1);
    assert_eq!(result.applied, vec!["v1-to-v2".to_string()]);

    let state = SchemaStateStore::new(paths.clone()).read().await?;
    assert_eq!(state.status, StateStatus::Ready);
    assert_eq!(state.schema_version, 2);
    Ok(())
}

#[tokio::test]
async fn no_backup_with_invalid_log_fails_and_leaves_state_untouched() -> Result<()> {
    let temp = TempDir::new()?;
    let paths = seed_v1(temp.path(), &fixture_records()).await?;
    write_barrier(&paths, None).await?;
    fs::write(&paths.sessions, "{\"id\":\"session-1\"\nnot json at all\n")?;
    let state_before = fs::read(&paths.schema_state)?;

    let err = run_migrations(&options(temp.path(), None), &isolated_env()).await;
    let Err(err) = err else {
        panic!("recovery should fail without a backup and with invalid data");
    };
    assert_eq!(err.code(), "MIGRATION_RECOVERY_FAILED");
    assert!(err.to_string().contains("cannot recover without backup because session data is invalid"));
    assert_eq!(fs::read(&paths.schema_state)?, state_before);
    Ok(())
}

#[tokio::test]
async fn backup_path_recorded_but_file_missing_falls_back_to_parse() -> Result<()> {
    let temp = TempDir::new()?;
    let paths = seed_v1(temp.path(), &fixture_records()).await?;
    let elsewhere = temp.path().join("elsewhere.backup.jsonl");
    write_barrier(&paths, Some(elsewhere.as_path())).await?;

    let result = run_migrations(&options(temp.path(), None), &isolated_env()).await?;
    assert!(result.recovered);
    assert_eq!(result.to_version, 2);
    Ok(())
}

#[tokio::test]
async fn downgrade_is_rejected_without_mutation() -> Result<()> {
    let temp = TempDir::new()?;
    let paths = seed_v1(temp.path(), &fixture_records()).await?;
    run_migrations(&options(temp.path(), Some(2)), &isolated_env()).await?;
    let log_before = fs::read(&paths.sessions)?;
    let state_before = fs::read(&paths.schema_state)?;

    let err = run_migrations(&options(temp.path(), Some(1)), &isolated_env()).await;
    assert!(matches!(err, Err(StorageError::DowngradeBlocked { current: 2, target: 1 })));
    assert_eq!(fs::read(&paths.sessions)?, log_before);
    assert_eq!(fs::read(&paths.schema_state)?, state_before);
    Ok(())
}

#[tokio::test]
async fn migrated_store_is_healthy() -> Result<()> {
    let temp = TempDir::new()?;
    seed_v1(temp.path(), &fixture_records()).await?;

    let before = check_session_integrity(Some(temp.path()), &isolated_env()).await?;
    assert!(before.healthy);
    assert_eq!(before.schema_version, 1);

    run_migrations(&options(temp.path(), None), &isolated_env()).await?;
    let after = check_session_integrity(Some(temp.path()), &isolated_env()).await?;
    assert!(after.healthy);
    assert_eq!(after.schema_version, 2);
    assert_eq!(after.issue_count, 0);
    Ok(())
}

#[tokio::test]
async fn integrity_flags_records_appended_without_checksum() -> Result<()> {
    let temp = TempDir::new()?;
    let paths = ensure_storage_initialized(Some(temp.path()), &isolated_env()).await?;
    let good = SessionRecord::new("a", "2026-02-11T00:00:00.000Z", json!(1)).normalized_for(2)?;
    append_session_records(&paths, &[good, SessionRecord::new("", "", json!(2))]).await?;
    let log_before = fs::read(&paths.sessions)?;

    let report = check_session_integrity(Some(temp.path()), &isolated_env()).await?;
    assert!(!report.healthy);
    let codes = report.issues.iter().map(|issue| (issue.line, issue.code.as_str())).collect::<Vec<_>>();
    assert_eq!(
        codes,
        vec![(2, "SESSION_ID_EMPTY"), (2, "SESSION_UPDATED_AT_EMPTY"), (2, "CHECKSUM_MISSING")]
    );
    assert_eq!(fs::read(&paths.sessions)?, log_before);
    Ok(())
}

#[tokio::test]
async fn integrity_on_uninitialized_root_creates_nothing() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().join("never-created");
    let report = check_session_integrity(Some(&root), &isolated_env()).await?;
    assert!(report.healthy);
    assert!(!root.exists());
    Ok(())
}

#[tokio::test]
async fn compaction_is_idempotent_and_keeps_live_ids() -> Result<()> {
    let temp = TempDir::new()?;
    let paths = ensure_storage_initialized(Some(temp.path()), &isolated_env()).await?;
    let mut records = fixture_records();
    records.push(SessionRecord::new("session-3", "2026-02-11T03:00:00.000Z", json!(null)));
    records.push(SessionRecord::tombstone("session-3", "2026-02-11T04:00:00.000Z"));
    records.push(SessionRecord::tombstone("session-4", "2026-02-11T05:00:00.000Z"));
    write_session_records(&paths, &records).await?;

    let first = compact_sessions(Some(temp.path()), &isolated_env()).await?;
    assert_eq!(first.before, 6);
    assert_eq!(first.after, 2);
    assert_eq!(first.removed, 4);
    assert!(!first.recovered);
    let once = fs::read(&paths.sessions)?;

    let live = read_session_records(&paths.sessions)
        .await?
        .into_iter()
        .map(|record| record.id)
        .collect::<BTreeSet<_>>();
    assert_eq!(live, BTreeSet::from(["session-1".to_string(), "session-2".to_string()]));

    let second = compact_sessions(Some(temp.path()), &isolated_env()).await?;
    assert_eq!(second.removed, 0);
    assert_eq!(second.before, second.after);
    assert_eq!(fs::read(&paths.sessions)?, once);

    let report = check_session_integrity(Some(temp.path()), &isolated_env()).await?;
    assert!(report.healthy);
    Ok(())
}

#[tokio::test]
async fn compaction_recovers_interrupted_migration_first() -> Result<()> {
    let temp = TempDir::new()?;
    let paths = seed_v1(temp.path(), &fixture_records()).await?;
    fs::copy(&paths.sessions, &paths.backup)?;
    write_barrier(&paths, Some(paths.backup.as_path())).await?;
    write_session_records(&paths, &[]).await?;

    let report = compact_sessions(Some(temp.path()), &isolated_env()).await?;
    assert!(report.recovered);
    assert_eq!(report.before, 3);
    assert_eq!(report.after, 2);

    let state = SchemaStateStore::new(paths.clone()).read().await?;
    assert_eq!(state.status, StateStatus::Ready);
    assert_eq!(state.schema_version, 1);
    assert!(!paths.backup.exists());
    Ok(())
}

#[tokio::test]
async fn environment_root_is_used_without_override() -> Result<()> {
    let temp = TempDir::new()?;
    let env = StorageEnv { storage_root: Some(temp.path().as_os_str().to_owned()), home_dir: None };
    let paths = ensure_storage_initialized(None, &env).await?;
    assert_eq!(paths.root, temp.path());
    assert!(paths.schema_state.exists());
    assert!(paths.sessions.exists());
    Ok(())
}

#[tokio::test]
async fn unresolvable_root_reports_home_missing() {
    let result = run_migrations(&MigrationOptions::default(), &isolated_env()).await;
    assert!(matches!(result, Err(ref err) if err.code() == "STORAGE_HOME_MISSING"));
}

#[tokio::test]
async fn backup_left_beside_ready_state_is_removed_on_next_run() -> Result<()> {
    let temp = TempDir::new()?;
    let paths = seed_v1(temp.path(), &fixture_records()).await?;
    run_migrations(&options(temp.path(), None), &isolated_env()).await?;
    let log_after_promotion = fs::read(&paths.sessions)?;
    // Crash after READY(2) landed but before the backup was deleted.
    fs::write(&paths.backup, b"stale pre-image\n")?;

    let result = run_migrations(&options(temp.path(), None), &isolated_env()).await?;
    assert_eq!(result.status, MigrationOutcome::UpToDate);
    assert!(!result.recovered);
    assert!(!paths.backup.exists());
    assert_eq!(fs::read(&paths.sessions)?, log_after_promotion);

    let status = MigrationEngine::new(paths.clone()).schema_status().await?;
    assert!(!status.backup_present);
    assert_eq!(status.status, StateStatus::Ready);
    Ok(())
}
