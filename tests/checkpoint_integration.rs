//! Integration tests for checkpoint persistence on disk and in SQLite.

use std::sync::Arc;

use docfetch_core::checkpoint::{
    CheckpointRecord, CheckpointStatus, CheckpointStore, FileBackend,
};
use docfetch_core::db::Database;
use docfetch_core::queue::DedupKey;
use tempfile::TempDir;

fn record_after(processed: u64) -> CheckpointRecord {
    let mut record = CheckpointRecord::new(1_700_000_000_000);
    record.total = 10_000;
    record.processed = processed;
    record.successful = processed - processed / 10;
    record.failed = processed / 10;
    record.current_batch = processed / 50;
    record.last_checkpoint = record.start_time + processed;
    record.last_marker = Some(format!("key-{processed}"));
    record.completed_keys = (0..record.successful)
        .map(|i| DedupKey::for_url(&format!("https://docs.test/{i}.pdf")))
        .collect();
    record
}

#[tokio::test]
async fn test_file_checkpoint_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("job.checkpoint.json");

    CheckpointStore::file(&path)
        .save(&record_after(120))
        .await
        .unwrap();

    // A fresh store, as a restarted process would build
    let reopened = CheckpointStore::file(&path);
    let resumed = reopened.load_for_resume().await.unwrap().unwrap();
    assert_eq!(resumed, record_after(120));
    assert_eq!(resumed.status, CheckpointStatus::Running);
}

#[tokio::test]
async fn test_reader_never_sees_partial_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("job.json");
    let store = CheckpointStore::file(&path);
    store.save(&record_after(0)).await.unwrap();

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for processed in (50..=2_000).step_by(50) {
                store.save(&record_after(processed)).await.unwrap();
            }
        })
    };
    let reader = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut reads = 0;
            for _ in 0..200 {
                let record = store.load().await.unwrap().unwrap();
                store.validate(&record).unwrap();
                reads += 1;
                tokio::task::yield_now().await;
            }
            reads
        })
    };

    writer.await.unwrap();
    assert_eq!(reader.await.unwrap(), 200);
    assert_eq!(store.load().await.unwrap().unwrap(), record_after(2_000));

    // Only the checkpoint itself remains, no temp files
    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["job.json".to_string()]);
}

#[tokio::test]
async fn test_interrupted_save_leaves_previous_checkpoint_loadable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("job.json");
    let store = CheckpointStore::file(&path);
    store.save(&record_after(100)).await.unwrap();

    // A process that died mid-save leaves its half-written temp file behind
    let full = serde_json::to_vec(&record_after(150)).unwrap();
    let stale = dir.path().join("job.json.999999999.tmp");
    std::fs::write(&stale, &full[..full.len() / 2]).unwrap();

    assert_eq!(store.load().await.unwrap().unwrap(), record_after(100));
    assert_eq!(
        store.load_for_resume().await.unwrap().unwrap(),
        record_after(100)
    );

    store.save(&record_after(200)).await.unwrap();
    assert!(!stale.exists());
    assert_eq!(store.load().await.unwrap().unwrap(), record_after(200));
}

#[tokio::test]
async fn test_overflowing_counters_are_invalidated_not_resumed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("job.json");
    let backend = FileBackend::new(&path);
    let invalid_path = backend.invalid_path();
    let store = CheckpointStore::new(Arc::new(backend));

    let mut record = CheckpointRecord::new(1_700_000_000_000);
    record.total = u64::MAX;
    record.successful = u64::MAX;
    record.failed = 1;
    record.processed = 0;
    std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

    assert!(store.load_for_resume().await.unwrap().is_none());
    assert!(!path.exists());
    let set_aside: CheckpointRecord =
        serde_json::from_slice(&std::fs::read(invalid_path).unwrap()).unwrap();
    assert_eq!(set_aside.status, CheckpointStatus::Invalidated);
    assert!(set_aside.invalid_reason.unwrap().contains("processed"));
}

#[tokio::test]
async fn test_corrupt_file_is_invalidated_and_job_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("job.json");
    std::fs::write(&path, b"{\"schema_version\": 1, \"total\": ").unwrap();

    let backend = FileBackend::new(&path);
    let invalid_path = backend.invalid_path();
    let store = CheckpointStore::new(Arc::new(backend));

    assert!(store.load_for_resume().await.unwrap().is_none());
    assert!(!path.exists());
    assert!(invalid_path.exists());

    // Next save starts a new checkpoint in the usual place
    store.save(&record_after(10)).await.unwrap();
    assert!(path.exists());
}

#[tokio::test]
async fn test_inconsistent_record_is_rejected_with_reason() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("job.json");
    let backend = FileBackend::new(&path);
    let invalid_path = backend.invalid_path();
    let store = CheckpointStore::new(Arc::new(backend));

    let mut record = record_after(100);
    record.failed += 1;
    store.save(&record).await.unwrap();

    assert!(store.load_for_resume().await.unwrap().is_none());
    let set_aside: CheckpointRecord =
        serde_json::from_slice(&std::fs::read(invalid_path).unwrap()).unwrap();
    assert_eq!(set_aside.status, CheckpointStatus::Invalidated);
    assert!(set_aside.invalid_reason.is_some());
}

#[tokio::test]
async fn test_completed_checkpoint_is_not_resumed() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::file(dir.path().join("job.json"));

    let mut record = record_after(1_000);
    store.mark_completed(&mut record).await.unwrap();

    assert!(store.load_for_resume().await.unwrap().is_none());
    let stored = store.load().await.unwrap().unwrap();
    assert_eq!(stored.status, CheckpointStatus::Completed);
}

#[tokio::test]
async fn test_sqlite_checkpoints_are_keyed_by_job() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("docfetch.db");
    let db = Database::new(&db_path).await.unwrap();

    let nightly = CheckpointStore::sqlite(db.clone(), "nightly");
    let backfill = CheckpointStore::sqlite(db.clone(), "backfill");
    nightly.save(&record_after(50)).await.unwrap();
    nightly.save(&record_after(100)).await.unwrap();
    backfill.save(&record_after(400)).await.unwrap();
    db.close().await;

    let db = Database::new(&db_path).await.unwrap();
    let nightly = CheckpointStore::sqlite(db.clone(), "nightly");
    let backfill = CheckpointStore::sqlite(db.clone(), "backfill");
    assert_eq!(
        nightly.load_for_resume().await.unwrap().unwrap(),
        record_after(100)
    );
    assert_eq!(backfill.load().await.unwrap().unwrap().processed, 400);

    nightly.invalidate("operator reset").await.unwrap();
    assert!(nightly.load().await.unwrap().is_none());
    assert!(backfill.load().await.unwrap().is_some());
}
