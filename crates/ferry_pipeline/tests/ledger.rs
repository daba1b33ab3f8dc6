//! Durability and retention tests for ProcessedFileLedger

use chrono::Utc;
use ferry_pipeline::{FileFingerprint, LedgerConfig, ProcessedFileLedger, ProcessedRecord};
use filetime::{set_file_mtime, FileTime};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
    path
}

fn read_snapshot(path: &Path) -> Vec<ProcessedRecord> {
    let content = fs::read_to_string(path).unwrap();
    serde_json::from_str(&content).unwrap()
}

fn stale_record(days_old: i64) -> ProcessedRecord {
    let fingerprint = FileFingerprint {
        path: "/old/file.csv".to_string(),
        hash: "deadbeef".to_string(),
        size: 8,
        last_modified: 1_600_000_000_000,
    };
    ProcessedRecord::from_fingerprint(&fingerprint, Utc::now() - chrono::Duration::days(days_old))
}

#[test]
fn test_records_survive_restart() {
    let temp = TempDir::new().unwrap();
    let ledger_path = temp.path().join("state").join("processed.json");
    let file = write_file(temp.path(), "a.csv", b"hello");

    {
        let ledger = ProcessedFileLedger::open(&ledger_path, LedgerConfig::default()).unwrap();
        ledger.record(&file).unwrap();
    }

    let reopened = ProcessedFileLedger::open(&ledger_path, LedgerConfig::default()).unwrap();
    assert_eq!(reopened.len(), 1);
    assert!(reopened.is_processed(&file));
}

#[test]
fn test_hundredth_insertion_prunes_expired_records_from_snapshot() {
    let temp = TempDir::new().unwrap();
    let ledger_path = temp.path().join("processed.json");
    let file = write_file(temp.path(), "a.csv", b"hello");

    let ledger = ProcessedFileLedger::open(&ledger_path, LedgerConfig::default()).unwrap();
    ledger.insert(stale_record(31));
    for _ in 0..98 {
        ledger.record(&file).unwrap();
    }
    assert!(!ledger_path.exists(), "no snapshot before the 100th insertion");

    ledger.record(&file).unwrap();

    let snapshot = read_snapshot(&ledger_path);
    assert_eq!(snapshot.len(), 99);
    assert!(snapshot.iter().all(|r| r.file_path != "/old/file.csv"));
    assert_eq!(ledger.len(), 99);

    let journal = fs::read_to_string(temp.path().join("processed.json.journal")).unwrap();
    assert!(journal.is_empty());
}

#[test]
fn test_records_within_retention_are_kept() {
    let temp = TempDir::new().unwrap();
    let ledger_path = temp.path().join("processed.json");

    let ledger = ProcessedFileLedger::open(&ledger_path, LedgerConfig::default()).unwrap();
    ledger.insert(stale_record(29));
    ledger.insert(stale_record(45));
    assert_eq!(ledger.compact().unwrap(), 1);

    let snapshot = read_snapshot(&ledger_path);
    assert_eq!(snapshot.len(), 1);
}

#[test]
fn test_reads_legacy_snapshot_format() {
    let temp = TempDir::new().unwrap();
    let ledger_path = temp.path().join("processed.json");
    let file = write_file(temp.path(), "legacy.csv", b"legacy content");
    let fingerprint = FileFingerprint::compute(&file).unwrap();

    let legacy = format!(
        r#"[{{"filePath":"{}","fileHash":"{}","lastModified":{},"fileSize":{},"processTime":{}}}]"#,
        fingerprint.path.replace('\\', "\\\\"),
        fingerprint.hash,
        fingerprint.last_modified,
        fingerprint.size,
        Utc::now().timestamp_millis()
    );
    fs::write(&ledger_path, legacy).unwrap();

    let ledger = ProcessedFileLedger::open(&ledger_path, LedgerConfig::default()).unwrap();
    assert!(ledger.is_processed(&file));
}

#[test]
fn test_custom_compaction_cadence() {
    let temp = TempDir::new().unwrap();
    let ledger_path = temp.path().join("processed.json");
    let file = write_file(temp.path(), "a.csv", b"x");

    let ledger = ProcessedFileLedger::open(
        &ledger_path,
        LedgerConfig {
            compaction_every: 3,
            ..LedgerConfig::default()
        },
    )
    .unwrap();
    ledger.record(&file).unwrap();
    ledger.record(&file).unwrap();
    assert!(!ledger_path.exists());
    ledger.record(&file).unwrap();
    assert_eq!(read_snapshot(&ledger_path).len(), 3);
}

#[test]
fn test_concurrent_records_are_not_lost() {
    let temp = TempDir::new().unwrap();
    let ledger_path = temp.path().join("processed.json");
    let ledger = Arc::new(
        ProcessedFileLedger::open(
            &ledger_path,
            LedgerConfig {
                compaction_every: 7,
                ..LedgerConfig::default()
            },
        )
        .unwrap(),
    );

    let files: Vec<PathBuf> = (0..8)
        .map(|i| write_file(temp.path(), &format!("f{}.csv", i), format!("content {}", i).as_bytes()))
        .collect();

    let workers: Vec<_> = files
        .iter()
        .cloned()
        .map(|file| {
            let ledger = ledger.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    ledger.record(&file).unwrap();
                    assert!(ledger.is_processed(&file));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(ledger.len(), 80);
    drop(ledger);

    let reopened = ProcessedFileLedger::open(&ledger_path, LedgerConfig::default()).unwrap();
    assert_eq!(reopened.len(), 80);
    for file in &files {
        assert!(reopened.is_processed(file));
    }
}

#[test]
fn test_failed_snapshot_keeps_memory_and_journal() {
    let temp = TempDir::new().unwrap();
    let ledger_path = temp.path().join("processed.json");
    // A non-empty directory where the snapshot belongs makes every rename fail.
    fs::create_dir_all(ledger_path.join("blocker")).unwrap();
    let a = write_file(temp.path(), "a.csv", b"first");
    let b = write_file(temp.path(), "b.csv", b"second");

    let ledger = ProcessedFileLedger::open(
        &ledger_path,
        LedgerConfig {
            compaction_every: 2,
            ..LedgerConfig::default()
        },
    )
    .unwrap();
    ledger.record(&a).unwrap();
    ledger.record(&b).unwrap();

    assert_eq!(ledger.len(), 2);
    assert!(ledger.is_processed(&a) && ledger.is_processed(&b));
    let journal_path = temp.path().join("processed.json.journal");
    let journal = fs::read_to_string(&journal_path).unwrap();
    assert_eq!(journal.lines().count(), 2);
    assert!(ledger.compact().is_err());
    drop(ledger);

    fs::remove_dir_all(&ledger_path).unwrap();
    let reopened = ProcessedFileLedger::open(&ledger_path, LedgerConfig::default()).unwrap();
    assert_eq!(reopened.len(), 2);
    assert!(reopened.is_processed(&a) && reopened.is_processed(&b));
}
