//! Processed-file ledger: the idempotency oracle for completed transfers.
//!
//! A file counts as processed when a stored record carries the same
//! `(content hash, size, mtime)` triple (and, under [`IdentityPolicy::Path`],
//! the same path). Records are never mutated; they are inserted and, once
//! older than the retention window, pruned at compaction time.

mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info};

use crate::config::LedgerConfig;
use crate::error::Result;
use crate::mapping::FileKey;
use store::LedgerStore;

const HASH_BUFFER_SIZE: usize = 8192;

/// What makes two files "the same" for idempotency purposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityPolicy {
    /// Same content, size and mtime, wherever the file lives. A copy of an
    /// already-sent file elsewhere is treated as processed.
    #[default]
    Content,
    /// Same content, size and mtime at the same path.
    Path,
}

/// One completed transfer. Field names match the durable JSON format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRecord {
    pub file_path: String,
    /// Lowercase hex SHA-256 of the full content
    pub file_hash: String,
    /// Modification time, milliseconds since the Unix epoch
    pub last_modified: i64,
    pub file_size: u64,
    /// When the record was created, milliseconds since the Unix epoch
    pub process_time: i64,
}

impl ProcessedRecord {
    pub fn from_fingerprint(fingerprint: &FileFingerprint, processed_at: DateTime<Utc>) -> Self {
        Self {
            file_path: fingerprint.path.clone(),
            file_hash: fingerprint.hash.clone(),
            last_modified: fingerprint.last_modified,
            file_size: fingerprint.size,
            process_time: processed_at.timestamp_millis(),
        }
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.process_time)
    }

    fn matches(&self, probe: &FileFingerprint, policy: IdentityPolicy) -> bool {
        let same_content = self.file_hash == probe.hash
            && self.file_size == probe.size
            && self.last_modified == probe.last_modified;
        match policy {
            IdentityPolicy::Content => same_content,
            IdentityPolicy::Path => same_content && self.file_path == probe.path,
        }
    }
}

/// The identity triple of a file on disk, plus its canonical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub last_modified: i64,
}

impl FileFingerprint {
    /// Hash the whole file. Cost is O(file size); callers must not hold any
    /// lock shared with other files while this runs.
    pub fn compute(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified: DateTime<Utc> = metadata.modified()?.into();
        let hash = hash_file(path)?;
        Ok(Self {
            path: FileKey::for_path(path).to_string(),
            hash,
            size: metadata.len(),
            last_modified: modified.timestamp_millis(),
        })
    }

    /// Whether the file at `path` still has this fingerprint's size and
    /// mtime. Does not rehash.
    pub fn is_current(&self, path: &Path) -> io::Result<bool> {
        let metadata = std::fs::metadata(path)?;
        let modified: DateTime<Utc> = metadata.modified()?.into();
        Ok(metadata.len() == self.size && modified.timestamp_millis() == self.last_modified)
    }
}

/// Streamed SHA-256 of the full file content.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Content-addressed ledger of processed files.
///
/// Reads (`is_processed`) take a shared lock on the in-memory records only.
/// Writes serialize on the durable store first and the record list second,
/// so a snapshot being written never blocks lookups for unrelated files.
pub struct ProcessedFileLedger {
    records: RwLock<Vec<ProcessedRecord>>,
    store: Mutex<Option<LedgerStore>>,
    insertions: AtomicU64,
    config: LedgerConfig,
}

impl ProcessedFileLedger {
    /// Ledger without durable storage. `config` is taken as given; a zero
    /// compaction cadence compacts on every insertion.
    pub fn in_memory(config: LedgerConfig) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            store: Mutex::new(None),
            insertions: AtomicU64::new(0),
            config,
        }
    }

    /// Open (or create) a ledger persisted at `path`.
    pub fn open(path: &Path, config: LedgerConfig) -> Result<Self> {
        config.validate()?;
        let (store, records) = LedgerStore::open(path)?;
        Ok(Self {
            records: RwLock::new(records),
            store: Mutex::new(Some(store)),
            insertions: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_records().is_empty()
    }

    /// Copy of every record currently held in memory.
    pub fn records(&self) -> Vec<ProcessedRecord> {
        self.read_records().clone()
    }

    /// Whether `path` was already transferred in its current state.
    ///
    /// Any error while hashing is logged and reported as "not processed" so
    /// the pipeline proceeds rather than silently skipping a real file.
    pub fn is_processed(&self, path: &Path) -> bool {
        match FileFingerprint::compute(path) {
            Ok(fingerprint) => self.contains(&fingerprint),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Error checking file process status");
                false
            }
        }
    }

    /// Exact identity match against the stored records.
    pub fn contains(&self, fingerprint: &FileFingerprint) -> bool {
        let policy = self.config.identity;
        self.read_records()
            .iter()
            .any(|record| record.matches(fingerprint, policy))
    }

    /// Fingerprint `path` and record it as processed now.
    pub fn record(&self, path: &Path) -> Result<ProcessedRecord> {
        let fingerprint = FileFingerprint::compute(path)?;
        Ok(self.record_fingerprint(&fingerprint))
    }

    /// Record an already computed fingerprint as processed now.
    pub fn record_fingerprint(&self, fingerprint: &FileFingerprint) -> ProcessedRecord {
        let record = ProcessedRecord::from_fingerprint(fingerprint, Utc::now());
        self.insert(record.clone());
        record
    }

    /// Append a record. Every `compaction_every`-th insertion prunes expired
    /// records and rewrites the snapshot.
    ///
    /// Persistence failures are logged, never returned: the in-memory
    /// insertion stands and disk catches up at the next successful write.
    pub fn insert(&self, record: ProcessedRecord) {
        let mut store = self.lock_store();

        if let Some(store) = store.as_mut() {
            if let Err(e) = store.append(&record) {
                error!(
                    path = %record.file_path,
                    ledger = %store.snapshot_path().display(),
                    error = %e,
                    "Error appending processed file record"
                );
            }
        }
        self.write_records().push(record);

        let count = self.insertions.fetch_add(1, Ordering::SeqCst) + 1;
        if count % self.config.compaction_every.max(1) == 0 {
            if let Err(e) = self.compact_locked(&mut store, Utc::now()) {
                error!(error = %e, "Error saving processed file records");
            }
        }
    }

    /// Prune expired records and write a fresh snapshot.
    ///
    /// Returns the number of records pruned.
    pub fn compact(&self) -> Result<usize> {
        let mut store = self.lock_store();
        self.compact_locked(&mut store, Utc::now())
    }

    /// Drop records processed before `now - retention`. In-memory only.
    /// A window reaching past the earliest representable time prunes nothing.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = now.checked_sub_signed(self.config.retention()) else {
            return 0;
        };
        let cutoff = cutoff.timestamp_millis();
        let mut records = self.write_records();
        let before = records.len();
        records.retain(|record| record.process_time >= cutoff);
        before - records.len()
    }

    fn compact_locked(
        &self,
        store: &mut MutexGuard<'_, Option<LedgerStore>>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let pruned = self.prune(now);
        if pruned > 0 {
            debug!(pruned, "Pruned expired processed file records");
        }

        let Some(store) = store.as_mut() else {
            return Ok(pruned);
        };
        let snapshot = self.records();
        store.write_snapshot(&snapshot)?;
        info!(records = snapshot.len(), pruned, "Saved processed file records");
        Ok(pruned)
    }

    fn read_records(&self) -> RwLockReadGuard<'_, Vec<ProcessedRecord>> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_records(&self) -> RwLockWriteGuard<'_, Vec<ProcessedRecord>> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_store(&self) -> MutexGuard<'_, Option<LedgerStore>> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ProcessedFileLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessedFileLedger")
            .field("records", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};

    fn write(path: &Path, content: &[u8]) {
        std::fs::write(path, content).unwrap();
        set_file_mtime(path, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
    }

    #[test]
    fn test_hash_covers_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let mut content = vec![0u8; HASH_BUFFER_SIZE * 3];
        std::fs::write(&a, &content).unwrap();
        *content.last_mut().unwrap() = 1;
        std::fs::write(&b, &content).unwrap();

        assert_ne!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            hash_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_record_then_is_processed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        write(&path, b"a,b\n1,2\n");

        let ledger = ProcessedFileLedger::in_memory(LedgerConfig::default());
        assert!(!ledger.is_processed(&path));
        ledger.record(&path).unwrap();
        assert!(ledger.is_processed(&path));
    }

    #[test]
    fn test_touching_mtime_makes_file_unprocessed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        write(&path, b"same content");

        let ledger = ProcessedFileLedger::in_memory(LedgerConfig::default());
        ledger.record(&path).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(1_700_000_500, 0)).unwrap();

        assert!(!ledger.is_processed(&path));
    }

    #[test]
    fn test_content_identity_treats_copies_as_processed() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("a.csv");
        let copy = dir.path().join("b.csv");
        write(&original, b"payload");
        write(&copy, b"payload");

        let ledger = ProcessedFileLedger::in_memory(LedgerConfig::default());
        ledger.record(&original).unwrap();
        assert!(ledger.is_processed(&copy));
    }

    #[test]
    fn test_path_identity_distinguishes_copies() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("a.csv");
        let copy = dir.path().join("b.csv");
        write(&original, b"payload");
        write(&copy, b"payload");

        let ledger = ProcessedFileLedger::in_memory(LedgerConfig {
            identity: IdentityPolicy::Path,
            ..LedgerConfig::default()
        });
        ledger.record(&original).unwrap();
        assert!(ledger.is_processed(&original));
        assert!(!ledger.is_processed(&copy));
    }

    #[test]
    fn test_missing_file_is_not_processed() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ProcessedFileLedger::in_memory(LedgerConfig::default());
        assert!(!ledger.is_processed(&dir.path().join("missing")));
        assert!(ledger.record(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_prune_respects_retention() {
        let ledger = ProcessedFileLedger::in_memory(LedgerConfig::default());
        let now = Utc::now();
        let fingerprint = FileFingerprint {
            path: "/x".to_string(),
            hash: "h".to_string(),
            size: 1,
            last_modified: 0,
        };
        ledger.insert(ProcessedRecord::from_fingerprint(
            &fingerprint,
            now - chrono::Duration::days(31),
        ));
        ledger.insert(ProcessedRecord::from_fingerprint(
            &fingerprint,
            now - chrono::Duration::days(29),
        ));

        assert_eq!(ledger.prune(now), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_zero_compaction_cadence_does_not_panic() {
        let ledger = ProcessedFileLedger::in_memory(LedgerConfig {
            compaction_every: 0,
            ..LedgerConfig::default()
        });
        let fingerprint = FileFingerprint {
            path: "/x".to_string(),
            hash: "h".to_string(),
            size: 1,
            last_modified: 0,
        };
        ledger.record_fingerprint(&fingerprint);
        ledger.record_fingerprint(&fingerprint);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_huge_retention_prunes_nothing() {
        let ledger = ProcessedFileLedger::in_memory(LedgerConfig {
            retention_days: u32::MAX,
            ..LedgerConfig::default()
        });
        let fingerprint = FileFingerprint {
            path: "/x".to_string(),
            hash: "h".to_string(),
            size: 1,
            last_modified: 0,
        };
        ledger.insert(ProcessedRecord::from_fingerprint(
            &fingerprint,
            Utc::now() - chrono::Duration::days(3650),
        ));

        assert_eq!(ledger.prune(Utc::now()), 0);
        assert_eq!(ledger.compact().unwrap(), 0);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed_files.json");
        let zero = LedgerConfig {
            compaction_every: 0,
            ..LedgerConfig::default()
        };
        assert!(ProcessedFileLedger::open(&path, zero).is_err());
        let unbounded = LedgerConfig {
            retention_days: u32::MAX,
            ..LedgerConfig::default()
        };
        assert!(ProcessedFileLedger::open(&path, unbounded).is_err());
    }

    #[test]
    fn test_fingerprint_is_current_until_touched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        write(&path, b"v1");

        let fingerprint = FileFingerprint::compute(&path).unwrap();
        assert!(fingerprint.is_current(&path).unwrap());
        std::fs::write(&path, b"version two").unwrap();
        assert!(!fingerprint.is_current(&path).unwrap());
        std::fs::remove_file(&path).unwrap();
        assert!(fingerprint.is_current(&path).is_err());
    }

    #[test]
    fn test_record_json_field_names() {
        let record = ProcessedRecord {
            file_path: "/in/a.csv".to_string(),
            file_hash: "abc".to_string(),
            last_modified: 1,
            file_size: 2,
            process_time: 3,
        };
        let json = serde_json::to_value(&record).unwrap();
        for field in ["filePath", "fileHash", "lastModified", "fileSize", "processTime"] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
    }
}
