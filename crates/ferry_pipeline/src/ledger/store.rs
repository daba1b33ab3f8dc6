//! Durable side of the ledger: a JSON snapshot plus an append-only journal.
//!
//! Every insertion is appended to `<snapshot>.journal` and synced before the
//! call returns. Compaction writes the full record set to `<snapshot>.tmp`,
//! syncs it, renames it over the snapshot and only then truncates the
//! journal, so a crash at any point leaves either the old snapshot plus the
//! journal or the new snapshot.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::ProcessedRecord;
use crate::error::Result;

pub(crate) struct LedgerStore {
    snapshot_path: PathBuf,
    journal_path: PathBuf,
    journal: Option<File>,
}

impl LedgerStore {
    /// Open the store at `snapshot_path` and load every durable record.
    pub(crate) fn open(snapshot_path: &Path) -> Result<(Self, Vec<ProcessedRecord>)> {
        if let Some(parent) = snapshot_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let store = Self {
            snapshot_path: snapshot_path.to_path_buf(),
            journal_path: sibling_path(snapshot_path, "journal"),
            journal: None,
        };

        let mut records = store.load_snapshot();
        let replayed = store.replay_journal(&mut records)?;
        info!(
            path = %snapshot_path.display(),
            records = records.len(),
            replayed,
            "Loaded processed file records"
        );
        Ok((store, records))
    }

    pub(crate) fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// A snapshot that cannot be read is logged and treated as empty: the
    /// worst outcome is re-sending files, never skipping them.
    fn load_snapshot(&self) -> Vec<ProcessedRecord> {
        let file = match File::open(&self.snapshot_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                error!(path = %self.snapshot_path.display(), error = %e, "Error opening ledger snapshot");
                return Vec::new();
            }
        };
        match serde_json::from_reader(BufReader::new(file)) {
            Ok(records) => records,
            Err(e) => {
                error!(path = %self.snapshot_path.display(), error = %e, "Error parsing ledger snapshot");
                Vec::new()
            }
        }
    }

    fn replay_journal(&self, records: &mut Vec<ProcessedRecord>) -> Result<usize> {
        let file = match File::open(&self.journal_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut replayed = 0;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ProcessedRecord>(&line) {
                Ok(record) => {
                    records.push(record);
                    replayed += 1;
                }
                Err(e) => {
                    warn!(
                        path = %self.journal_path.display(),
                        line = idx + 1,
                        error = %e,
                        "Skipping unreadable journal entry"
                    );
                }
            }
        }
        Ok(replayed)
    }

    /// Append one record to the journal and sync it.
    pub(crate) fn append(&mut self, record: &ProcessedRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        if self.journal.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.journal_path)?;
            self.journal = Some(file);
        }
        if let Some(journal) = self.journal.as_mut() {
            journal.write_all(&line)?;
            journal.sync_data()?;
        }
        Ok(())
    }

    /// Replace the snapshot with `records` and reset the journal.
    pub(crate) fn write_snapshot(&mut self, records: &[ProcessedRecord]) -> Result<()> {
        let tmp_path = sibling_path(&self.snapshot_path, "tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, records)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.snapshot_path)?;

        self.journal = None;
        File::create(&self.journal_path)?.sync_all()?;
        debug!(path = %self.snapshot_path.display(), records = records.len(), "Wrote ledger snapshot");
        Ok(())
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
