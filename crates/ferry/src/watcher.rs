//! Polling directory watcher.
//!
//! Each poll walks every source root and diffs `(size, mtime)` against the
//! previous pass. Files that exist at startup form the baseline and do not
//! produce events; deletions are forgotten silently.

use ferry_pipeline::{CancellationToken, FileEvent, FileMapping, TransferPipeline};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::{FerryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileState {
    size: u64,
    modified: SystemTime,
}

/// First mapping whose source root contains `path` and whose pattern matches
/// its file name.
pub fn mapping_for<'a>(mappings: &'a [Arc<FileMapping>], path: &Path) -> Option<&'a Arc<FileMapping>> {
    mappings
        .iter()
        .find(|m| path.starts_with(m.source_root()) && m.matches(path))
}

pub struct PollingWatcher {
    mappings: Vec<Arc<FileMapping>>,
    interval: Duration,
    snapshot: HashMap<PathBuf, FileState>,
    /// Roots already reported as unavailable, so each outage is logged once
    unavailable: HashSet<PathBuf>,
}

impl PollingWatcher {
    pub fn new(mappings: Vec<Arc<FileMapping>>, interval: Duration) -> Self {
        Self {
            mappings,
            interval,
            snapshot: HashMap::new(),
            unavailable: HashSet::new(),
        }
    }

    /// Number of files currently tracked
    pub fn tracked(&self) -> usize {
        self.snapshot.len()
    }

    /// Record the baseline. Returns how many source roots can be watched.
    pub fn prime(&mut self) -> usize {
        let (current, watchable) = self.scan();
        info!(
            roots = watchable,
            files = current.len(),
            "Watcher baseline recorded"
        );
        self.snapshot = current;
        watchable
    }

    /// One pass: events for new and changed files since the last pass.
    pub fn poll(&mut self) -> Vec<(FileEvent, Arc<FileMapping>)> {
        let (current, _) = self.scan();
        let mut events = Vec::new();

        for (path, state) in &current {
            let event = match self.snapshot.get(path) {
                None => FileEvent::Created(path.clone()),
                Some(previous) if previous != state => FileEvent::Modified(path.clone()),
                Some(_) => continue,
            };
            if let Some(mapping) = mapping_for(&self.mappings, path) {
                events.push((event, Arc::clone(mapping)));
            }
        }

        self.snapshot = current;
        events
    }

    /// Poll until `shutdown` is cancelled, feeding events to `pipeline`.
    pub fn run(&mut self, pipeline: &TransferPipeline, shutdown: &CancellationToken) -> Result<()> {
        if self.prime() == 0 {
            return Err(FerryError::Config(
                "none of the configured source directories can be watched".to_string(),
            ));
        }

        info!(interval_ms = self.interval.as_millis() as u64, "Watching for file changes");
        while shutdown.sleep(self.interval).is_ok() {
            for (event, mapping) in self.poll() {
                if let Err(e) = pipeline.on_event(event, mapping) {
                    error!(error = %e, "Failed to submit file event");
                }
            }
        }
        info!("Watcher stopped");
        Ok(())
    }

    fn scan(&mut self) -> (HashMap<PathBuf, FileState>, usize) {
        let mut current = HashMap::new();
        let mut watchable = 0;

        let roots: Vec<PathBuf> = self
            .mappings
            .iter()
            .map(|m| m.source_root().to_path_buf())
            .collect();

        for root in roots {
            if !root.is_dir() {
                if self.unavailable.insert(root.clone()) {
                    error!(root = %root.display(), "Source directory does not exist or is not a directory");
                }
                continue;
            }
            if self.unavailable.remove(&root) {
                info!(root = %root.display(), "Source directory is available again");
            }
            watchable += 1;
            self.scan_root(&root, &mut current);
        }

        (current, watchable)
    }

    fn scan_root(&self, root: &Path, current: &mut HashMap<PathBuf, FileState>) {
        for entry in WalkDir::new(root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if current.contains_key(path) || mapping_for(&self.mappings, path).is_none() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "File disappeared during scan");
                    continue;
                }
            };
            current.insert(
                path.to_path_buf(),
                FileState {
                    size: metadata.len(),
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;
    use tempfile::TempDir;

    fn watcher_for(root: &Path, pattern: &str) -> PollingWatcher {
        let mapping = FileMapping::new(pattern, root, "/upload").unwrap();
        PollingWatcher::new(vec![Arc::new(mapping)], Duration::from_millis(10))
    }

    #[test]
    fn test_existing_files_are_baseline() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("old.csv"), b"old").unwrap();

        let mut watcher = watcher_for(temp.path(), r".*\.csv");
        assert_eq!(watcher.prime(), 1);
        assert_eq!(watcher.tracked(), 1);
        assert!(watcher.poll().is_empty());
    }

    #[test]
    fn test_created_and_modified_events() {
        let temp = TempDir::new().unwrap();
        let mut watcher = watcher_for(temp.path(), r".*\.csv");
        watcher.prime();

        let nested = temp.path().join("2024").join("01");
        fs::create_dir_all(&nested).unwrap();
        let file = nested.join("a.csv");
        fs::write(&file, b"one").unwrap();
        fs::write(temp.path().join("ignored.txt"), b"nope").unwrap();

        let events = watcher.poll();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, FileEvent::Created(file.clone()));

        fs::write(&file, b"one two").unwrap();
        set_file_mtime(&file, FileTime::from_unix_time(1_800_000_000, 0)).unwrap();
        let events = watcher.poll();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, FileEvent::Modified(file.clone()));

        assert!(watcher.poll().is_empty());
    }

    #[test]
    fn test_deleted_files_are_forgotten() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.csv");
        fs::write(&file, b"x").unwrap();

        let mut watcher = watcher_for(temp.path(), r".*\.csv");
        watcher.prime();
        fs::remove_file(&file).unwrap();
        assert!(watcher.poll().is_empty());
        assert_eq!(watcher.tracked(), 0);

        fs::write(&file, b"x").unwrap();
        let events = watcher.poll();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].0, FileEvent::Created(_)));
    }

    #[test]
    fn test_missing_root_is_skipped() {
        let temp = TempDir::new().unwrap();
        let good = FileMapping::new(".*", temp.path(), "/a").unwrap();
        let missing = FileMapping::new(".*", temp.path().join("missing"), "/b").unwrap();
        let mut watcher = PollingWatcher::new(
            vec![Arc::new(missing), Arc::new(good)],
            Duration::from_millis(10),
        );
        assert_eq!(watcher.prime(), 1);
    }

    #[test]
    fn test_mapping_for_picks_first_match() {
        let csv = Arc::new(FileMapping::new(r".*\.csv", "/in", "/csv").unwrap());
        let any = Arc::new(FileMapping::new(".*", "/in", "/any").unwrap());
        let mappings = vec![csv, any];

        let hit = mapping_for(&mappings, Path::new("/in/x/a.csv")).unwrap();
        assert_eq!(hit.target_root(), "/csv");
        let hit = mapping_for(&mappings, Path::new("/in/a.txt")).unwrap();
        assert_eq!(hit.target_root(), "/any");
        assert!(mapping_for(&mappings, Path::new("/elsewhere/a.csv")).is_none());
    }
}
