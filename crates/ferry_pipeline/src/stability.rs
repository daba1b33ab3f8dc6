//! Write-completion heuristic for large files.
//!
//! A file is considered fully written once nobody holds an exclusive lock on
//! it and its `(size, mtime)` stays unchanged for a minimum duration. The
//! check blocks for up to `poll_interval * max_retries`, so it must run on a
//! worker thread.

use fs2::FileExt;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::config::StabilityConfig;
use crate::error::Result;

/// Verdict of a stability check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    /// Unchanged for at least the minimum stable duration
    Stable,
    /// Still changing when the sample budget ran out (or it disappeared)
    Unstable,
    /// Another process holds a lock on the file
    Locked,
}

/// One `(size, mtime)` observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sample {
    size: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug, Clone, Default)]
pub struct StabilityDetector {
    config: StabilityConfig,
}

impl StabilityDetector {
    pub fn new(config: StabilityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    /// Decide whether `path` is safe to read.
    ///
    /// Returns `Err(Cancelled)` if `cancel` fires between samples.
    pub fn check(&self, path: &Path, cancel: &CancellationToken) -> Result<Stability> {
        cancel.check()?;

        if is_locked(path) {
            debug!(path = %path.display(), "File is locked by another writer");
            return Ok(Stability::Locked);
        }

        let interval = self.config.poll_interval();
        let min_stable = self.config.min_stable();
        let mut last: Option<Sample> = None;
        let mut stable_count: u32 = 0;

        for _ in 0..self.config.max_retries {
            let current = match sample(path) {
                Ok(current) => current,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "File vanished during stability check");
                    return Ok(Stability::Unstable);
                }
            };

            if last == Some(current) {
                stable_count += 1;
                if interval * stable_count >= min_stable {
                    debug!(path = %path.display(), checks = stable_count, "File is stable");
                    return Ok(Stability::Stable);
                }
            } else {
                if last.is_some() {
                    debug!(path = %path.display(), "Size or mtime changed, resetting stability counter");
                }
                stable_count = 0;
            }

            last = Some(current);
            cancel.sleep(interval)?;
        }

        warn!(
            path = %path.display(),
            retries = self.config.max_retries,
            "File not stable after sample budget"
        );
        Ok(Stability::Unstable)
    }
}

fn sample(path: &Path) -> io::Result<Sample> {
    let metadata = std::fs::metadata(path)?;
    Ok(Sample {
        size: metadata.len(),
        modified: metadata.modified().ok(),
    })
}

/// Non-blocking exclusive lock probe. A file that cannot be opened for
/// writing counts as locked.
fn is_locked(path: &Path) -> bool {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Cannot open file for lock probe");
            return true;
        }
    };
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            false
        }
        Err(_) => true,
    }
}
