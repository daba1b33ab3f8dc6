//! Change-to-transfer orchestration.
//!
//! Per event: register the file (cancelling any stale task), then on a
//! worker: ledger gate → stability gate (large files only) → upload →
//! record. Every path ends the task and removes its registry entry. Nothing
//! is retried internally; the next filesystem event is the retry.
//!
//! The record written after an upload is the fingerprint taken before it.
//! If the file's size or mtime moved while uploading, nothing is recorded
//! and the change event that follows sends the new content.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::ledger::{FileFingerprint, ProcessedFileLedger};
use crate::mapping::{FileEvent, FileKey, FileMapping};
use crate::pool::{PoolStats, WorkerPool};
use crate::registry::{TaskHandle, TaskOutcome, TaskRegistry};
use crate::stability::{Stability, StabilityDetector};
use crate::transfer::TransferClient;

const POOL_NAME: &str = "ferry-worker";

/// Point-in-time pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub submitted: u64,
    pub superseded: u64,
    pub already_processed: u64,
    pub unstable: u64,
    pub locked: u64,
    pub vanished: u64,
    pub transferred: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub pool: PoolStats,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    superseded: AtomicU64,
    already_processed: AtomicU64,
    unstable: AtomicU64,
    locked: AtomicU64,
    vanished: AtomicU64,
    transferred: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn observe(&self, outcome: &TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::AlreadyProcessed => &self.already_processed,
            TaskOutcome::Unstable => &self.unstable,
            TaskOutcome::Locked => &self.locked,
            TaskOutcome::Vanished => &self.vanished,
            TaskOutcome::Transferred { .. } => &self.transferred,
            TaskOutcome::Failed { .. } => &self.failed,
            TaskOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The per-file work, shared by every task.
struct Processor {
    ledger: Arc<ProcessedFileLedger>,
    detector: StabilityDetector,
    client: Arc<dyn TransferClient>,
    large_file_threshold: u64,
    counters: Counters,
}

impl Processor {
    /// Run one file through the gates. Errors and panics are contained here.
    fn run(&self, path: &Path, mapping: &FileMapping, cancel: &CancellationToken) -> TaskOutcome {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.try_run(path, mapping, cancel)));
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_cancelled() => {
                debug!(path = %path.display(), "Task superseded or cancelled");
                TaskOutcome::Cancelled
            }
            Ok(Err(e)) => {
                error!(path = %path.display(), error = %e, "Error processing file");
                TaskOutcome::Failed {
                    error: e.to_string(),
                }
            }
            Err(payload) => {
                let error = format!("task panicked: {}", panic_message(payload.as_ref()));
                error!(path = %path.display(), error = %error, "Error processing file");
                TaskOutcome::Failed { error }
            }
        };
        self.counters.observe(&outcome);
        outcome
    }

    fn try_run(
        &self,
        path: &Path,
        mapping: &FileMapping,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome> {
        cancel.check()?;

        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "File vanished before processing");
                return Ok(TaskOutcome::Vanished);
            }
            Err(e) => return Err(e.into()),
        };

        let mut fingerprint = fingerprint_of(path);
        if self.already_processed(path, fingerprint.as_ref()) {
            return Ok(TaskOutcome::AlreadyProcessed);
        }
        cancel.check()?;

        if metadata.len() > self.large_file_threshold {
            match self.detector.check(path, cancel)? {
                Stability::Stable => {}
                Stability::Unstable => {
                    warn!(path = %path.display(), "Large file is not stable yet, waiting for next event");
                    return Ok(TaskOutcome::Unstable);
                }
                Stability::Locked => {
                    warn!(path = %path.display(), "Large file is locked, waiting for next event");
                    return Ok(TaskOutcome::Locked);
                }
            }

            // The gate may have waited out writes that landed after hashing.
            if !is_current(fingerprint.as_ref(), path) {
                cancel.check()?;
                fingerprint = fingerprint_of(path);
                if self.already_processed(path, fingerprint.as_ref()) {
                    return Ok(TaskOutcome::AlreadyProcessed);
                }
            }
        }

        let remote = mapping.remote_path_for(path)?;
        cancel.check()?;
        self.client
            .upload(path, &remote, cancel)
            .map_err(PipelineError::Transfer)?;
        info!(path = %path.display(), remote = %remote, "Successfully uploaded file");

        // A newer event owns the ledger entry for this file from here on.
        cancel.check()?;

        match fingerprint {
            Some(fingerprint) => match fingerprint.is_current(path) {
                Ok(true) => {
                    self.ledger.record_fingerprint(&fingerprint);
                }
                Ok(false) => {
                    warn!(path = %path.display(), "File changed during upload, not recording it");
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Error adding processed file record");
                }
            },
            None => {
                warn!(path = %path.display(), "File was never fingerprinted, not recording it");
            }
        }
        Ok(TaskOutcome::Transferred { remote })
    }

    fn already_processed(&self, path: &Path, fingerprint: Option<&FileFingerprint>) -> bool {
        let processed = fingerprint.is_some_and(|fp| self.ledger.contains(fp));
        if processed {
            debug!(path = %path.display(), "File already processed");
        }
        processed
    }
}

/// Hash errors are logged and treated as "not processed" so the pipeline
/// proceeds rather than silently skipping a real file.
fn fingerprint_of(path: &Path) -> Option<FileFingerprint> {
    match FileFingerprint::compute(path) {
        Ok(fingerprint) => Some(fingerprint),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Error checking file process status");
            None
        }
    }
}

fn is_current(fingerprint: Option<&FileFingerprint>, path: &Path) -> bool {
    fingerprint.is_some_and(|fp| fp.is_current(path).unwrap_or(false))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Turns file-change events into at most one concurrent transfer per file.
pub struct TransferPipeline {
    processor: Arc<Processor>,
    registry: Arc<TaskRegistry>,
    pool: WorkerPool,
}

impl TransferPipeline {
    pub fn new(
        config: &PipelineConfig,
        ledger: Arc<ProcessedFileLedger>,
        client: Arc<dyn TransferClient>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(POOL_NAME, config.pool.clone())?;
        Ok(Self {
            processor: Arc::new(Processor {
                ledger,
                detector: StabilityDetector::new(config.stability.clone()),
                client,
                large_file_threshold: config.large_file_threshold,
                counters: Counters::default(),
            }),
            registry: Arc::new(TaskRegistry::new()),
            pool,
        })
    }

    /// Handle one change event. Registration happens on the calling thread;
    /// the work runs on the pool (or here, when the pool is saturated).
    pub fn on_event(&self, event: FileEvent, mapping: Arc<FileMapping>) -> Result<TaskHandle> {
        let path = event.path().to_path_buf();
        let key = FileKey::for_path(&path);
        debug!(path = %path.display(), kind = event.kind(), "Received file event");

        let processor = Arc::clone(&self.processor);
        processor.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let registration = self
            .registry
            .submit(key, &self.pool, move |cancel| {
                processor.run(&path, &mapping, cancel)
            })
            .map_err(|e| {
                // The task was dropped unrun and completed as cancelled.
                self.processor
                    .counters
                    .cancelled
                    .fetch_add(1, Ordering::Relaxed);
                e
            })?;
        if registration.superseded.is_some() {
            self.processor
                .counters
                .superseded
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(registration.handle)
    }

    /// Process one file on the calling thread, still honouring the
    /// one-task-per-file rule.
    pub fn process_now(&self, path: &Path, mapping: &FileMapping) -> TaskOutcome {
        let registration = self.registry.register(FileKey::for_path(path));
        self.processor
            .counters
            .submitted
            .fetch_add(1, Ordering::Relaxed);
        if registration.superseded.is_some() {
            self.processor
                .counters
                .superseded
                .fetch_add(1, Ordering::Relaxed);
        }

        let handle = registration.handle;
        let outcome = self.processor.run(path, mapping, handle.token());
        self.registry.complete(&handle, outcome.clone());
        outcome
    }

    pub fn ledger(&self) -> &Arc<ProcessedFileLedger> {
        &self.processor.ledger
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.processor.counters;
        PipelineStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
            already_processed: c.already_processed.load(Ordering::Relaxed),
            unstable: c.unstable.load(Ordering::Relaxed),
            locked: c.locked.load(Ordering::Relaxed),
            vanished: c.vanished.load(Ordering::Relaxed),
            transferred: c.transferred.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            pool: self.pool.stats(),
        }
    }

    /// Stop accepting events and let in-flight work finish for up to
    /// `timeout`; whatever is still running then is cancelled.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if self.pool.shutdown(timeout) {
            return true;
        }
        let cancelled = self.registry.cancel_all();
        warn!(tasks = cancelled, "Cancelled tasks still running at shutdown");
        self.pool.shutdown(Duration::from_secs(1))
    }
}

impl std::fmt::Debug for TransferPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferPipeline")
            .field("stats", &self.stats())
            .finish()
    }
}
