//! Logging setup for the ferry binary.
//!
//! Two `tracing` layers: a size-rotated log file under `<ferry home>/logs`
//! (no ANSI) and stderr for the console.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "ferry=info,ferry_pipeline=info";
const VERBOSE_LOG_FILTER: &str = "ferry=debug,ferry_pipeline=debug";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for the ferry binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Debug output on the console
    pub verbose: bool,
    /// Override for the log directory (defaults to `logs_dir()`)
    pub log_dir: Option<PathBuf>,
}

/// Initialize tracing with a rotating file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = match config.log_dir {
        Some(dir) => {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            dir
        }
        None => ensure_logs_dir()?,
    };
    let file_writer = SharedRollingWriter::new(log_dir, config.app_name)
        .context("Failed to initialize rolling log writer")?;

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Ferry home directory: `$FERRY_HOME`, else `~/.ferry`.
pub fn ferry_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("FERRY_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .map(|home| home.join(".ferry"))
        .unwrap_or_else(|| PathBuf::from(".ferry"))
}

/// Logs directory: `<ferry home>/logs`
pub fn logs_dir() -> PathBuf {
    ferry_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Log file that rotates to `<name>.log.1 .. <name>.log.<max_files-1>` once
/// it would exceed `max_size`.
struct RollingFile {
    dir: PathBuf,
    base_name: String,
    max_files: usize,
    max_size: u64,
    file: Option<File>,
    written: u64,
}

impl RollingFile {
    fn open(dir: PathBuf, base_name: &str, max_files: usize, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut rolling = Self {
            dir,
            base_name: sanitize_name(base_name),
            max_files: max_files.max(1),
            max_size,
            file: None,
            written: 0,
        };
        rolling.reopen()?;
        if rolling.written > rolling.max_size {
            rolling.rotate()?;
        }
        Ok(rolling)
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.base_name))
    }

    fn archive_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.base_name, index))
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let keep = self.max_files - 1;
        if keep > 0 {
            remove_if_exists(&self.archive_path(keep))?;
            for index in (1..keep).rev() {
                rename_if_exists(&self.archive_path(index), &self.archive_path(index + 1))?;
            }
            rename_if_exists(&self.active_path(), &self.archive_path(1))?;
        } else {
            remove_if_exists(&self.active_path())?;
        }

        self.reopen()
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let bytes = file.write(buf)?;
        self.written += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn rename_if_exists(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// `MakeWriter` handing out guards onto one shared rolling file.
#[derive(Clone)]
struct SharedRollingWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl SharedRollingWriter {
    fn new(dir: PathBuf, base_name: &str) -> Result<Self> {
        let rolling = RollingFile::open(dir, base_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {}", base_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(rolling)),
        })
    }
}

struct SharedRollingWriterGuard {
    inner: Arc<Mutex<RollingFile>>,
}

impl SharedRollingWriterGuard {
    fn lock(&self) -> io::Result<MutexGuard<'_, RollingFile>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRollingWriter {
    type Writer = SharedRollingWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedRollingWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedRollingWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("ferry watch/1"), "ferry_watch_1");
    }

    #[test]
    fn test_rotation_keeps_bounded_archives() {
        let dir = tempfile::tempdir().unwrap();
        let mut rolling = RollingFile::open(dir.path().to_path_buf(), "ferry", 3, 16).unwrap();

        for i in 0..10 {
            rolling.write_all(format!("line {:02} ....\n", i).as_bytes()).unwrap();
        }
        rolling.flush().unwrap();

        assert!(dir.path().join("ferry.log").exists());
        assert!(dir.path().join("ferry.log.1").exists());
        assert!(dir.path().join("ferry.log.2").exists());
        assert!(!dir.path().join("ferry.log.3").exists());

        let active = fs::read_to_string(dir.path().join("ferry.log")).unwrap();
        assert_eq!(active, "line 09 ....\n");
    }

    #[test]
    fn test_reopen_appends_to_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut rolling = RollingFile::open(dir.path().to_path_buf(), "ferry", 5, 1024).unwrap();
            rolling.write_all(b"first\n").unwrap();
        }
        let mut rolling = RollingFile::open(dir.path().to_path_buf(), "ferry", 5, 1024).unwrap();
        rolling.write_all(b"second\n").unwrap();
        rolling.flush().unwrap();

        let active = fs::read_to_string(dir.path().join("ferry.log")).unwrap();
        assert_eq!(active, "first\nsecond\n");
    }
}
