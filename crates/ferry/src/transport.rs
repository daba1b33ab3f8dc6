//! Local-directory transport.
//!
//! Remote logical paths are resolved below a destination root. Files are
//! streamed into a hidden `.<name>.ferry-part` sibling and renamed into
//! place, so readers of the destination never see a partial file.

use ferry_pipeline::{CancellationToken, TransferClient, TransferError};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 64 * 1024;
const PART_SUFFIX: &str = ".ferry-part";

/// Uploads into a directory tree on a local (or mounted) filesystem.
#[derive(Debug, Clone)]
pub struct LocalDirClient {
    root: PathBuf,
}

impl LocalDirClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a remote logical path under the root. `..` is rejected.
    pub fn resolve(&self, remote: &str) -> Result<PathBuf, TransferError> {
        let mut resolved = self.root.clone();
        let mut has_name = false;
        for component in Path::new(remote).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    has_name = true;
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    return Err(TransferError::Rejected(format!(
                        "remote path '{}' escapes the destination root",
                        remote
                    )))
                }
            }
        }
        if !has_name {
            return Err(TransferError::Rejected(format!(
                "remote path '{}' names no file",
                remote
            )));
        }
        Ok(resolved)
    }

    fn copy_into(
        &self,
        local: &Path,
        part: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let mut source = File::open(local)?;
        let mut dest = File::create(part)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut copied = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let n = source.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            dest.write_all(&buffer[..n])?;
            copied += n as u64;
        }
        dest.sync_all()?;
        Ok(copied)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}{}", name, PART_SUFFIX))
}

impl TransferClient for LocalDirClient {
    fn upload(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let dest = self.resolve(remote)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let part = part_path(&dest);
        let copied = match self.copy_into(local, &part, cancel) {
            Ok(copied) => copied,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&part) {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %part.display(), error = %cleanup, "Failed to remove partial upload");
                    }
                }
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&part, &dest) {
            let _ = fs::remove_file(&part);
            return Err(e.into());
        }
        debug!(local = %local.display(), dest = %dest.display(), bytes = copied, "Copied file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_strips_leading_slash() {
        let client = LocalDirClient::new("/dest");
        assert_eq!(
            client.resolve("/upload/a/b.csv").unwrap(),
            PathBuf::from("/dest/upload/a/b.csv")
        );
        assert_eq!(
            client.resolve("upload/./b.csv").unwrap(),
            PathBuf::from("/dest/upload/b.csv")
        );
    }

    #[test]
    fn test_resolve_rejects_parent_components() {
        let client = LocalDirClient::new("/dest");
        assert!(matches!(
            client.resolve("/upload/../../etc/passwd"),
            Err(TransferError::Rejected(_))
        ));
        assert!(matches!(client.resolve("/"), Err(TransferError::Rejected(_))));
    }

    #[test]
    fn test_upload_creates_parents_and_overwrites() {
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("a.csv");
        fs::write(&local, b"first").unwrap();

        let client = LocalDirClient::new(temp.path().join("dest"));
        let cancel = CancellationToken::new();
        client.upload(&local, "/upload/2024/a.csv", &cancel).unwrap();

        let dest = temp.path().join("dest/upload/2024/a.csv");
        assert_eq!(fs::read(&dest).unwrap(), b"first");

        fs::write(&local, b"second version").unwrap();
        client.upload(&local, "/upload/2024/a.csv", &cancel).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"second version");
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn test_upload_large_file_in_chunks() {
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("big.bin");
        let content: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        fs::write(&local, &content).unwrap();

        let client = LocalDirClient::new(temp.path().join("dest"));
        client
            .upload(&local, "big.bin", &CancellationToken::new())
            .unwrap();
        assert_eq!(fs::read(temp.path().join("dest/big.bin")).unwrap(), content);
    }

    #[test]
    fn test_cancelled_upload_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("a.csv");
        fs::write(&local, b"data").unwrap();

        let client = LocalDirClient::new(temp.path().join("dest"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client.upload(&local, "/out/a.csv", &cancel);
        assert!(matches!(result, Err(TransferError::Cancelled)));
        let dest = temp.path().join("dest/out/a.csv");
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn test_missing_source_is_io_error() {
        let temp = TempDir::new().unwrap();
        let client = LocalDirClient::new(temp.path().join("dest"));
        let result = client.upload(
            &temp.path().join("missing.csv"),
            "/out/missing.csv",
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(TransferError::Io(_))));
    }
}
