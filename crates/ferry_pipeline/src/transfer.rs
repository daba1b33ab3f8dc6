//! Boundary to the remote transport.

use std::path::Path;

use crate::cancel::CancellationToken;
use crate::error::TransferError;

/// Moves one local file to a remote logical path.
///
/// Implementations must create missing remote parent directories and
/// overwrite an existing destination. Failures are not retried by the
/// pipeline. `cancel` should be consulted between chunks so a superseded
/// task stops promptly; a partially written destination is acceptable.
pub trait TransferClient: Send + Sync {
    fn upload(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), TransferError>;
}

impl<T: TransferClient + ?Sized> TransferClient for std::sync::Arc<T> {
    fn upload(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), TransferError> {
        (**self).upload(local, remote, cancel)
    }
}
