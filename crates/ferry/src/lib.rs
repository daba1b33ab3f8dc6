//! Ferry - watch directories and ferry files to a destination
//!
//! Wires the `ferry_pipeline` core to concrete edges: a TOML config with a
//! mapping file, a polling directory watcher as the event source, and a
//! local-directory `TransferClient`.

pub mod config;
pub mod error;
pub mod transport;
pub mod watcher;

pub use config::FerryConfig;
pub use error::{FerryError, Result};
pub use transport::LocalDirClient;
pub use watcher::{mapping_for, PollingWatcher};
