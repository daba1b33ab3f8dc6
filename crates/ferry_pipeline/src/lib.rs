//! Ferry Pipeline - Change-to-Transfer Core
//!
//! Turns "file created/changed" events into exactly one completed transfer
//! per distinct file state, surviving restarts through a durable ledger.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────────┐
//! │   Watcher   │──▶│ TaskRegistry │──▶│ WorkerPool │──▶│ Ledger gate │──▶│ Stability    │
//! │ (FileEvent) │   │ (1 per file) │   │ (bounded)  │   │ (hash+mtime)│   │ gate (large) │
//! └─────────────┘   └──────────────┘   └────────────┘   └─────────────┘   └──────┬───────┘
//!                                                                                 │
//!                                      ┌────────────┐   ┌──────────────┐          │
//!                                      │   Ledger   │◀──│ Transfer     │◀─────────┘
//!                                      │  .record   │   │ Client       │
//!                                      └────────────┘   └──────────────┘
//! ```
//!
//! # Core Concepts
//!
//! - **FileMapping**: pattern + source root → target root
//! - **Coalescing**: a newer event for a file cancels the older task
//! - **Stability gating**: large files must stop changing before transfer
//! - **Ledger**: content-addressed record of what was already sent

pub mod cancel;
pub mod config;
pub mod error;
pub mod ledger;
pub mod mapping;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod stability;
pub mod transfer;

// Re-exports for convenience
pub use cancel::CancellationToken;
pub use config::{LedgerConfig, PipelineConfig, PoolConfig, StabilityConfig};
pub use error::{PipelineError, Result, TransferError};
pub use ledger::{FileFingerprint, IdentityPolicy, ProcessedFileLedger, ProcessedRecord};
pub use mapping::{FileEvent, FileKey, FileMapping};
pub use pipeline::{PipelineStats, TransferPipeline};
pub use pool::{Dispatch, PoolStats, WorkerPool};
pub use registry::{Registration, TaskHandle, TaskOutcome, TaskRegistry};
pub use stability::{Stability, StabilityDetector};
pub use transfer::TransferClient;
