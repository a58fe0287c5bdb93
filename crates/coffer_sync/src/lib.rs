//! Synchronization engine for coffer stores.
//!
//! Reconciles a local [`coffer_core::RecordStore`] with a remote authority
//! over a pluggable transport. A sync cycle pushes pending local records,
//! pulls remote changes per table, and reconciles conflicts with a
//! deterministic policy (tombstone precedence, then last-writer-wins).
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use coffer_core::{FieldCodec, RecordStore};
//! use coffer_sync::{CycleOutcome, MemoryAuthority, SyncConfig, SyncEngine};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RecordStore::open_in_memory(FieldCodec::passthrough())?);
//! let engine = SyncEngine::new(store, MemoryAuthority::new(), SyncConfig::new());
//!
//! match engine.trigger_sync()? {
//!     CycleOutcome::Completed(result) => assert!(result.success),
//!     CycleOutcome::Coalesced => {}
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod conflict;
pub mod engine;
pub mod remote;
pub mod state;

mod error;

pub use config::{RetryConfig, SyncConfig};
pub use conflict::Resolution;
pub use engine::{CycleOutcome, CycleResult, RejectedPush, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use remote::{MemoryAuthority, PullBatch, PushOutcome, RemoteAuthority, RemoteRecord};
pub use state::{SyncState, SyncStats};
