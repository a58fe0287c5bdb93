//! # Coffer Core
//!
//! The local-first storage and encryption core of the Coffer finance
//! tracker.
//!
//! This crate provides:
//! - A keyed, indexed, transactional record store (embedded SQLite), one
//!   table per entity kind
//! - Change tracking: every local write marks its record pending until the
//!   sync engine confirms it with the remote authority
//! - A field crypto codec protecting the sensitive field subset at rest
//!   (AES-256-GCM), with graceful pass-through while no key is unlocked
//! - A retention collector that permanently erases confirmed tombstones
//! - An integrity auditor for orphaned references, stale active flags, and
//!   implausible dates
//!
//! ## Key invariants
//!
//! - Record ids are client-generated, immutable, never reused
//! - `pending_sync` is set by every local write and cleared only by the sync
//!   engine, and only for the exact acknowledged state
//! - Sensitive fields are never persisted in plaintext while a key is
//!   unlocked; they exist in plaintext only transiently in memory
//! - A tombstone is erased only once confirmed synced and older than the
//!   retention window

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod codec;
pub mod crypto;
mod error;
pub mod ledger;
pub mod record;
pub mod retention;
pub mod store;

pub use audit::{FixStrategy, IntegrityAuditor, Issue};
pub use codec::{FieldCodec, FieldDecodeFailure, TOKEN_PREFIX};
pub use crypto::{CryptoManager, EncryptionKey, KeyProvider, StaticKeyProvider};
pub use error::{CoreError, CoreResult};
pub use ledger::Ledger;
pub use record::{parse_field_date, EntityKind, Record};
pub use retention::{RetentionCollector, SweepReport, DEFAULT_RETENTION_DAYS};
pub use store::{DecodedRecord, RecordStore};
