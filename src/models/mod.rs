// src/models/mod.rs

//! Domain models for the sync subsystem.
//!
//! This module contains all data structures used throughout the crate,
//! organized by their primary purpose.

mod collection;
mod config;
mod content_hash;
mod document;
mod record;
mod tombstone;
mod verdict;

// Re-export all public types
pub use collection::Collection;
pub use config::{CacheConfig, Config, LoggingConfig, QualityConfig, RetryConfig, SyncConfig};
pub use content_hash::{ContentHash, HASH_HEX_LEN};
pub use document::{Document, RESERVED_ID_FIELD, SYNC_STATUS_FIELD};
pub use record::{FieldMap, MAX_VALIDATION_SCORE, Record, SyncStatus};
pub use tombstone::Tombstone;
pub use verdict::{QualityClass, QualityReport, ValidationVerdict};
