//! # medsync-cache
//!
//! Local persistence for the MedSync client.
//!
//! This crate provides:
//! - A synchronous string key/value storage boundary with quota
//!   ([`MemoryStorage`], [`FileStorage`])
//! - The Local Cache Store: last known copy of every entity, served first
//!   on every read
//! - The pending-write log of local writes awaiting remote confirmation
//! - Attachment caching with oldest-first eviction under storage pressure
//!
//! ## Example
//!
//! ```rust,ignore
//! use medsync_cache::{CacheConfig, LocalCacheStore, MemoryStorage};
//! use std::sync::Arc;
//!
//! let cache = LocalCacheStore::new(Arc::new(MemoryStorage::new()), CacheConfig::default());
//! cache.put(&record)?;
//! let again: Record = cache.get(&record.id)?;
//! ```

pub mod error;
pub mod pending;
pub mod storage;
pub mod store;

pub use error::{CacheError, Result, StorageError};
pub use pending::{PendingWrite, PendingWriteLog};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use store::{CacheConfig, LocalCacheStore, MergeOutcome, PutOutcome, StoragePressure};
