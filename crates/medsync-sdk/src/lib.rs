//! MedSync SDK - offline-resilient synchronization for a medical-records client
//!
//! The SDK keeps a local cache authoritative for reads, tracks whether the
//! remote document store is reachable, escalates through recovery strategies
//! when it is not, and reconciles local and remote copies without losing or
//! duplicating writes made while disconnected.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use medsync_sdk::prelude::*;
//!
//! let setup = quick::memory_client(ClientConfig::default());
//! setup.client.start().await?;
//!
//! let vault = setup.client.vault();
//! vault.login(user).await?;
//! let record = vault
//!     .save_record(NewRecord::new("Blood panel", "lab_result", date))
//!     .await?;
//! ```
//!
//! # Architecture
//!
//! - [`coordinator`] - single source of truth for "are we online"; remote
//!   client initialization, probing and reinitialization
//! - [`strategy`] / [`escalator`] - the recovery ladder and its driver
//! - [`sync`] - pull/merge, push with duplicate detection, pending flush
//! - [`vault`] - record, sharing and audit operations
//! - [`client`] - wires the above together
//! - [`remote`], [`blob`], [`connectivity`], [`notify`], [`clock`] - the
//!   boundaries to the outside world, with in-memory implementations
//! - [`error`] - the failure taxonomy

pub mod blob;
pub mod client;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod escalator;
pub mod memory;
pub mod notify;
pub mod remote;
pub mod strategy;
pub mod sync;
pub mod timeout;
pub mod vault;

// Re-exports for convenience
pub use blob::{BlobStore, MemoryBlobStore};
pub use client::{quick, Client, ClientBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, ClientConfigBuilder, CoordinatorConfig, EscalatorConfig};
pub use connectivity::{ConnectivityEvent, ConnectivitySource, ManualConnectivity};
pub use coordinator::{
    ConnectionCoordinator, ConnectionPhase, ConnectionState, CoordinatorEvent, ReinitOverrides,
};
pub use error::{FailureClass, RemoteError, Result, SyncError};
pub use escalator::{EscalationEvent, ResolutionEscalator};
pub use memory::{MemoryBackend, MemoryRemote, MemoryRemoteFactory};
pub use notify::{LogNotifier, Notification, Notifier, NotifyKind, RecordingNotifier, RecoveryAction};
pub use remote::{
    Direction, EmulatorEndpoint, Filter, FilterOp, Query, RemoteDocument, RemoteSettings,
    RemoteStore, RemoteStoreFactory, TransportMode,
};
pub use strategy::{BuiltinStrategy, RecoveryStrategy};
pub use sync::{
    FlushReport, PullScope, SyncConfig, SyncConfigBuilder, SyncEvent, SyncReport, Synchronizer,
};
pub use timeout::{with_timeout, Timed};
pub use vault::{NewRecord, Vault};

// Re-export the entity model and cache types callers work with directly
pub use medsync_cache::{CacheConfig, FileStorage, KeyValueStorage, LocalCacheStore, MemoryStorage};
pub use medsync_core::{
    AuditAction, AuditEntry, BlobId, Entity, EntityId, EntityKind, Envelope, Record,
    SharePermission, ShareGrant, Timestamp, User, UserRole,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{quick, Client, ClientBuilder};
    pub use crate::config::ClientConfig;
    pub use crate::error::SyncError;
    pub use crate::vault::{NewRecord, Vault};
    pub use medsync_core::{AuditAction, EntityId, Record, SharePermission, User, UserRole};
}
