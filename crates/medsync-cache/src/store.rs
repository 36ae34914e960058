//! Local Cache Store - the durable last-known copy of every entity.
//!
//! Provides:
//! - typed and envelope-level get/put/delete/list keyed by `(kind, id)`
//! - last-writer-wins guarded upserts and remote merges
//! - the pending-write log for writes not yet confirmed remotely
//! - a capped attachment cache with oldest-first eviction under quota
//! - the single-slot current-user pointer

use crate::error::{CacheError, Result};
use crate::pending::PendingWriteLog;
use crate::storage::KeyValueStorage;
use medsync_core::lww::{self, Resolution};
use medsync_core::{BlobId, Entity, EntityId, EntityKind, Envelope, Timestamp, User};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for the local cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix for every storage key this cache owns.
    pub namespace: String,
    /// Attachments larger than this are never cached locally.
    pub max_attachment_bytes: usize,
    /// Eviction never goes below this many cached attachments.
    pub min_retained_attachments: usize,
    /// How long tombstones are kept before they may be purged.
    pub tombstone_retention_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "medsync".to_string(),
            max_attachment_bytes: 512 * 1024,
            min_retained_attachments: 5,
            tombstone_retention_ms: 30 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Result of a guarded local write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// The incoming copy was older than the stored one and was ignored.
    Stale,
}

/// Result of merging one remote copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    KeptLocal,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, MergeOutcome::KeptLocal)
    }
}

/// Snapshot of storage usage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoragePressure {
    pub used_bytes: usize,
    pub quota_bytes: Option<usize>,
    pub cached_attachments: usize,
    pub warnings: usize,
}

pub struct LocalCacheStore {
    storage: Arc<dyn KeyValueStorage>,
    config: CacheConfig,
    pending: PendingWriteLog,
    write_lock: Mutex<()>,
    pressure_warnings: AtomicUsize,
}

impl LocalCacheStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>, config: CacheConfig) -> Self {
        let pending = PendingWriteLog::new(storage.clone(), &config.namespace);
        Self {
            storage,
            config,
            pending,
            write_lock: Mutex::new(()),
            pressure_warnings: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn pending(&self) -> &PendingWriteLog {
        &self.pending
    }

    fn kind_prefix(&self, kind: EntityKind) -> String {
        format!("{}:entity:{}:", self.config.namespace, kind.as_str())
    }

    fn entity_key(&self, kind: EntityKind, id: &EntityId) -> String {
        format!("{}{}", self.kind_prefix(kind), id)
    }

    fn blob_prefix(&self) -> String {
        format!("{}:blob:", self.config.namespace)
    }

    fn blob_key(&self, blob: &BlobId) -> String {
        format!("{}{}", self.blob_prefix(), blob)
    }

    fn current_user_key(&self) -> String {
        format!("{}:session:current_user", self.config.namespace)
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Stored envelope for `(kind, id)`, tombstones included.
    pub fn get_envelope(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Envelope>> {
        match self.storage.get_item(&self.entity_key(kind, id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Live entity by id; tombstoned entities are reported as not found.
    pub fn get<E: Entity>(&self, id: &EntityId) -> Result<E> {
        match self.get_envelope(E::KIND, id)? {
            Some(env) if !env.is_tombstone() => Ok(env.decode()?),
            _ => Err(CacheError::NotFound {
                kind: E::KIND,
                id: id.clone(),
            }),
        }
    }

    pub fn contains(&self, kind: EntityKind, id: &EntityId) -> Result<bool> {
        Ok(self
            .get_envelope(kind, id)?
            .is_some_and(|env| !env.is_tombstone()))
    }

    /// Every stored envelope of `kind`, tombstones included.
    pub fn list_envelopes(&self, kind: EntityKind) -> Result<Vec<Envelope>> {
        let mut out = Vec::new();
        for key in self.storage.keys_with_prefix(&self.kind_prefix(kind))? {
            if let Some(raw) = self.storage.get_item(&key)? {
                out.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(out)
    }

    /// Live entities of type `E` matching `predicate`.
    pub fn list<E, P>(&self, predicate: P) -> Result<Vec<E>>
    where
        E: Entity,
        P: Fn(&E) -> bool,
    {
        let mut out = Vec::new();
        for env in self.list_envelopes(E::KIND)? {
            if env.is_tombstone() {
                continue;
            }
            let entity: E = env.decode()?;
            if predicate(&entity) {
                out.push(entity);
            }
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    fn write_envelope(&self, env: &Envelope) -> Result<()> {
        let key = self.entity_key(env.kind, &env.id);
        let raw = serde_json::to_string(env)?;
        self.with_eviction(|| Ok(self.storage.set_item(&key, &raw)?))
    }

    /// Upsert unless the stored copy is newer.
    pub fn put_envelope(&self, env: &Envelope) -> Result<PutOutcome> {
        let _guard = self.write_lock.lock();
        self.put_envelope_locked(env)
    }

    fn put_envelope_locked(&self, env: &Envelope) -> Result<PutOutcome> {
        let existing = self.get_envelope(env.kind, &env.id)?;
        if !lww::accepts(existing.map(|e| e.updated_at), env.updated_at) {
            debug!(kind = %env.kind, id = %env.id, "ignoring stale local write");
            return Ok(PutOutcome::Stale);
        }
        self.write_envelope(env)?;
        Ok(PutOutcome::Written)
    }

    pub fn put<E: Entity>(&self, entity: &E) -> Result<PutOutcome> {
        self.put_envelope(&Envelope::from_entity(entity)?)
    }

    /// Write a local edit and remember it until the remote confirms it.
    pub fn write_local(&self, env: &Envelope) -> Result<PutOutcome> {
        let _guard = self.write_lock.lock();
        let previous = self.get_envelope(env.kind, &env.id)?;
        let outcome = self.put_envelope_locked(env)?;
        if outcome == PutOutcome::Written {
            if let Err(e) = self.with_eviction(|| self.pending.record(env)) {
                // Without a pending entry the write would never be pushed.
                self.restore(env, previous)?;
                return Err(e);
            }
        }
        Ok(outcome)
    }

    fn restore(&self, env: &Envelope, previous: Option<Envelope>) -> Result<()> {
        match previous {
            Some(previous) => self.write_envelope(&previous),
            None => Ok(self.storage.remove_item(&self.entity_key(env.kind, &env.id))?),
        }
    }

    /// Merge a remote copy using last-writer-wins.
    ///
    /// A pending local write is confirmed whenever the remote copy carries an
    /// equal-or-later timestamp, whichever copy ends up stored.
    pub fn merge_remote(&self, remote: &Envelope) -> Result<MergeOutcome> {
        let _guard = self.write_lock.lock();
        let existing = self.get_envelope(remote.kind, &remote.id)?;
        let outcome = match (
            &existing,
            lww::resolve(existing.as_ref().map(|e| e.updated_at), remote.updated_at),
        ) {
            (_, Resolution::KeepLocal) => MergeOutcome::KeptLocal,
            (None, Resolution::TakeRemote) => MergeOutcome::Inserted,
            (Some(_), Resolution::TakeRemote) => MergeOutcome::Replaced,
        };
        if outcome.changed() {
            self.write_envelope(remote)?;
        }
        self.pending
            .confirm(remote.kind, &remote.id, remote.updated_at)?;
        Ok(outcome)
    }

    /// Put back exactly what was stored before, bypassing the merge rule.
    pub fn rollback(&self, kind: EntityKind, id: &EntityId, previous: Option<Envelope>) -> Result<()> {
        let _guard = self.write_lock.lock();
        match previous {
            Some(previous) => self.write_envelope(&previous),
            None => Ok(self.storage.remove_item(&self.entity_key(kind, id))?),
        }
    }

    /// Replace the entity with a tombstone stamped `at`.
    pub fn delete(&self, kind: EntityKind, id: &EntityId, at: Timestamp) -> Result<PutOutcome> {
        let tombstone = match self.get_envelope(kind, id)? {
            Some(existing) => existing.deleted_at(at),
            None => Envelope::tombstone(kind, id.clone(), at),
        };
        self.write_local(&tombstone)
    }

    /// Remove the entity and any pending write for it outright.
    pub fn purge(&self, kind: EntityKind, id: &EntityId) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.storage.remove_item(&self.entity_key(kind, id))?;
        self.pending.discard(kind, id)
    }

    /// Hard-remove tombstones older than the retention window.
    ///
    /// Tombstones with unconfirmed pending writes are kept.
    pub fn purge_tombstones(&self, now: Timestamp) -> Result<usize> {
        let retention = chrono::Duration::milliseconds(self.config.tombstone_retention_ms as i64);
        let cutoff = now - retention;
        let mut purged = 0;
        for kind in EntityKind::ALL {
            for env in self.list_envelopes(kind)? {
                if env.is_tombstone()
                    && env.updated_at < cutoff
                    && self.pending.get(kind, &env.id)?.is_none()
                {
                    self.storage.remove_item(&self.entity_key(kind, &env.id))?;
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            info!(purged, "purged expired tombstones");
        }
        Ok(purged)
    }

    // ---------------------------------------------------------------------
    // Current user slot
    // ---------------------------------------------------------------------

    pub fn set_current_user(&self, user: &User) -> Result<()> {
        self.put(user)?;
        let key = self.current_user_key();
        self.with_eviction(|| Ok(self.storage.set_item(&key, user.id.as_str())?))
    }

    pub fn current_user(&self) -> Result<Option<User>> {
        let Some(id) = self.storage.get_item(&self.current_user_key())? else {
            return Ok(None);
        };
        match self.get::<User>(&EntityId::from_string(id)) {
            Ok(user) => Ok(Some(user)),
            Err(CacheError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn clear_current_user(&self) -> Result<()> {
        Ok(self.storage.remove_item(&self.current_user_key())?)
    }

    // ---------------------------------------------------------------------
    // Attachments
    // ---------------------------------------------------------------------

    /// Cache an attachment payload. Returns `false` if it exceeds the cap.
    pub fn cache_attachment(&self, blob: &BlobId, data: &str) -> Result<bool> {
        if data.len() > self.config.max_attachment_bytes {
            debug!(blob = %blob, bytes = data.len(), "attachment too large to cache");
            return Ok(false);
        }
        let _guard = self.write_lock.lock();
        let key = self.blob_key(blob);
        self.with_eviction(|| Ok(self.storage.set_item(&key, data)?))?;
        Ok(true)
    }

    pub fn attachment(&self, blob: &BlobId) -> Result<Option<String>> {
        Ok(self.storage.get_item(&self.blob_key(blob))?)
    }

    pub fn remove_attachment(&self, blob: &BlobId) -> Result<()> {
        Ok(self.storage.remove_item(&self.blob_key(blob))?)
    }

    /// Cached attachment keys, oldest (by id creation time) first.
    fn attachments_oldest_first(&self) -> Result<Vec<String>> {
        let prefix = self.blob_prefix();
        let mut keys = self.storage.keys_with_prefix(&prefix)?;
        keys.sort_by_key(|key| {
            BlobId(key[prefix.len()..].to_string())
                .created_at_ms()
                .unwrap_or(0)
        });
        Ok(keys)
    }

    /// Run `op`, evicting the oldest cached attachment on each quota failure
    /// until it succeeds or only the minimum retained count is left.
    fn with_eviction<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut evicted = 0;
        loop {
            match op() {
                Err(CacheError::Quota { .. }) => {
                    let attachments = self.attachments_oldest_first()?;
                    if attachments.len() <= self.config.min_retained_attachments {
                        self.pressure_warnings.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            evicted,
                            retained = attachments.len(),
                            used_bytes = self.storage.used_bytes(),
                            "local storage is full"
                        );
                        return Err(CacheError::Quota {
                            evicted,
                            retained: attachments.len(),
                        });
                    }
                    self.storage.remove_item(&attachments[0])?;
                    evicted += 1;
                    debug!(key = %attachments[0], "evicted cached attachment");
                }
                Ok(value) => {
                    if evicted > 0 {
                        info!(evicted, "evicted cached attachments to free local storage");
                    }
                    return Ok(value);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn pressure(&self) -> Result<StoragePressure> {
        Ok(StoragePressure {
            used_bytes: self.storage.used_bytes(),
            quota_bytes: self.storage.quota_bytes(),
            cached_attachments: self.storage.keys_with_prefix(&self.blob_prefix())?.len(),
            warnings: self.pressure_warnings.load(Ordering::Relaxed),
        })
    }
}
