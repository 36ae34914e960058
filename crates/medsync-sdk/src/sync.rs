//! Synchronizer - reconciles the local cache with the remote store.
//!
//! Pulls merge remote copies with last-writer-wins (ties keep the local
//! copy) and are all-or-nothing: a pull that fails part way puts back what
//! it already changed. Pushes never overwrite a remote copy with a later
//! `updated_at`; they merge it instead. They run a natural-key duplicate
//! check before writing, and a failed push leaves the local write and its
//! pending entry in place.

use crate::coordinator::ConnectionCoordinator;
use crate::error::{RemoteError, Result, SyncError};
use crate::escalator::ResolutionEscalator;
use crate::notify::{Notification, Notifier, NotifyKind};
use crate::remote::{Filter, Query, RemoteStore};
use crate::timeout::{with_timeout, Timed};
use futures::stream::{self, StreamExt};
use medsync_cache::{LocalCacheStore, PendingWrite};
use medsync_core::{Entity, EntityId, EntityKind, Envelope};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Configuration for sync behavior.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Timeout for a single remote call (in milliseconds).
    pub request_timeout_ms: u64,
    /// Maximum pending writes pushed concurrently during a flush.
    pub push_concurrency: usize,
    /// Run opportunistic syncs after local reads and writes.
    pub background_sync: bool,
    /// Flush and pull when the coordinator comes back online.
    pub sync_on_reconnect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            push_concurrency: 4,
            background_sync: true,
            sync_on_reconnect: true,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn request_timeout(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn push_concurrency(mut self, n: usize) -> Self {
        self.config.push_concurrency = n;
        self
    }

    pub fn background_sync(mut self, enabled: bool) -> Self {
        self.config.background_sync = enabled;
        self
    }

    pub fn sync_on_reconnect(mut self, enabled: bool) -> Self {
        self.config.sync_on_reconnect = enabled;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Events emitted by the synchronizer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    Pulled { kind: EntityKind, merged: usize },
    Pushed { kind: EntityKind, id: EntityId },
    PushFailed { kind: EntityKind, id: EntityId, error: String },
    /// A later remote copy replaced a pending local write.
    Superseded { kind: EntityKind, id: EntityId },
    DuplicateSkipped {
        kind: EntityKind,
        id: EntityId,
        existing: EntityId,
    },
    Flushed(FlushReport),
}

/// Outcome of flushing the pending write log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub pushed: usize,
    /// Pending writes already beaten by a later remote copy, merged locally.
    pub superseded: usize,
    pub failed: usize,
    /// New entities discarded in favour of a remote one with the same natural key.
    pub duplicates: usize,
    /// Edits of remote entities that now collide with another entity's
    /// natural key; they stay pending.
    pub conflicts: usize,
    /// Pending entries whose local copy no longer exists.
    pub dropped: usize,
}

/// What happened to one pushed envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
enum PushOutcome {
    Written,
    Superseded,
    Duplicate {
        existing: EntityId,
        stored_remotely: bool,
    },
}

/// One `(kind, filters)` pair pulled by [`Synchronizer::sync_now`].
#[derive(Clone, Debug, PartialEq)]
pub struct PullScope {
    pub kind: EntityKind,
    pub filters: Vec<Filter>,
}

impl PullScope {
    pub fn new(kind: EntityKind, filters: Vec<Filter>) -> Self {
        Self { kind, filters }
    }
}

/// Outcome of a full sync pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub flush: FlushReport,
    pub merged: usize,
}

pub struct Synchronizer {
    cache: Arc<LocalCacheStore>,
    coordinator: Arc<ConnectionCoordinator>,
    escalator: Option<Arc<ResolutionEscalator>>,
    notifier: Arc<dyn Notifier>,
    config: SyncConfig,
    scopes: RwLock<Vec<PullScope>>,
    sync_running: AtomicBool,
    sync_requested: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

impl Synchronizer {
    pub fn new(
        cache: Arc<LocalCacheStore>,
        coordinator: Arc<ConnectionCoordinator>,
        escalator: Option<Arc<ResolutionEscalator>>,
        notifier: Arc<dyn Notifier>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            cache,
            coordinator,
            escalator,
            notifier,
            config,
            scopes: RwLock::new(Vec::new()),
            sync_running: AtomicBool::new(false),
            sync_requested: AtomicBool::new(false),
            events,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<LocalCacheStore> {
        &self.cache
    }

    pub fn coordinator(&self) -> &Arc<ConnectionCoordinator> {
        &self.coordinator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Replace what `sync_now` pulls.
    pub fn set_scopes(&self, scopes: Vec<PullScope>) {
        *self.scopes.write() = scopes;
    }

    pub fn scopes(&self) -> Vec<PullScope> {
        self.scopes.read().clone()
    }

    // ---------------------------------------------------------------------
    // Remote calls
    // ---------------------------------------------------------------------

    /// Run a remote call under the request timeout, classify its failure and
    /// hand transport/auth failures to the escalator in the background.
    async fn remote_call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let err = match with_timeout(self.config.request_timeout(), fut).await {
            Timed::Completed(Ok(value)) => return Ok(value),
            Timed::Completed(Err(e)) => SyncError::from(e),
            Timed::TimedOut => SyncError::Timeout(self.config.request_timeout()),
        };
        self.escalate(&err);
        Err(err)
    }

    fn escalate(&self, err: &SyncError) {
        let Some(escalator) = &self.escalator else {
            return;
        };
        if err.failure_class().is_none() {
            return;
        }
        let escalator = escalator.clone();
        let err = err.clone();
        tokio::spawn(async move {
            match escalator.resolve(&err).await {
                Ok(recovered) => debug!(recovered, "escalation finished"),
                Err(e) => debug!(error = %e, "escalation rejected error"),
            }
        });
    }

    // ---------------------------------------------------------------------
    // Pull
    // ---------------------------------------------------------------------

    /// Fetch remote entities of `kind` matching `filters` and merge them.
    ///
    /// Returns how many local entries changed. On failure the cache is left
    /// as it was before the call.
    pub async fn pull(&self, kind: EntityKind, filters: Vec<Filter>) -> Result<usize> {
        let client = self.coordinator.online_client()?;
        let query = Query {
            collection: kind.collection().to_string(),
            filters,
            order_by: None,
            limit: None,
        };
        let docs = self.remote_call(client.query(&query)).await?;

        let envelopes = docs
            .iter()
            .map(|doc| Envelope::from_document(kind, &doc.id, &doc.data))
            .collect::<std::result::Result<Vec<_>, _>>()
            .inspect_err(|e| warn!(kind = %kind, error = %e, "pull returned an undecodable document"))?;

        let mut applied: Vec<(EntityId, Option<Envelope>)> = Vec::new();
        for env in &envelopes {
            let merged = self
                .cache
                .get_envelope(kind, &env.id)
                .and_then(|previous| Ok((self.cache.merge_remote(env)?, previous)));
            match merged {
                Ok((outcome, previous)) if outcome.changed() => {
                    applied.push((env.id.clone(), previous));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(kind = %kind, id = %env.id, error = %e, "merge failed; rolling back pull");
                    self.rollback(kind, applied);
                    return Err(e.into());
                }
            }
        }

        let merged = applied.len();
        debug!(kind = %kind, fetched = envelopes.len(), merged, "pull complete");
        let _ = self.events.send(SyncEvent::Pulled { kind, merged });
        Ok(merged)
    }

    fn rollback(&self, kind: EntityKind, applied: Vec<(EntityId, Option<Envelope>)>) {
        for (id, previous) in applied.into_iter().rev() {
            if let Err(e) = self.cache.rollback(kind, &id, previous) {
                warn!(kind = %kind, id = %id, error = %e, "rollback failed");
            }
        }
    }

    /// Fetch one entity from the remote store and merge it.
    ///
    /// Returns the stored copy after the merge.
    pub async fn fetch_one(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Envelope>> {
        let client = self.coordinator.online_client()?;
        let Some(doc) = self
            .remote_call(client.get(kind.collection(), id.as_str()))
            .await?
        else {
            return Ok(None);
        };
        let env = Envelope::from_document(kind, &doc.id, &doc.data)?;
        self.cache.merge_remote(&env)?;
        Ok(self.cache.get_envelope(kind, id)?)
    }

    // ---------------------------------------------------------------------
    // Push
    // ---------------------------------------------------------------------

    /// Remote entity sharing `env`'s natural key under a different id.
    async fn find_duplicate(
        &self,
        client: &Arc<dyn RemoteStore>,
        env: &Envelope,
    ) -> Result<Option<EntityId>> {
        let Some(key) = env.natural_key() else {
            return Ok(None);
        };
        let mut query = Query::collection(env.kind.collection());
        for (field, value) in key.fields {
            query = query.where_eq(field, value);
        }
        let matches = self.remote_call(client.query(&query)).await?;
        Ok(matches
            .into_iter()
            .find(|doc| doc.id != env.id.as_str() && !is_deleted(&doc.data))
            .map(|doc| EntityId::from_string(doc.id)))
    }

    /// Remote entity sharing `env`'s natural key under a different id.
    ///
    /// Fails with [`SyncError::Offline`] when no remote call can be made.
    pub async fn check_duplicate(&self, env: &Envelope) -> Result<Option<EntityId>> {
        let client = self.coordinator.online_client()?;
        self.find_duplicate(&client, env).await
    }

    /// Push a stored envelope.
    ///
    /// A natural-key collision returns [`SyncError::Duplicate`] without
    /// writing. A remote copy with a later `updated_at` is merged instead of
    /// overwritten. Other failures are counted against the pending entry,
    /// which stays in the log.
    pub async fn push_envelope(&self, env: &Envelope) -> Result<()> {
        match self.push_tracked(env).await? {
            PushOutcome::Duplicate { existing, .. } => Err(SyncError::Duplicate {
                kind: env.kind,
                existing,
            }),
            PushOutcome::Written | PushOutcome::Superseded => Ok(()),
        }
    }

    async fn push_tracked(&self, env: &Envelope) -> Result<PushOutcome> {
        let result = self.try_push(env).await;
        match &result {
            Ok(PushOutcome::Written) => {
                debug!(kind = %env.kind, id = %env.id, "pushed");
                let _ = self.events.send(SyncEvent::Pushed {
                    kind: env.kind,
                    id: env.id.clone(),
                });
            }
            Ok(PushOutcome::Superseded) => {
                debug!(kind = %env.kind, id = %env.id, "remote copy is newer; kept it");
                let _ = self.events.send(SyncEvent::Superseded {
                    kind: env.kind,
                    id: env.id.clone(),
                });
            }
            Ok(PushOutcome::Duplicate { .. }) => {}
            Err(e) => {
                debug!(kind = %env.kind, id = %env.id, error = %e, "push failed");
                self.cache
                    .pending()
                    .note_failure(env.kind, &env.id, &e.to_string())?;
                let _ = self.events.send(SyncEvent::PushFailed {
                    kind: env.kind,
                    id: env.id.clone(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn try_push(&self, env: &Envelope) -> Result<PushOutcome> {
        let client = self.coordinator.online_client()?;
        let stored = match self
            .remote_call(client.get(env.kind.collection(), env.id.as_str()))
            .await?
        {
            Some(doc) => Some(Envelope::from_document(env.kind, &doc.id, &doc.data)?),
            None => None,
        };
        if let Some(remote) = &stored {
            if remote.updated_at >= env.updated_at {
                // Equal means this write already landed; later means it lost.
                self.cache.merge_remote(remote)?;
                return Ok(if remote.updated_at > env.updated_at {
                    PushOutcome::Superseded
                } else {
                    PushOutcome::Written
                });
            }
        }
        if !env.is_tombstone() {
            if let Some(existing) = self.find_duplicate(&client, env).await? {
                return Ok(PushOutcome::Duplicate {
                    existing,
                    stored_remotely: stored.is_some(),
                });
            }
        }
        self.remote_call(client.set(env.kind.collection(), env.id.as_str(), env.to_document(), false))
            .await?;
        self.cache.pending().confirm(env.kind, &env.id, env.updated_at)?;
        Ok(PushOutcome::Written)
    }

    /// Push a typed entity.
    pub async fn push<E: Entity>(&self, entity: &E) -> Result<()> {
        self.push_envelope(&Envelope::from_entity(entity)?).await
    }

    // ---------------------------------------------------------------------
    // Flush
    // ---------------------------------------------------------------------

    /// Push every pending write, a few at a time, in no particular order.
    pub async fn flush_pending(&self) -> Result<FlushReport> {
        if !self.coordinator.is_online() {
            return Err(SyncError::Offline);
        }
        let entries = self.cache.pending().entries()?;
        if entries.is_empty() {
            return Ok(FlushReport::default());
        }
        debug!(pending = entries.len(), "flushing pending writes");

        let results: Vec<(PendingWrite, Result<Option<PushOutcome>>)> = stream::iter(entries)
            .map(|entry| async move {
                let result = self.flush_one(&entry).await;
                (entry, result)
            })
            .buffer_unordered(self.config.push_concurrency.max(1))
            .collect()
            .await;

        let mut report = FlushReport::default();
        for (entry, result) in results {
            match result {
                Ok(Some(PushOutcome::Written)) => report.pushed += 1,
                Ok(Some(PushOutcome::Superseded)) => report.superseded += 1,
                Ok(Some(PushOutcome::Duplicate {
                    existing,
                    stored_remotely: false,
                })) => {
                    self.discard_duplicate(&entry, existing).await?;
                    report.duplicates += 1;
                }
                Ok(Some(PushOutcome::Duplicate {
                    existing,
                    stored_remotely: true,
                })) => {
                    warn!(kind = %entry.kind, id = %entry.id, existing = %existing, "edit collides with another entity; kept pending");
                    report.conflicts += 1;
                }
                Ok(None) => report.dropped += 1,
                Err(_) => report.failed += 1,
            }
        }

        if report.pushed + report.superseded + report.duplicates + report.conflicts + report.failed > 0 {
            info!(
                pushed = report.pushed,
                superseded = report.superseded,
                failed = report.failed,
                duplicates = report.duplicates,
                conflicts = report.conflicts,
                "flushed pending writes"
            );
        }
        let _ = self.events.send(SyncEvent::Flushed(report.clone()));
        Ok(report)
    }

    /// Returns `None` when there was nothing left to push.
    async fn flush_one(&self, entry: &PendingWrite) -> Result<Option<PushOutcome>> {
        match self.cache.get_envelope(entry.kind, &entry.id)? {
            Some(env) => self.push_tracked(&env).await.map(Some),
            None => {
                self.cache.pending().discard(entry.kind, &entry.id)?;
                Ok(None)
            }
        }
    }

    /// Drop a local entity that was never stored remotely and duplicates an
    /// existing remote one, and pull the remote one in its place.
    async fn discard_duplicate(&self, entry: &PendingWrite, existing: EntityId) -> Result<()> {
        info!(kind = %entry.kind, id = %entry.id, existing = %existing, "discarding duplicate local write");
        self.cache.purge(entry.kind, &entry.id)?;
        if let Err(e) = self.fetch_one(entry.kind, &existing).await {
            debug!(error = %e, "could not fetch existing entity after duplicate");
        }
        self.notifier.notify(Notification::new(
            NotifyKind::Info,
            "Duplicate skipped",
            format!(
                "A matching {} already exists; the offline copy was not uploaded.",
                entry.kind
            ),
        ));
        let _ = self.events.send(SyncEvent::DuplicateSkipped {
            kind: entry.kind,
            id: entry.id.clone(),
            existing,
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Full and background sync
    // ---------------------------------------------------------------------

    /// Flush pending writes, then pull every configured scope.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let flush = self.flush_pending().await?;
        let mut merged = 0;
        for scope in self.scopes() {
            merged += self.pull(scope.kind, scope.filters).await?;
        }
        Ok(SyncReport { flush, merged })
    }

    /// Start a sync in the background if online; never blocks the caller.
    ///
    /// Requests made while a sync runs are coalesced into one more pass.
    pub fn schedule_background_sync(self: &Arc<Self>) {
        if !self.config.background_sync || !self.coordinator.is_online() {
            return;
        }
        self.sync_requested.store(true, Ordering::SeqCst);
        if self.sync_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            while this.sync_requested.swap(false, Ordering::SeqCst) {
                match this.sync_now().await {
                    Ok(report) => debug!(merged = report.merged, "background sync complete"),
                    Err(e) => debug!(error = %e, "background sync failed"),
                }
            }
            this.sync_running.store(false, Ordering::SeqCst);
            if this.sync_requested.load(Ordering::SeqCst) {
                this.schedule_background_sync();
            }
        });
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_running.load(Ordering::SeqCst)
    }

    /// Wait until no background sync is running.
    pub async fn wait_idle(&self) {
        while self.is_syncing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn is_deleted(data: &Value) -> bool {
    data.get("deleted").and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::connectivity::ManualConnectivity;
    use crate::memory::{MemoryBackend, MemoryRemoteFactory};
    use crate::notify::RecordingNotifier;
    use crate::remote::RemoteSettings;
    use chrono::{NaiveDate, TimeZone, Utc};
    use medsync_cache::{CacheConfig, MemoryStorage};
    use medsync_core::Record;

    struct Harness {
        backend: Arc<MemoryBackend>,
        notifier: Arc<RecordingNotifier>,
        sync: Arc<Synchronizer>,
    }

    async fn harness() -> Harness {
        let backend = MemoryBackend::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let coordinator = Arc::new(ConnectionCoordinator::new(
            Arc::new(MemoryRemoteFactory::new(backend.clone())),
            Arc::new(ManualConnectivity::new(true)),
            notifier.clone(),
            RemoteSettings::default(),
            CoordinatorConfig::default(),
        ));
        coordinator.initialize().await.unwrap();
        let cache = Arc::new(LocalCacheStore::new(
            Arc::new(MemoryStorage::new()),
            CacheConfig::default(),
        ));
        let sync = Arc::new(Synchronizer::new(
            cache,
            coordinator,
            None,
            notifier.clone(),
            SyncConfig::default(),
        ));
        Harness {
            backend,
            notifier,
            sync,
        }
    }

    fn record(id: &str, title: &str, day: u32) -> Record {
        let at = Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
        Record {
            id: EntityId::from(id),
            user_id: EntityId::from("u1"),
            title: title.to_string(),
            record_type: "lab_result".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            notes: String::new(),
            file_id: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn seed(backend: &MemoryBackend, record: &Record) {
        let env = Envelope::from_entity(record).unwrap();
        backend.insert("records", record.id.as_str(), env.to_document());
    }

    #[test]
    fn test_sync_config_builder() {
        let config = SyncConfigBuilder::new()
            .request_timeout(500)
            .push_concurrency(2)
            .background_sync(false)
            .sync_on_reconnect(false)
            .build();

        assert_eq!(config.request_timeout(), Duration::from_millis(500));
        assert_eq!(config.push_concurrency, 2);
        assert!(!config.background_sync);
        assert!(!config.sync_on_reconnect);
    }

    #[tokio::test]
    async fn test_pull_merges_and_counts_changes() {
        let h = harness().await;
        seed(&h.backend, &record("r1", "Lab", 1));
        seed(&h.backend, &record("r2", "X-ray", 1));

        let merged = h.sync.pull(EntityKind::Record, vec![]).await.unwrap();
        assert_eq!(merged, 2);
        let again = h.sync.pull(EntityKind::Record, vec![]).await.unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_pull_with_bad_document_leaves_cache_untouched() {
        let h = harness().await;
        h.sync.cache().put(&record("r1", "Lab", 1)).unwrap();
        seed(&h.backend, &record("r1", "Lab Updated", 2));
        h.backend
            .insert("records", "broken", serde_json::json!({"title": "no timestamp"}));

        assert!(h.sync.pull(EntityKind::Record, vec![]).await.is_err());
        let local: Record = h.sync.cache().get(&EntityId::from("r1")).unwrap();
        assert_eq!(local.title, "Lab");
    }

    #[tokio::test]
    async fn test_pull_offline_is_rejected_without_touching_cache() {
        let h = harness().await;
        h.backend.set_reachable(false);
        assert!(!h.sync.coordinator().test_connection().await);

        assert!(matches!(
            h.sync.pull(EntityKind::Record, vec![]).await,
            Err(SyncError::Offline)
        ));
    }

    #[tokio::test]
    async fn test_push_detects_duplicate() {
        let h = harness().await;
        seed(&h.backend, &record("r1", "Lab", 1));

        let dup = record("r2", "Lab", 2);
        let err = h.sync.push(&dup).await.unwrap_err();
        match err {
            SyncError::Duplicate { kind, existing } => {
                assert_eq!(kind, EntityKind::Record);
                assert_eq!(existing, EntityId::from("r1"));
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert!(h.backend.document("records", "r2").is_none());

        // Re-pushing the original id is an update, not a duplicate.
        h.sync.push(&record("r1", "Lab", 3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_push_keeps_pending_entry() {
        let h = harness().await;
        let env = Envelope::from_entity(&record("r1", "Lab", 1)).unwrap();
        h.sync.cache().write_local(&env).unwrap();

        h.backend.fail_next(1, RemoteError::unavailable("backend down"));
        assert!(h.sync.push_envelope(&env).await.is_err());
        let entry = h
            .sync
            .cache()
            .pending()
            .get(EntityKind::Record, &env.id)
            .unwrap()
            .unwrap();
        assert_eq!(entry.attempts, 1);

        h.sync.push_envelope(&env).await.unwrap();
        assert!(h.sync.cache().pending().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_flush_discards_duplicates_and_pushes_rest() {
        let h = harness().await;
        seed(&h.backend, &record("remote", "Lab", 1));
        let cache = h.sync.cache();
        cache
            .write_local(&Envelope::from_entity(&record("dup", "Lab", 2)).unwrap())
            .unwrap();
        cache
            .write_local(&Envelope::from_entity(&record("new", "MRI", 2)).unwrap())
            .unwrap();

        let report = h.sync.flush_pending().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.duplicates, 1);
        assert!(cache.pending().is_empty().unwrap());
        assert!(cache.get_envelope(EntityKind::Record, &EntityId::from("dup")).unwrap().is_none());
        assert!(cache.contains(EntityKind::Record, &EntityId::from("remote")).unwrap());
        assert_eq!(h.notifier.count_titled("Duplicate skipped"), 1);
    }

    #[tokio::test]
    async fn test_older_pending_write_does_not_overwrite_newer_remote() {
        let h = harness().await;
        seed(&h.backend, &record("r1", "Remote edit", 5));
        let cache = h.sync.cache();
        cache
            .write_local(&Envelope::from_entity(&record("r1", "Stale local edit", 3)).unwrap())
            .unwrap();

        let report = h.sync.flush_pending().await.unwrap();
        assert_eq!(report.superseded, 1);
        assert_eq!(report.pushed, 0);
        assert!(cache.pending().is_empty().unwrap());

        let local: Record = cache.get(&EntityId::from("r1")).unwrap();
        assert_eq!(local.title, "Remote edit");
        let remote = h.backend.document("records", "r1").unwrap();
        assert_eq!(remote.data["title"], "Remote edit");
    }

    #[tokio::test]
    async fn test_older_tombstone_loses_to_later_remote_edit() {
        let h = harness().await;
        seed(&h.backend, &record("r1", "Lab", 1));
        h.sync.pull(EntityKind::Record, vec![]).await.unwrap();

        let deleted_at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        h.sync
            .cache()
            .delete(EntityKind::Record, &EntityId::from("r1"), deleted_at)
            .unwrap();
        seed(&h.backend, &record("r1", "Lab reviewed", 4));

        h.sync.flush_pending().await.unwrap();
        assert!(!is_deleted(&h.backend.document("records", "r1").unwrap().data));
        let local: Record = h.sync.cache().get(&EntityId::from("r1")).unwrap();
        assert_eq!(local.title, "Lab reviewed");
    }

    #[tokio::test]
    async fn test_colliding_edit_of_stored_entity_stays_pending() {
        let h = harness().await;
        seed(&h.backend, &record("a", "Lab", 1));
        seed(&h.backend, &record("b", "Lab draft", 1));
        h.sync.pull(EntityKind::Record, vec![]).await.unwrap();

        let mut edit = record("b", "Lab", 3);
        edit.notes = "important new notes".to_string();
        h.sync
            .cache()
            .write_local(&Envelope::from_entity(&edit).unwrap())
            .unwrap();

        let report = h.sync.flush_pending().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.duplicates, 0);
        assert_eq!(h.sync.cache().pending().len().unwrap(), 1);
        let local: Record = h.sync.cache().get(&EntityId::from("b")).unwrap();
        assert_eq!(local.notes, "important new notes");
        assert_eq!(h.notifier.count_titled("Duplicate skipped"), 0);

        // a later pull of the old remote copy does not undo the edit
        h.sync.pull(EntityKind::Record, vec![]).await.unwrap();
        let local: Record = h.sync.cache().get(&EntityId::from("b")).unwrap();
        assert_eq!(local.title, "Lab");
    }

    #[tokio::test]
    async fn test_tombstone_push_and_pull() {
        let h = harness().await;
        seed(&h.backend, &record("r1", "Lab", 1));
        h.sync.pull(EntityKind::Record, vec![]).await.unwrap();

        let at = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        h.sync
            .cache()
            .delete(EntityKind::Record, &EntityId::from("r1"), at)
            .unwrap();
        h.sync.flush_pending().await.unwrap();

        let doc = h.backend.document("records", "r1").unwrap();
        assert!(is_deleted(&doc.data));
        // A later pull does not resurrect the record.
        h.sync.pull(EntityKind::Record, vec![]).await.unwrap();
        assert!(!h
            .sync
            .cache()
            .contains(EntityKind::Record, &EntityId::from("r1"))
            .unwrap());
    }

    #[tokio::test]
    async fn test_background_sync_pushes_pending() {
        let h = harness().await;
        h.sync
            .cache()
            .write_local(&Envelope::from_entity(&record("r1", "Lab", 1)).unwrap())
            .unwrap();

        h.sync.schedule_background_sync();
        h.sync.schedule_background_sync();
        h.sync.wait_idle().await;

        assert!(h.backend.document("records", "r1").is_some());
        assert!(h.sync.cache().pending().is_empty().unwrap());
    }
}
