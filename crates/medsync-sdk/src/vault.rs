//! Record and audit domain operations.
//!
//! Every operation writes to the local cache first and returns as soon as
//! the local write is durable. Remote work happens in a background sync; a
//! remote failure never fails the user action when a local fallback exists.

use crate::blob::BlobStore;
use crate::clock::Clock;
use crate::coordinator::ConnectionCoordinator;
use crate::error::{Result, SyncError};
use crate::notify::{Notification, Notifier, NotifyKind};
use crate::remote::Filter;
use crate::sync::{PullScope, Synchronizer};
use chrono::NaiveDate;
use medsync_cache::LocalCacheStore;
use medsync_core::{
    AuditAction, AuditEntry, BlobId, Entity, EntityId, EntityKind, Envelope, Record,
    SharePermission, ShareGrant, Timestamp, User,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fields of a record the user supplies on creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRecord {
    pub title: String,
    pub record_type: String,
    pub date: NaiveDate,
    pub notes: String,
}

impl NewRecord {
    pub fn new(title: impl Into<String>, record_type: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            title: title.into(),
            record_type: record_type.into(),
            date,
            notes: String::new(),
        }
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

pub struct Vault {
    cache: Arc<LocalCacheStore>,
    sync: Arc<Synchronizer>,
    coordinator: Arc<ConnectionCoordinator>,
    blobs: Option<Arc<dyn BlobStore>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl Vault {
    pub fn new(
        sync: Arc<Synchronizer>,
        blobs: Option<Arc<dyn BlobStore>>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache: sync.cache().clone(),
            coordinator: sync.coordinator().clone(),
            sync,
            blobs,
            notifier,
            clock,
        }
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    /// A timestamp strictly after `previous`, so an edit always wins the merge.
    fn stamp_after(&self, previous: Timestamp) -> Timestamp {
        let now = self.clock.now();
        if now > previous {
            now
        } else {
            previous + chrono::Duration::milliseconds(1)
        }
    }

    // ---------------------------------------------------------------------
    // Session
    // ---------------------------------------------------------------------

    /// Make `user` the current user and start syncing their data.
    pub async fn login(&self, user: User) -> Result<User> {
        self.cache.write_local(&Envelope::from_entity(&user)?)?;
        self.cache.set_current_user(&user)?;
        self.sync.set_scopes(scopes_for(&user.id));
        info!(user = %user.id, "signed in");
        self.audit(&user, AuditAction::Login, None, String::new());
        self.sync.schedule_background_sync();
        Ok(user)
    }

    pub async fn logout(&self) -> Result<()> {
        if let Some(user) = self.cache.current_user()? {
            self.audit(&user, AuditAction::Logout, None, String::new());
            info!(user = %user.id, "signed out");
        }
        self.cache.clear_current_user()?;
        self.sync.set_scopes(Vec::new());
        Ok(())
    }

    pub fn current_user(&self) -> Result<Option<User>> {
        Ok(self.cache.current_user()?)
    }

    fn require_user(&self) -> Result<User> {
        self.cache
            .current_user()?
            .ok_or_else(|| SyncError::Auth("no user is signed in".to_string()))
    }

    fn owned_record(&self, user: &User, id: &EntityId) -> Result<Record> {
        let record: Record = self.cache.get(id)?;
        if record.user_id != user.id {
            return Err(SyncError::Auth(format!("record {} belongs to another user", id)));
        }
        Ok(record)
    }

    // ---------------------------------------------------------------------
    // Records
    // ---------------------------------------------------------------------

    /// Create a record unless one with the same natural key already exists.
    pub async fn save_record(&self, draft: NewRecord) -> Result<Record> {
        let user = self.require_user()?;
        let title = draft.title.trim().to_string();
        if title.is_empty() {
            return Err(SyncError::InvalidInput("record title is empty".to_string()));
        }
        let now = self.clock.now();
        let record = Record {
            id: EntityId::generate(),
            user_id: user.id.clone(),
            title,
            record_type: draft.record_type,
            date: draft.date,
            notes: draft.notes,
            file_id: None,
            created_at: now,
            updated_at: now,
        };
        let env = Envelope::from_entity(&record)?;

        if let Some(existing) = self.find_duplicate(&env).await {
            return Err(self.reject_duplicate(&user, existing, &record.title));
        }

        self.cache.write_local(&env)?;
        self.audit(
            &user,
            AuditAction::RecordCreated,
            Some(record.id.clone()),
            record.title.clone(),
        );
        self.sync.schedule_background_sync();
        Ok(record)
    }

    /// Local match first, then the remote store when online.
    async fn find_duplicate(&self, env: &Envelope) -> Option<EntityId> {
        let key = env.natural_key()?;
        match self.cache.list_envelopes(env.kind) {
            Ok(stored) => {
                if let Some(found) = stored
                    .into_iter()
                    .find(|e| !e.is_tombstone() && e.id != env.id && key.matches(&e.body))
                {
                    return Some(found.id);
                }
            }
            Err(e) => warn!(error = %e, "local duplicate check failed"),
        }
        if !self.coordinator.is_online() {
            return None;
        }
        match self.sync.check_duplicate(env).await {
            Ok(found) => found,
            Err(e) => {
                debug!(error = %e, "remote duplicate check unavailable");
                None
            }
        }
    }

    fn reject_duplicate(&self, user: &User, existing: EntityId, title: &str) -> SyncError {
        info!(existing = %existing, "record already exists; not saving");
        self.audit(
            user,
            AuditAction::DuplicateSkipped,
            Some(existing.clone()),
            title.to_string(),
        );
        self.notifier.notify(Notification::new(
            NotifyKind::Info,
            "Duplicate skipped",
            format!("\"{}\" is already in your records.", title),
        ));
        SyncError::Duplicate {
            kind: EntityKind::Record,
            existing,
        }
    }

    /// Save edits to an existing record.
    ///
    /// Edits that would give the record the same title, type and date as
    /// another one are refused.
    pub async fn update_record(&self, mut record: Record) -> Result<Record> {
        let user = self.require_user()?;
        let previous = self.owned_record(&user, &record.id)?;
        record.user_id = previous.user_id;
        record.created_at = previous.created_at;
        record.touch(self.stamp_after(previous.updated_at));

        let env = Envelope::from_entity(&record)?;
        if let Some(existing) = self.find_duplicate(&env).await {
            return Err(self.reject_duplicate(&user, existing, &record.title));
        }
        self.cache.write_local(&env)?;
        self.audit(
            &user,
            AuditAction::RecordUpdated,
            Some(record.id.clone()),
            record.title.clone(),
        );
        self.sync.schedule_background_sync();
        Ok(record)
    }

    /// Cache first; falls back to the remote store when the record is not
    /// cached and the coordinator is online.
    pub async fn get_record(&self, id: &EntityId) -> Result<Record> {
        let missing = || SyncError::NotFound(format!("record {}", id));
        match self.cache.get_envelope(EntityKind::Record, id)? {
            Some(env) if env.is_tombstone() => Err(missing()),
            Some(env) => {
                self.sync.schedule_background_sync();
                Ok(env.decode()?)
            }
            None if self.coordinator.is_online() => {
                match self.sync.fetch_one(EntityKind::Record, id).await {
                    Ok(Some(env)) if !env.is_tombstone() => Ok(env.decode()?),
                    Ok(_) => Err(missing()),
                    Err(e) => {
                        debug!(error = %e, "remote lookup failed");
                        Err(missing())
                    }
                }
            }
            None => Err(missing()),
        }
    }

    /// The current user's records, newest first.
    pub fn list_records(&self, record_type: Option<&str>) -> Result<Vec<Record>> {
        let user = self.require_user()?;
        let mut records = self.cache.list::<Record, _>(|r| {
            r.user_id == user.id && record_type.map_or(true, |t| r.record_type == t)
        })?;
        records.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        self.sync.schedule_background_sync();
        Ok(records)
    }

    /// Delete a record, its share grants and (best effort) its attachment.
    pub async fn delete_record(&self, id: &EntityId) -> Result<()> {
        let user = self.require_user()?;
        let record = self.owned_record(&user, id)?;
        let at = self.stamp_after(record.updated_at);

        self.cache.delete(EntityKind::Record, id, at)?;
        for grant in self.cache.list::<ShareGrant, _>(|g| g.record_id == *id)? {
            self.cache.delete(EntityKind::ShareGrant, &grant.id, at)?;
        }
        if let Some(blob) = &record.file_id {
            self.discard_blob(blob).await;
        }

        self.audit(&user, AuditAction::RecordDeleted, Some(id.clone()), record.title);
        self.sync.schedule_background_sync();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Attachments
    // ---------------------------------------------------------------------

    /// Attach a file to a record, replacing any previous attachment.
    ///
    /// The payload is cached locally when it fits and uploaded when online.
    /// Fails only if it could be neither cached nor uploaded.
    pub async fn attach_file(&self, record_id: &EntityId, data: String) -> Result<Record> {
        let user = self.require_user()?;
        let mut record = self.owned_record(&user, record_id)?;
        let blob = BlobId::generate();

        let cached = match self.cache.cache_attachment(&blob, &data) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(error = %e, "could not cache attachment locally");
                false
            }
        };
        let uploaded = match (&self.blobs, self.coordinator.is_online()) {
            (Some(store), true) => store.upload(&blob, &data).await.map_err(SyncError::from),
            (None, _) => Err(SyncError::InvalidInput("no blob store configured".to_string())),
            (_, false) => Err(SyncError::Offline),
        };
        if let Err(e) = uploaded {
            if !cached {
                return Err(e);
            }
            warn!(blob = %blob, error = %e, "attachment kept on this device only");
        }

        let replaced = record.file_id.replace(blob.clone());
        record.touch(self.stamp_after(record.updated_at));
        self.cache.write_local(&Envelope::from_entity(&record)?)?;
        if let Some(old) = replaced {
            self.discard_blob(&old).await;
        }

        self.audit(
            &user,
            AuditAction::FileAttached,
            Some(record.id.clone()),
            blob.to_string(),
        );
        self.sync.schedule_background_sync();
        Ok(record)
    }

    /// Attachment payload of `record`, from the cache or the blob store.
    pub async fn read_attachment(&self, record: &Record) -> Result<Option<String>> {
        let Some(blob) = &record.file_id else {
            return Ok(None);
        };
        if let Some(data) = self.cache.attachment(blob)? {
            return Ok(Some(data));
        }
        let Some(store) = &self.blobs else {
            return Ok(None);
        };
        if !self.coordinator.is_online() {
            return Ok(None);
        }
        match store.download(blob).await {
            Ok(Some(data)) => {
                if let Err(e) = self.cache.cache_attachment(blob, &data) {
                    debug!(error = %e, "could not cache downloaded attachment");
                }
                Ok(Some(data))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                debug!(blob = %blob, error = %e, "attachment download failed");
                Ok(None)
            }
        }
    }

    /// Drop a blob locally and ask the blob store to delete it. Never fails.
    async fn discard_blob(&self, blob: &BlobId) {
        if let Err(e) = self.cache.remove_attachment(blob) {
            debug!(blob = %blob, error = %e, "could not drop cached attachment");
        }
        let Some(store) = &self.blobs else {
            return;
        };
        if !self.coordinator.is_online() {
            debug!(blob = %blob, "offline; leaving remote blob in place");
            return;
        }
        if let Err(e) = store.delete(blob).await {
            warn!(blob = %blob, error = %e, "blob deletion failed");
        }
    }

    // ---------------------------------------------------------------------
    // Sharing
    // ---------------------------------------------------------------------

    pub async fn share_record(
        &self,
        record_id: &EntityId,
        grantee_email: &str,
        permission: SharePermission,
        expires_at: Option<Timestamp>,
    ) -> Result<ShareGrant> {
        let user = self.require_user()?;
        let record = self.owned_record(&user, record_id)?;
        let email = grantee_email.trim().to_lowercase();
        if !email.contains('@') {
            return Err(SyncError::InvalidInput(format!("not an email address: {}", grantee_email)));
        }
        if email == user.email.to_lowercase() {
            return Err(SyncError::InvalidInput("cannot share a record with yourself".to_string()));
        }
        if let Some(existing) = self
            .shares_for_record(record_id)?
            .into_iter()
            .find(|g| g.grantee_email == email)
        {
            return Err(SyncError::Duplicate {
                kind: EntityKind::ShareGrant,
                existing: existing.id,
            });
        }

        let grant = ShareGrant {
            id: EntityId::generate(),
            record_id: record.id.clone(),
            owner_id: user.id.clone(),
            grantee_email: email,
            permission,
            expires_at,
            updated_at: self.clock.now(),
        };
        self.cache.write_local(&Envelope::from_entity(&grant)?)?;
        self.audit(
            &user,
            AuditAction::RecordShared,
            Some(record.id),
            grant.grantee_email.clone(),
        );
        self.sync.schedule_background_sync();
        Ok(grant)
    }

    pub async fn revoke_share(&self, grant_id: &EntityId) -> Result<()> {
        let user = self.require_user()?;
        let grant: ShareGrant = self.cache.get(grant_id)?;
        if grant.owner_id != user.id {
            return Err(SyncError::Auth(format!("share {} belongs to another user", grant_id)));
        }
        self.cache
            .delete(EntityKind::ShareGrant, grant_id, self.stamp_after(grant.updated_at))?;
        self.audit(
            &user,
            AuditAction::ShareRevoked,
            Some(grant.record_id),
            grant.grantee_email,
        );
        self.sync.schedule_background_sync();
        Ok(())
    }

    /// Unexpired grants on a record.
    pub fn shares_for_record(&self, record_id: &EntityId) -> Result<Vec<ShareGrant>> {
        let now = self.clock.now();
        Ok(self
            .cache
            .list::<ShareGrant, _>(|g| g.record_id == *record_id && g.is_active(now))?)
    }

    // ---------------------------------------------------------------------
    // Audit
    // ---------------------------------------------------------------------

    /// Append an audit entry for the current user.
    pub fn log_audit(
        &self,
        action: AuditAction,
        target: Option<EntityId>,
        detail: impl Into<String>,
    ) -> Result<AuditEntry> {
        let user = self.require_user()?;
        self.write_audit(&user, action, target, detail.into())
    }

    fn write_audit(
        &self,
        user: &User,
        action: AuditAction,
        target: Option<EntityId>,
        detail: String,
    ) -> Result<AuditEntry> {
        let now = self.clock.now();
        let entry = AuditEntry {
            id: EntityId::generate(),
            user_id: user.id.clone(),
            action,
            target,
            detail,
            created_at: now,
            updated_at: now,
        };
        self.cache.write_local(&Envelope::from_entity(&entry)?)?;
        Ok(entry)
    }

    /// Audit as a side effect of another action; failures are only logged.
    fn audit(&self, user: &User, action: AuditAction, target: Option<EntityId>, detail: String) {
        if let Err(e) = self.write_audit(user, action, target, detail) {
            warn!(action = ?action, error = %e, "audit entry not written");
        }
    }

    /// The current user's audit entries, newest first.
    pub fn audit_trail(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let user = self.require_user()?;
        let mut entries = self
            .cache
            .list::<AuditEntry, _>(|e| e.user_id == user.id)?;
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        entries.truncate(limit);
        Ok(entries)
    }
}

/// What a signed-in user pulls.
fn scopes_for(user_id: &EntityId) -> Vec<PullScope> {
    vec![
        PullScope::new(EntityKind::User, vec![Filter::eq("id", user_id.as_str())]),
        PullScope::new(EntityKind::Record, vec![Filter::eq("user_id", user_id.as_str())]),
        PullScope::new(
            EntityKind::ShareGrant,
            vec![Filter::eq("owner_id", user_id.as_str())],
        ),
        PullScope::new(
            EntityKind::AuditEntry,
            vec![Filter::eq("user_id", user_id.as_str())],
        ),
    ]
}
