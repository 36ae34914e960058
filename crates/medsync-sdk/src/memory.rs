//! In-memory remote store for testing and simulation.
//!
//! A [`MemoryBackend`] plays the server: it holds the documents and the
//! fault-injection switches. [`MemoryRemoteFactory`] hands out
//! [`MemoryRemote`] clients bound to that backend and records the settings
//! every client was built with.

use crate::error::RemoteError;
use crate::remote::{
    compare_values, Direction, Query, RemoteDocument, RemoteSettings, RemoteStore,
    RemoteStoreFactory,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Collections = BTreeMap<String, BTreeMap<String, RemoteDocument>>;

/// Shared server-side state.
#[derive(Default)]
pub struct MemoryBackend {
    collections: RwLock<Collections>,
    reachable: AtomicBool,
    scripted_failures: RwLock<VecDeque<RemoteError>>,
    latency: RwLock<Option<Duration>>,
    calls: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        let backend = Self::default();
        backend.reachable.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    /// Simulate the server becoming (un)reachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Fail the next `count` calls with `error`.
    pub fn fail_next(&self, count: usize, error: RemoteError) {
        let mut failures = self.scripted_failures.write();
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Number of calls that reached the backend.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Read a document directly, bypassing faults.
    pub fn document(&self, collection: &str, id: &str) -> Option<RemoteDocument> {
        self.collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// All documents in a collection, bypassing faults.
    pub fn documents(&self, collection: &str) -> Vec<RemoteDocument> {
        self.collections
            .read()
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Seed a document directly, bypassing faults.
    pub fn insert(&self, collection: &str, id: &str, data: Value) {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(
                id.to_string(),
                RemoteDocument {
                    id: id.to_string(),
                    data,
                    update_time: Utc::now(),
                },
            );
    }

    async fn enter(&self, network_enabled: bool) -> Result<(), RemoteError> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !network_enabled {
            return Err(RemoteError::unavailable("client network is disabled"));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_failures.write().pop_front() {
            return Err(err);
        }
        if !self.is_reachable() {
            return Err(RemoteError::unavailable("Failed to fetch: network unreachable"));
        }
        Ok(())
    }
}

/// A client bound to a [`MemoryBackend`].
pub struct MemoryRemote {
    identity: String,
    backend: Arc<MemoryBackend>,
    network_enabled: AtomicBool,
    terminated: AtomicBool,
}

impl MemoryRemote {
    pub fn new(identity: impl Into<String>, backend: Arc<MemoryBackend>) -> Self {
        Self {
            identity: identity.into(),
            backend,
            network_enabled: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        if self.is_terminated() {
            return Err(RemoteError::new("failed-precondition", "client has been terminated"));
        }
        self.backend
            .enter(self.network_enabled.load(Ordering::SeqCst))
            .await
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>, RemoteError> {
        self.enter().await?;
        Ok(self.backend.document(collection, id))
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        merge: bool,
    ) -> Result<RemoteDocument, RemoteError> {
        self.enter().await?;
        let mut collections = self.backend.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();
        let data = match (merge, docs.get(id), data) {
            (true, Some(existing), Value::Object(incoming)) => {
                let mut combined = existing.data.clone();
                if let Value::Object(map) = &mut combined {
                    map.extend(incoming);
                }
                combined
            }
            (_, _, data) => data,
        };
        let doc = RemoteDocument {
            id: id.to_string(),
            data,
            update_time: Utc::now(),
        };
        docs.insert(id.to_string(), doc.clone());
        self.backend.writes.fetch_add(1, Ordering::SeqCst);
        Ok(doc)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.enter().await?;
        if let Some(docs) = self.backend.collections.write().get_mut(collection) {
            docs.remove(id);
        }
        self.backend.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<RemoteDocument>, RemoteError> {
        self.enter().await?;
        let mut docs: Vec<RemoteDocument> = self
            .backend
            .documents(&query.collection)
            .into_iter()
            .filter(|doc| query.filters.iter().all(|f| f.matches(&doc.data)))
            .collect();
        if let Some((field, direction)) = &query.order_by {
            docs.sort_by(|a, b| {
                let ord = match (a.data.get(field), b.data.get(field)) {
                    (Some(a), Some(b)) => compare_values(a, b).unwrap_or(std::cmp::Ordering::Equal),
                    _ => std::cmp::Ordering::Equal,
                };
                match direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    async fn enable_network(&self) -> Result<(), RemoteError> {
        self.network_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable_network(&self) -> Result<(), RemoteError> {
        self.network_enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_auth_ready(&self) {}

    async fn terminate(&self) -> Result<(), RemoteError> {
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory producing [`MemoryRemote`] clients for one backend.
pub struct MemoryRemoteFactory {
    backend: Arc<MemoryBackend>,
    connect_failures: RwLock<VecDeque<RemoteError>>,
    history: RwLock<Vec<(String, RemoteSettings)>>,
}

impl MemoryRemoteFactory {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            connect_failures: RwLock::new(VecDeque::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    /// Fail the next `count` connects with `error`.
    pub fn fail_connects(&self, count: usize, error: RemoteError) {
        let mut failures = self.connect_failures.write();
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    /// Identity and settings of every client built so far.
    pub fn history(&self) -> Vec<(String, RemoteSettings)> {
        self.history.read().clone()
    }
}

#[async_trait]
impl RemoteStoreFactory for MemoryRemoteFactory {
    async fn connect(
        &self,
        identity: &str,
        settings: &RemoteSettings,
    ) -> Result<Arc<dyn RemoteStore>, RemoteError> {
        if let Some(err) = self.connect_failures.write().pop_front() {
            return Err(err);
        }
        self.history
            .write()
            .push((identity.to_string(), settings.clone()));
        Ok(Arc::new(MemoryRemote::new(identity, self.backend.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Filter;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_remote_crud_and_query() {
        let backend = MemoryBackend::new();
        let remote = MemoryRemote::new("test", backend.clone());

        remote
            .set("records", "r1", json!({"user_id": "u1", "date": "2024-01-02"}), false)
            .await
            .unwrap();
        remote
            .set("records", "r2", json!({"user_id": "u1", "date": "2024-01-05"}), false)
            .await
            .unwrap();
        remote
            .set("records", "r3", json!({"user_id": "u2", "date": "2024-01-03"}), false)
            .await
            .unwrap();

        let query = Query::collection("records")
            .filter(Filter::eq("user_id", "u1"))
            .order_by("date", Direction::Descending);
        let ids: Vec<_> = remote
            .query(&query)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["r2", "r1"]);

        remote.delete("records", "r1").await.unwrap();
        assert!(remote.get("records", "r1").await.unwrap().is_none());
        assert_eq!(backend.write_count(), 4);
    }

    #[tokio::test]
    async fn test_merge_set_combines_fields() {
        let backend = MemoryBackend::new();
        let remote = MemoryRemote::new("test", backend.clone());
        remote.set("users", "u1", json!({"a": 1, "b": 1}), false).await.unwrap();
        remote.set("users", "u1", json!({"b": 2}), true).await.unwrap();

        assert_eq!(backend.document("users", "u1").unwrap().data, json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn test_faults() {
        let backend = MemoryBackend::new();
        let remote = MemoryRemote::new("test", backend.clone());

        backend.fail_next(1, RemoteError::unavailable("boom"));
        assert!(remote.get("users", "u1").await.is_err());
        assert!(remote.get("users", "u1").await.is_ok());

        backend.set_reachable(false);
        assert!(remote.get("users", "u1").await.is_err());
        backend.set_reachable(true);

        remote.disable_network().await.unwrap();
        assert!(remote.get("users", "u1").await.is_err());
        remote.enable_network().await.unwrap();

        remote.terminate().await.unwrap();
        assert!(remote.get("users", "u1").await.is_err());
    }

    #[tokio::test]
    async fn test_factory_records_settings_and_fails_on_demand() {
        let factory = MemoryRemoteFactory::new(MemoryBackend::new());
        factory.fail_connects(1, RemoteError::unavailable("dns"));

        assert!(factory.connect("a", &RemoteSettings::default()).await.is_err());
        let client = factory.connect("b", &RemoteSettings::default()).await.unwrap();
        assert_eq!(client.identity(), "b");
        assert_eq!(factory.history().len(), 1);
    }
}
