//! Remote document store boundary.
//!
//! The remote store is document oriented: documents are addressed by
//! `(collection, id)` and can be read, written, deleted and queried with
//! simple field filters. Client instances are produced by a
//! [`RemoteStoreFactory`] from [`RemoteSettings`], which is how the
//! recovery strategies change transport and endpoint configuration.

use crate::error::RemoteError;
use async_trait::async_trait;
use medsync_core::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// A document as returned by the remote store.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteDocument {
    pub id: String,
    pub data: Value,
    /// Server-assigned write time.
    pub update_time: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// `where(field, op, value)` filter.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Evaluate the filter against document data.
    pub fn matches(&self, data: &Value) -> bool {
        let Some(actual) = data.get(&self.field) else {
            return false;
        };
        if self.op == FilterOp::Eq {
            return actual == &self.value;
        }
        match (self.op, compare_values(actual, &self.value)) {
            (_, None) => false,
            (FilterOp::Lt, Some(ord)) => ord == Ordering::Less,
            (FilterOp::Le, Some(ord)) => ord != Ordering::Greater,
            (FilterOp::Gt, Some(ord)) => ord == Ordering::Greater,
            (FilterOp::Ge, Some(ord)) => ord != Ordering::Less,
            (FilterOp::Eq, Some(ord)) => ord == Ordering::Equal,
        }
    }
}

/// Order two JSON scalars of the same type.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// A collection query: filters, optional ordering and limit.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(field, value))
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Network transport used by a remote client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Streaming transport with automatic detection.
    #[default]
    Streaming,
    /// Long polling forced on.
    LongPolling,
    /// Long polling without fetch streams; the most conservative transport.
    LongPollingNoFetchStreams,
}

/// Local emulator endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatorEndpoint {
    pub host: String,
    pub port: u16,
}

/// Configuration a remote client is constructed from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Base name of the client instance; reinitialization appends a generation.
    pub app_name: String,
    pub project_id: String,
    pub transport: TransportMode,
    pub emulator: Option<EmulatorEndpoint>,
    /// Ports tried, in order, when rotating the emulator endpoint.
    pub emulator_ports: Vec<u16>,
    /// Keep a local persistent cache for offline reads.
    pub persistence: bool,
    /// Serve reads from the local cache only.
    pub force_cache: bool,
    pub ssl: bool,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            app_name: "medsync".to_string(),
            project_id: "medsync-local".to_string(),
            transport: TransportMode::Streaming,
            emulator: None,
            emulator_ports: vec![8080, 8081, 8082],
            persistence: true,
            force_cache: false,
            ssl: true,
        }
    }
}

/// A connected remote store client.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Instance name this client was created under.
    fn identity(&self) -> &str;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>, RemoteError>;

    /// Write a document; `merge` combines top-level fields with any existing data.
    async fn set(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        merge: bool,
    ) -> Result<RemoteDocument, RemoteError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

    async fn query(&self, query: &Query) -> Result<Vec<RemoteDocument>, RemoteError>;

    async fn enable_network(&self) -> Result<(), RemoteError>;

    async fn disable_network(&self) -> Result<(), RemoteError>;

    /// Resolve once the client's auth subsystem has settled.
    async fn wait_for_auth_ready(&self);

    /// Turn on local persistence for offline reads.
    async fn enable_persistence(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    /// Release the client; it must not be used afterwards.
    async fn terminate(&self) -> Result<(), RemoteError>;
}

/// Builds remote clients.
#[async_trait]
pub trait RemoteStoreFactory: Send + Sync + 'static {
    async fn connect(
        &self,
        identity: &str,
        settings: &RemoteSettings,
    ) -> Result<Arc<dyn RemoteStore>, RemoteError>;
}
