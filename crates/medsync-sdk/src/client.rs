//! High-level client for the MedSync SDK.

use crate::blob::BlobStore;
use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::connectivity::{ConnectivitySource, ManualConnectivity};
use crate::coordinator::{ConnectionCoordinator, CoordinatorEvent};
use crate::error::Result;
use crate::escalator::ResolutionEscalator;
use crate::notify::{LogNotifier, Notifier};
use crate::remote::RemoteStoreFactory;
use crate::strategy::RecoveryStrategy;
use crate::sync::{SyncReport, Synchronizer};
use crate::vault::Vault;
use medsync_cache::{KeyValueStorage, LocalCacheStore, MemoryStorage};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Assembles a [`Client`] from its boundaries.
///
/// Only the remote store factory is required; everything else defaults to
/// in-memory storage, a host that reports itself online, log notifications
/// and the system clock.
pub struct ClientBuilder {
    config: ClientConfig,
    factory: Arc<dyn RemoteStoreFactory>,
    storage: Arc<dyn KeyValueStorage>,
    connectivity: Arc<dyn ConnectivitySource>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    blobs: Option<Arc<dyn BlobStore>>,
    strategies: Option<Vec<Arc<dyn RecoveryStrategy>>>,
}

impl ClientBuilder {
    pub fn new(factory: Arc<dyn RemoteStoreFactory>) -> Self {
        Self {
            config: ClientConfig::default(),
            factory,
            storage: Arc::new(MemoryStorage::new()),
            connectivity: Arc::new(ManualConnectivity::new(true)),
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
            blobs: None,
            strategies: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivitySource>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Replace the built-in recovery ladder.
    pub fn strategies(mut self, strategies: Vec<Arc<dyn RecoveryStrategy>>) -> Self {
        self.strategies = Some(strategies);
        self
    }

    pub fn build(self) -> Client {
        let config = self.config;
        let cache = Arc::new(LocalCacheStore::new(self.storage, config.cache.clone()));
        let coordinator = Arc::new(ConnectionCoordinator::new(
            self.factory,
            self.connectivity,
            self.notifier.clone(),
            config.remote.clone(),
            config.coordinator.clone(),
        ));
        let escalator = Arc::new(match self.strategies {
            Some(strategies) => ResolutionEscalator::with_strategies(
                coordinator.clone(),
                strategies,
                config.escalator.clone(),
            ),
            None => ResolutionEscalator::new(coordinator.clone(), config.escalator.clone()),
        });
        let sync = Arc::new(Synchronizer::new(
            cache.clone(),
            coordinator.clone(),
            Some(escalator.clone()),
            self.notifier.clone(),
            config.sync.clone(),
        ));
        let vault = Vault::new(sync.clone(), self.blobs, self.notifier, self.clock);

        Client {
            config,
            cache,
            coordinator,
            escalator,
            sync,
            vault,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// The MedSync client.
///
/// Owns the cache, the connection coordinator, the escalator and the
/// synchronizer, and exposes the record operations through [`Client::vault`].
///
/// # Example
///
/// ```rust,ignore
/// use medsync_sdk::quick;
///
/// let setup = quick::memory_client(ClientConfig::default());
/// setup.client.start().await?;
/// setup.client.vault().login(user).await?;
/// ```
pub struct Client {
    config: ClientConfig,
    cache: Arc<LocalCacheStore>,
    coordinator: Arc<ConnectionCoordinator>,
    escalator: Arc<ResolutionEscalator>,
    sync: Arc<Synchronizer>,
    vault: Vault,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    pub fn builder(factory: Arc<dyn RemoteStoreFactory>) -> ClientBuilder {
        ClientBuilder::new(factory)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<LocalCacheStore> {
        &self.cache
    }

    pub fn coordinator(&self) -> &Arc<ConnectionCoordinator> {
        &self.coordinator
    }

    pub fn escalator(&self) -> &Arc<ResolutionEscalator> {
        &self.escalator
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn is_online(&self) -> bool {
        self.coordinator.is_online()
    }

    /// Start background tasks and initialize the remote connection.
    ///
    /// The client is usable offline even when this fails; calling it again
    /// retries initialization without spawning the tasks twice.
    pub async fn start(&self) -> Result<()> {
        self.spawn_tasks();
        if let Err(e) = self.coordinator.initialize().await {
            warn!(error = %e, "starting offline");
            return Err(e);
        }
        info!(online = self.coordinator.is_online(), "client started");
        self.sync.schedule_background_sync();
        Ok(())
    }

    /// Flush pending writes and pull the current scopes now.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.sync.sync_now().await
    }

    fn spawn_tasks(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.coordinator.spawn_monitor());
        if self.config.sync.sync_on_reconnect {
            tasks.push(spawn_reconnect_sync(
                self.coordinator.subscribe(),
                Arc::downgrade(&self.sync),
            ));
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Schedule a sync whenever the coordinator comes back online.
fn spawn_reconnect_sync(
    mut events: broadcast::Receiver<CoordinatorEvent>,
    sync: Weak<Synchronizer>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CoordinatorEvent::WentOnline) => {
                    let Some(sync) = sync.upgrade() else { break };
                    debug!("back online; scheduling sync");
                    sync.schedule_background_sync();
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "coordinator events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Convenience functions for quickly creating in-memory clients.
pub mod quick {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::memory::{MemoryBackend, MemoryRemoteFactory};
    use crate::notify::RecordingNotifier;

    /// A client wired to in-memory boundaries, with handles to drive them.
    pub struct MemorySetup {
        pub client: Client,
        pub backend: Arc<MemoryBackend>,
        pub factory: Arc<MemoryRemoteFactory>,
        pub host: Arc<ManualConnectivity>,
        pub notifier: Arc<RecordingNotifier>,
        pub blobs: Arc<MemoryBlobStore>,
    }

    /// A client over a fresh in-memory backend.
    pub fn memory_client(config: ClientConfig) -> MemorySetup {
        memory_client_on(MemoryBackend::new(), config)
    }

    /// A client over an existing backend, e.g. a second device.
    pub fn memory_client_on(backend: Arc<MemoryBackend>, config: ClientConfig) -> MemorySetup {
        let factory = Arc::new(MemoryRemoteFactory::new(backend.clone()));
        let host = Arc::new(ManualConnectivity::new(true));
        let notifier = Arc::new(RecordingNotifier::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let client = ClientBuilder::new(factory.clone())
            .config(config)
            .connectivity(host.clone())
            .notifier(notifier.clone())
            .blob_store(blobs.clone())
            .build();
        MemorySetup {
            client,
            backend,
            factory,
            host,
            notifier,
            blobs,
        }
    }
}
