//! Connection Coordinator - the single owner of "are we online".
//!
//! The coordinator builds the remote client once, probes it, tracks the
//! resulting [`ConnectionState`], and rebuilds the client under a new
//! identity when a recovery strategy asks for it. Every other component
//! holds an `Arc<ConnectionCoordinator>` and reads state through it.
//!
//! Probe completions are tagged with the epoch they started in; a result
//! that arrives after a `reinitialize` bumped the epoch is discarded.

use crate::config::CoordinatorConfig;
use crate::connectivity::{ConnectivityEvent, ConnectivitySource};
use crate::error::{Result, SyncError};
use crate::notify::{Notification, Notifier, NotifyKind, RecoveryAction};
use crate::remote::{
    EmulatorEndpoint, Query, RemoteSettings, RemoteStore, RemoteStoreFactory, TransportMode,
};
use crate::timeout::{with_timeout, Timed};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle phase of the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Uninitialized,
    Initializing,
    Online,
    Offline,
    Reinitializing,
}

/// Snapshot of the connection state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionState {
    pub online: bool,
    pub remote_initialized: bool,
    pub remote_available: bool,
    pub last_probe_time: Option<Instant>,
    pub consecutive_failures: u32,
    /// Highest strategy index applied in the current failure episode.
    pub active_strategy_index: usize,
    pub phase: ConnectionPhase,
    /// Incremented on every reinitialize.
    pub epoch: u64,
    /// Set while the user has explicitly chosen to work offline.
    pub offline_mode: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            online: false,
            remote_initialized: false,
            remote_available: false,
            last_probe_time: None,
            consecutive_failures: 0,
            active_strategy_index: 0,
            phase: ConnectionPhase::Uninitialized,
            epoch: 0,
            offline_mode: false,
        }
    }
}

/// Events emitted by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorEvent {
    WentOnline,
    WentOffline,
    Reinitialized { epoch: u64, identity: String },
    InitFailed(String),
}

/// Configuration changes applied by [`ConnectionCoordinator::reinitialize`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReinitOverrides {
    pub transport: Option<TransportMode>,
    /// Point the client at the local emulator on this port.
    pub emulator_port: Option<u16>,
    pub force_cache: Option<bool>,
    /// Disable the network and stay offline instead of reconnecting.
    pub force_offline: bool,
    /// Discard all earlier overrides and start from the base settings.
    pub reset: bool,
}

impl ReinitOverrides {
    pub fn transport(mode: TransportMode) -> Self {
        Self {
            transport: Some(mode),
            ..Self::default()
        }
    }

    pub fn emulator_port(port: u16) -> Self {
        Self {
            emulator_port: Some(port),
            ..Self::default()
        }
    }

    pub fn force_offline() -> Self {
        Self {
            force_offline: true,
            ..Self::default()
        }
    }

    pub fn reset() -> Self {
        Self {
            reset: true,
            ..Self::default()
        }
    }
}

enum InitSlot {
    Idle,
    Running(watch::Receiver<Option<Result<()>>>),
    Ready,
}

enum InitRole {
    Leader(watch::Sender<Option<Result<()>>>),
    Follower(watch::Receiver<Option<Result<()>>>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Transition {
    Online { from_offline: bool },
    Offline,
}

pub struct ConnectionCoordinator {
    factory: Arc<dyn RemoteStoreFactory>,
    connectivity: Arc<dyn ConnectivitySource>,
    notifier: Arc<dyn Notifier>,
    config: CoordinatorConfig,
    base_settings: RemoteSettings,
    settings: RwLock<RemoteSettings>,
    client: RwLock<Option<Arc<dyn RemoteStore>>>,
    state: RwLock<ConnectionState>,
    init: Mutex<InitSlot>,
    reinit_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl ConnectionCoordinator {
    pub fn new(
        factory: Arc<dyn RemoteStoreFactory>,
        connectivity: Arc<dyn ConnectivitySource>,
        notifier: Arc<dyn Notifier>,
        settings: RemoteSettings,
        config: CoordinatorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            factory,
            connectivity,
            notifier,
            config,
            base_settings: settings.clone(),
            settings: RwLock::new(settings),
            client: RwLock::new(None),
            state: RwLock::new(ConnectionState::default()),
            init: Mutex::new(InitSlot::Idle),
            reinit_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            events,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn is_online(&self) -> bool {
        self.state.read().online
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().remote_initialized
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.read().phase
    }

    /// Settings the current client was built with.
    pub fn settings(&self) -> RemoteSettings {
        self.settings.read().clone()
    }

    /// The current remote client, if one has been built.
    pub fn client(&self) -> Option<Arc<dyn RemoteStore>> {
        self.client.read().clone()
    }

    /// The current client, or [`SyncError::Offline`] when remote calls should
    /// not be attempted.
    pub fn online_client(&self) -> Result<Arc<dyn RemoteStore>> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        self.client().ok_or(SyncError::Offline)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    fn next_identity(&self) -> String {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let app = self.settings.read().app_name.clone();
        if generation == 0 {
            app
        } else {
            format!("{}-{}", app, generation)
        }
    }

    // ---------------------------------------------------------------------
    // Initialization
    // ---------------------------------------------------------------------

    /// Build the remote client and run the first probe.
    ///
    /// Idempotent: once it has succeeded, later calls return immediately;
    /// callers arriving while it runs wait for and share its result. A failed
    /// initialization leaves the coordinator offline and is not cached.
    pub async fn initialize(&self) -> Result<()> {
        let role = {
            let mut slot = self.init.lock();
            let running = match &*slot {
                InitSlot::Ready => return Ok(()),
                // A closed channel means the previous leader was dropped mid-flight.
                InitSlot::Running(rx) if rx.has_changed().is_ok() => Some(rx.clone()),
                _ => None,
            };
            match running {
                Some(rx) => InitRole::Follower(rx),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = InitSlot::Running(rx);
                    InitRole::Leader(tx)
                }
            }
        };

        match role {
            InitRole::Follower(mut rx) => loop {
                let current = rx.borrow().clone();
                if let Some(result) = current {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err(SyncError::Init("initialization was abandoned".to_string()));
                }
            },
            InitRole::Leader(tx) => {
                let result = self.run_initialize().await;
                *self.init.lock() = match result {
                    Ok(()) => InitSlot::Ready,
                    Err(_) => InitSlot::Idle,
                };
                let _ = tx.send(Some(result.clone()));
                result
            }
        }
    }

    async fn run_initialize(&self) -> Result<()> {
        self.state.write().phase = ConnectionPhase::Initializing;
        let identity = self.next_identity();
        let settings = self.settings();
        info!(identity = %identity, transport = ?settings.transport, "initializing remote client");

        let client = match with_timeout(
            self.config.connect_timeout(),
            self.factory.connect(&identity, &settings),
        )
        .await
        {
            Timed::Completed(Ok(client)) => client,
            Timed::Completed(Err(e)) => return Err(self.fail_init(e.to_string())),
            Timed::TimedOut => {
                return Err(self.fail_init(format!(
                    "timed out after {:?} building the remote client",
                    self.config.connect_timeout()
                )))
            }
        };

        self.prepare_client(client.as_ref()).await;
        *self.client.write() = Some(client);
        self.state.write().remote_initialized = true;

        let online = self.test_connection().await;
        info!(online, "remote client initialized");
        Ok(())
    }

    /// Wait for auth to settle and turn on persistence; neither is fatal.
    async fn prepare_client(&self, client: &dyn RemoteStore) {
        if with_timeout(self.config.auth_wait(), client.wait_for_auth_ready())
            .await
            .is_timed_out()
        {
            debug!("auth not ready within {:?}; continuing", self.config.auth_wait());
        }
        if let Err(e) = client.enable_persistence().await {
            warn!(error = %e, "local persistence unavailable; continuing without it");
        }
    }

    fn fail_init(&self, reason: String) -> SyncError {
        warn!(reason = %reason, "remote initialization failed; running offline");
        self.apply_transition(|s| {
            s.phase = ConnectionPhase::Offline;
            s.remote_available = false;
            let was_online = s.online;
            s.online = false;
            was_online.then_some(Transition::Offline)
        });
        self.notifier.notify(
            Notification::new(
                NotifyKind::Error,
                "Unable to connect",
                "Could not reach the records server. Your data stays available on this device.",
            )
            .with_actions(&[RecoveryAction::Reload, RecoveryAction::GoOffline]),
        );
        let _ = self.events.send(CoordinatorEvent::InitFailed(reason.clone()));
        SyncError::Init(reason)
    }

    // ---------------------------------------------------------------------
    // Probing
    // ---------------------------------------------------------------------

    /// Run one lightweight read against the remote store. Never fails.
    pub async fn test_connection(&self) -> bool {
        let (epoch, offline_mode) = {
            let s = self.state.read();
            (s.epoch, s.offline_mode)
        };
        if offline_mode {
            return false;
        }
        if !self.connectivity.is_online() {
            debug!("host reports offline; skipping probe");
            self.record_probe(epoch, false);
            return false;
        }
        let Some(client) = self.client() else {
            self.record_probe(epoch, false);
            return false;
        };

        let query = Query::collection(self.config.probe_collection.clone()).limit(1);
        let ok = match with_timeout(self.config.probe_timeout(), client.query(&query)).await {
            Timed::Completed(Ok(_)) => true,
            Timed::Completed(Err(e)) => {
                debug!(error = %e, "connectivity probe failed");
                false
            }
            Timed::TimedOut => {
                debug!("connectivity probe timed out");
                false
            }
        };

        if !self.record_probe(epoch, ok) {
            return self.is_online();
        }
        ok
    }

    /// Apply a probe result. Returns `false` if the result was stale.
    fn record_probe(&self, epoch: u64, ok: bool) -> bool {
        let mut stale = false;
        self.apply_transition(|s| {
            if s.epoch != epoch {
                stale = true;
                return None;
            }
            s.last_probe_time = Some(Instant::now());
            let was_online = s.online;
            let from_offline = s.phase == ConnectionPhase::Offline;
            if ok {
                s.online = true;
                s.remote_available = true;
                s.consecutive_failures = 0;
                s.active_strategy_index = 0;
                s.phase = ConnectionPhase::Online;
                (!was_online).then_some(Transition::Online { from_offline })
            } else {
                s.online = false;
                s.remote_available = false;
                s.consecutive_failures += 1;
                s.phase = ConnectionPhase::Offline;
                was_online.then_some(Transition::Offline)
            }
        });
        if stale {
            debug!(epoch, "discarding probe result from an earlier client");
        }
        !stale
    }

    /// Mutate state under the lock, then announce any transition outside it.
    fn apply_transition(&self, f: impl FnOnce(&mut ConnectionState) -> Option<Transition>) {
        let transition = {
            let mut s = self.state.write();
            f(&mut s)
        };
        match transition {
            Some(Transition::Online { from_offline }) => {
                info!("remote store reachable; online");
                if from_offline {
                    self.notifier.notify(Notification::new(
                        NotifyKind::Success,
                        "Back online",
                        "Connection restored. Syncing your changes.",
                    ));
                }
                let _ = self.events.send(CoordinatorEvent::WentOnline);
            }
            Some(Transition::Offline) => {
                warn!("remote store unreachable; offline");
                self.notifier.notify(Notification::new(
                    NotifyKind::Warning,
                    "You are offline",
                    "Changes are saved on this device and will sync when the connection returns.",
                ));
                let _ = self.events.send(CoordinatorEvent::WentOffline);
            }
            None => {}
        }
    }

    /// Host reported loss of connectivity: go offline without probing.
    pub fn handle_host_offline(&self) {
        self.apply_transition(|s| {
            let was_online = s.online;
            s.online = false;
            s.remote_available = false;
            if s.phase == ConnectionPhase::Online {
                s.phase = ConnectionPhase::Offline;
            }
            was_online.then_some(Transition::Offline)
        });
    }

    // ---------------------------------------------------------------------
    // Recovery hooks
    // ---------------------------------------------------------------------

    /// Clear the failure episode after a successful recovery.
    pub fn reset_failures(&self) {
        let mut s = self.state.write();
        s.consecutive_failures = 0;
        s.active_strategy_index = 0;
    }

    /// Record that the strategy at `index` is being applied.
    pub fn note_strategy(&self, index: usize) {
        let mut s = self.state.write();
        s.active_strategy_index = s.active_strategy_index.max(index);
    }

    /// Next port to try when rotating the emulator endpoint.
    ///
    /// `None` when no emulator is configured.
    pub fn next_emulator_port(&self) -> Option<u16> {
        let settings = self.settings.read();
        let current = settings.emulator.as_ref()?.port;
        let ports = &settings.emulator_ports;
        if ports.is_empty() {
            return None;
        }
        let next = match ports.iter().position(|p| *p == current) {
            Some(i) => ports[(i + 1) % ports.len()],
            None => ports[0],
        };
        Some(next)
    }

    /// Tear down network access on the current client, apply `overrides`,
    /// build a fresh client under a new identity and probe it.
    ///
    /// Returns whether the new client is reachable. Disposal of the old
    /// client happens in the background and its failures are ignored.
    pub async fn reinitialize(&self, overrides: ReinitOverrides) -> Result<bool> {
        let _guard = self.reinit_lock.lock().await;
        let epoch = {
            let mut s = self.state.write();
            s.epoch += 1;
            s.phase = ConnectionPhase::Reinitializing;
            s.epoch
        };
        let old = self.client();
        info!(epoch, overrides = ?overrides, "reinitializing remote client");

        if let Some(old) = &old {
            if let Err(e) = old.disable_network().await {
                debug!(error = %e, "disable_network on old client failed");
            }
        }

        if overrides.force_offline {
            self.mark_offline_mode();
            return Ok(false);
        }

        let settings = {
            let mut settings = self.settings.write();
            if overrides.reset {
                *settings = self.base_settings.clone();
            }
            if let Some(transport) = overrides.transport {
                settings.transport = transport;
            }
            if let Some(port) = overrides.emulator_port {
                let host = settings
                    .emulator
                    .as_ref()
                    .map(|e| e.host.clone())
                    .unwrap_or_else(|| "localhost".to_string());
                settings.emulator = Some(EmulatorEndpoint { host, port });
            }
            if let Some(force_cache) = overrides.force_cache {
                settings.force_cache = force_cache;
            }
            settings.clone()
        };
        {
            let mut s = self.state.write();
            s.offline_mode = false;
            if overrides.reset {
                s.consecutive_failures = 0;
                s.active_strategy_index = 0;
            }
        }

        let identity = self.next_identity();
        let connected = with_timeout(
            self.config.connect_timeout(),
            self.factory.connect(&identity, &settings),
        )
        .await;
        let client = match connected {
            Timed::Completed(Ok(client)) => client,
            Timed::Completed(Err(e)) => {
                warn!(identity = %identity, error = %e, "reinitialize could not build a client");
                self.record_probe(epoch, false);
                return Err(e.into());
            }
            Timed::TimedOut => {
                warn!(identity = %identity, "reinitialize timed out building a client");
                self.record_probe(epoch, false);
                return Err(SyncError::Timeout(self.config.connect_timeout()));
            }
        };

        self.prepare_client(client.as_ref()).await;
        *self.client.write() = Some(client);
        self.state.write().remote_initialized = true;
        *self.init.lock() = InitSlot::Ready;

        if let Some(old) = old {
            tokio::spawn(async move {
                if let Err(e) = old.terminate().await {
                    debug!(identity = old.identity(), error = %e, "old client disposal failed");
                }
            });
        }

        let _ = self.events.send(CoordinatorEvent::Reinitialized {
            epoch,
            identity: identity.clone(),
        });
        let online = self.test_connection().await;
        info!(epoch, identity = %identity, online, "reinitialize complete");
        Ok(online)
    }

    // ---------------------------------------------------------------------
    // Explicit offline mode
    // ---------------------------------------------------------------------

    /// Stop talking to the remote store until [`leave_offline_mode`] is called.
    ///
    /// [`leave_offline_mode`]: ConnectionCoordinator::leave_offline_mode
    pub async fn enter_offline_mode(&self) {
        if let Some(client) = self.client() {
            if let Err(e) = client.disable_network().await {
                debug!(error = %e, "disable_network failed");
            }
        }
        self.mark_offline_mode();
    }

    fn mark_offline_mode(&self) {
        self.apply_transition(|s| {
            let was_online = s.online;
            s.offline_mode = true;
            s.online = false;
            s.remote_available = false;
            s.phase = ConnectionPhase::Offline;
            was_online.then_some(Transition::Offline)
        });
        info!("offline mode enabled");
    }

    /// Re-enable the network and probe.
    pub async fn leave_offline_mode(&self) -> bool {
        self.state.write().offline_mode = false;
        if let Some(client) = self.client() {
            if let Err(e) = client.enable_network().await {
                debug!(error = %e, "enable_network failed");
            }
        }
        info!("offline mode disabled");
        self.test_connection().await
    }

    // ---------------------------------------------------------------------
    // Background monitor
    // ---------------------------------------------------------------------

    /// Probe if the host is online and the last probe is stale.
    pub async fn monitor_tick(&self) -> Option<bool> {
        if !self.connectivity.is_online() {
            return None;
        }
        let due = {
            let s = self.state.read();
            !s.offline_mode
                && s
                    .last_probe_time
                    .map_or(true, |t| t.elapsed() >= self.config.probe_staleness())
        };
        if !due {
            return None;
        }
        Some(self.test_connection().await)
    }

    /// Start the periodic monitor and the host connectivity listener.
    ///
    /// The task holds only a weak reference and ends once the coordinator is
    /// dropped.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut host_events = self.connectivity.subscribe();
        let period = self.config.monitor_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(this) = weak.upgrade() else { break };
                        this.monitor_tick().await;
                    }
                    event = host_events.recv() => {
                        let Some(this) = weak.upgrade() else { break };
                        match event {
                            Ok(ConnectivityEvent::Offline) => this.handle_host_offline(),
                            Ok(ConnectivityEvent::Online) => {
                                this.test_connection().await;
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!(skipped, "connectivity events lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            debug!("connectivity monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ManualConnectivity;
    use crate::error::RemoteError;
    use crate::memory::{MemoryBackend, MemoryRemoteFactory};
    use crate::notify::RecordingNotifier;
    use std::time::Duration;

    struct Harness {
        backend: Arc<MemoryBackend>,
        factory: Arc<MemoryRemoteFactory>,
        host: Arc<ManualConnectivity>,
        notifier: Arc<RecordingNotifier>,
        coordinator: Arc<ConnectionCoordinator>,
    }

    fn harness(settings: RemoteSettings) -> Harness {
        let backend = MemoryBackend::new();
        let factory = Arc::new(MemoryRemoteFactory::new(backend.clone()));
        let host = Arc::new(ManualConnectivity::new(true));
        let notifier = Arc::new(RecordingNotifier::new());
        let coordinator = Arc::new(ConnectionCoordinator::new(
            factory.clone(),
            host.clone(),
            notifier.clone(),
            settings,
            CoordinatorConfig::default(),
        ));
        Harness {
            backend,
            factory,
            host,
            notifier,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let h = harness(RemoteSettings::default());
        assert_eq!(h.coordinator.phase(), ConnectionPhase::Uninitialized);

        let (a, b) = tokio::join!(h.coordinator.initialize(), h.coordinator.initialize());
        assert!(a.is_ok() && b.is_ok());
        h.coordinator.initialize().await.unwrap();

        assert_eq!(h.factory.history().len(), 1);
        assert_eq!(h.factory.history()[0].0, "medsync");
        assert!(h.coordinator.is_initialized());
        assert!(h.coordinator.is_online());
        assert_eq!(h.coordinator.phase(), ConnectionPhase::Online);
    }

    #[tokio::test]
    async fn test_failed_initialize_degrades_and_retries() {
        let h = harness(RemoteSettings::default());
        h.factory.fail_connects(1, RemoteError::unavailable("dns lookup failed"));

        let err = h.coordinator.initialize().await.unwrap_err();
        assert!(matches!(err, SyncError::Init(_)));
        assert_eq!(h.coordinator.phase(), ConnectionPhase::Offline);
        assert!(!h.coordinator.is_online());
        assert_eq!(h.notifier.count_titled("Unable to connect"), 1);

        h.coordinator.initialize().await.unwrap();
        assert!(h.coordinator.is_online());
    }

    #[tokio::test]
    async fn test_initialize_with_unreachable_remote_is_offline_not_error() {
        let h = harness(RemoteSettings::default());
        h.backend.set_reachable(false);

        h.coordinator.initialize().await.unwrap();
        assert!(h.coordinator.is_initialized());
        assert_eq!(h.coordinator.phase(), ConnectionPhase::Offline);
        // Never having been online, there is nothing to announce.
        assert_eq!(h.notifier.count_titled("You are offline"), 0);
    }

    #[tokio::test]
    async fn test_probe_failures_transition_once() {
        let h = harness(RemoteSettings::default());
        h.coordinator.initialize().await.unwrap();
        let mut events = h.coordinator.subscribe();

        h.backend.set_reachable(false);
        assert!(!h.coordinator.test_connection().await);
        assert_eq!(h.coordinator.phase(), ConnectionPhase::Offline);
        assert!(!h.coordinator.test_connection().await);
        assert!(!h.coordinator.test_connection().await);

        assert_eq!(h.coordinator.state().consecutive_failures, 3);
        assert_eq!(h.notifier.count_titled("You are offline"), 1);
        assert_eq!(events.try_recv().unwrap(), CoordinatorEvent::WentOffline);
        assert!(events.try_recv().is_err());

        h.backend.set_reachable(true);
        assert!(h.coordinator.test_connection().await);
        assert_eq!(h.coordinator.state().consecutive_failures, 0);
        assert_eq!(h.notifier.count_titled("Back online"), 1);
        assert_eq!(events.try_recv().unwrap(), CoordinatorEvent::WentOnline);
    }

    #[tokio::test]
    async fn test_host_offline_skips_probe() {
        let h = harness(RemoteSettings::default());
        h.coordinator.initialize().await.unwrap();
        let calls = h.backend.call_count();

        h.host.set_online(false);
        assert!(!h.coordinator.test_connection().await);
        assert_eq!(h.backend.call_count(), calls);
    }

    #[tokio::test]
    async fn test_reinitialize_applies_overrides_under_new_identity() {
        let h = harness(RemoteSettings {
            emulator: Some(EmulatorEndpoint {
                host: "127.0.0.1".to_string(),
                port: 8080,
            }),
            ..RemoteSettings::default()
        });
        h.coordinator.initialize().await.unwrap();
        let first = h.coordinator.client().unwrap();

        assert_eq!(h.coordinator.next_emulator_port(), Some(8081));
        let online = h
            .coordinator
            .reinitialize(ReinitOverrides::emulator_port(8081))
            .await
            .unwrap();
        assert!(online);

        let history = h.factory.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].0, "medsync-1");
        assert_eq!(history[1].1.emulator.as_ref().unwrap().port, 8081);
        assert_eq!(h.coordinator.state().epoch, 1);
        assert_ne!(h.coordinator.client().unwrap().identity(), first.identity());

        h.coordinator
            .reinitialize(ReinitOverrides::transport(TransportMode::LongPolling))
            .await
            .unwrap();
        h.coordinator.reinitialize(ReinitOverrides::reset()).await.unwrap();
        let settings = h.coordinator.settings();
        assert_eq!(settings.transport, TransportMode::Streaming);
        assert_eq!(settings.emulator.unwrap().port, 8080);
    }

    #[tokio::test]
    async fn test_next_emulator_port_wraps_and_requires_emulator() {
        let h = harness(RemoteSettings::default());
        assert_eq!(h.coordinator.next_emulator_port(), None);

        let h = harness(RemoteSettings {
            emulator: Some(EmulatorEndpoint {
                host: "localhost".to_string(),
                port: 8082,
            }),
            ..RemoteSettings::default()
        });
        assert_eq!(h.coordinator.next_emulator_port(), Some(8080));
    }

    #[tokio::test]
    async fn test_force_offline_and_leave() {
        let h = harness(RemoteSettings::default());
        h.coordinator.initialize().await.unwrap();

        let online = h
            .coordinator
            .reinitialize(ReinitOverrides::force_offline())
            .await
            .unwrap();
        assert!(!online);
        assert!(h.coordinator.state().offline_mode);
        assert!(!h.coordinator.test_connection().await);
        assert!(matches!(h.coordinator.online_client(), Err(SyncError::Offline)));

        assert!(h.coordinator.leave_offline_mode().await);
        assert!(h.coordinator.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_probe_is_discarded() {
        let h = harness(RemoteSettings::default());
        h.coordinator.initialize().await.unwrap();

        h.backend.set_latency(Some(Duration::from_millis(200)));
        let coordinator = h.coordinator.clone();
        let probe = tokio::spawn(async move { coordinator.test_connection().await });
        tokio::task::yield_now().await;

        // Bump the epoch while the probe is in flight.
        h.coordinator.state.write().epoch += 1;
        h.backend.set_reachable(false);
        tokio::time::advance(Duration::from_millis(250)).await;
        let _ = probe.await.unwrap();

        // The failure belonged to the old epoch and must not count.
        assert_eq!(h.coordinator.state().consecutive_failures, 0);
        assert!(h.coordinator.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reacts_to_host_events() {
        let h = harness(RemoteSettings::default());
        h.coordinator.initialize().await.unwrap();
        let monitor = h.coordinator.spawn_monitor();

        h.host.set_online(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!h.coordinator.is_online());

        h.host.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.coordinator.is_online());

        monitor.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_probes_when_stale() {
        let h = harness(RemoteSettings::default());
        h.coordinator.initialize().await.unwrap();
        let monitor = h.coordinator.spawn_monitor();

        h.backend.set_reachable(false);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!h.coordinator.is_online());

        monitor.abort();
    }
}
