//! Resolution Strategy Escalator.
//!
//! When a remote call fails with a transport or auth error, the escalator
//! walks the recovery ladder one rung per failure: the first failure of an
//! episode applies strategy 0, the next strategy 1, and so on, capped at the
//! last rung. Only one resolution runs at a time; identical errors inside
//! the dedup window are dropped.

use crate::config::EscalatorConfig;
use crate::coordinator::ConnectionCoordinator;
use crate::error::{FailureClass, Result, SyncError};
use crate::notify::{Notification, NotifyKind, RecoveryAction};
use crate::strategy::{BuiltinStrategy, RecoveryStrategy};
use crate::timeout::{with_timeout, Timed};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Events emitted by the escalator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscalationEvent {
    /// A strategy ran; `recovered` tells whether the remote is reachable.
    Applied {
        attempt: u32,
        index: usize,
        strategy: String,
        recovered: bool,
    },
    /// An identical error was already handled within the dedup window.
    Deduplicated { error: String },
    /// `max_attempts` failed in a row; the counter was reset.
    Exhausted { attempts: u32 },
}

#[derive(Default)]
struct EpisodeState {
    attempts: u32,
    last_error: Option<(String, Instant)>,
}

/// Clears the in-flight latch when the resolution ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ResolutionEscalator {
    coordinator: Arc<ConnectionCoordinator>,
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    config: EscalatorConfig,
    in_flight: AtomicBool,
    episode: Mutex<EpisodeState>,
    events: broadcast::Sender<EscalationEvent>,
}

impl ResolutionEscalator {
    /// Escalator over the built-in ladder.
    pub fn new(coordinator: Arc<ConnectionCoordinator>, config: EscalatorConfig) -> Self {
        Self::with_strategies(coordinator, BuiltinStrategy::ladder(), config)
    }

    pub fn with_strategies(
        coordinator: Arc<ConnectionCoordinator>,
        strategies: Vec<Arc<dyn RecoveryStrategy>>,
        config: EscalatorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            coordinator,
            strategies,
            config,
            in_flight: AtomicBool::new(false),
            episode: Mutex::new(EpisodeState::default()),
            events,
        }
    }

    pub fn config(&self) -> &EscalatorConfig {
        &self.config
    }

    /// Attempts made in the current failure episode.
    pub fn attempts(&self) -> u32 {
        self.episode.lock().attempts
    }

    pub fn is_resolving(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EscalationEvent> {
        self.events.subscribe()
    }

    /// Try to recover from `error`.
    ///
    /// Errors that are not transport or auth related are returned unchanged.
    /// Otherwise resolves to whether the remote store is reachable after
    /// handling; a dropped duplicate resolves to `false`.
    pub async fn resolve(&self, error: &SyncError) -> Result<bool> {
        let Some(class) = error.failure_class() else {
            return Err(error.clone());
        };
        let signature = error.to_string();

        if self.is_duplicate(&signature) {
            debug!(error = %signature, "dropping duplicate error inside dedup window");
            let _ = self.events.send(EscalationEvent::Deduplicated { error: signature });
            return Ok(false);
        }

        let Some(_latch) = InFlight::acquire(&self.in_flight) else {
            return Ok(self.wait_for_in_flight().await);
        };
        Ok(self.escalate(class, &signature).await)
    }

    /// Record `signature` as handled now, unless it was already handled
    /// within the window.
    fn is_duplicate(&self, signature: &str) -> bool {
        let mut episode = self.episode.lock();
        if let Some((last, at)) = &episode.last_error {
            if last == signature && at.elapsed() < self.config.dedup_window() {
                return true;
            }
        }
        episode.last_error = Some((signature.to_string(), Instant::now()));
        false
    }

    /// Wait for the in-flight resolution, then report the coordinator's view.
    async fn wait_for_in_flight(&self) -> bool {
        debug!("resolution already in flight; queueing");
        let poll = self.config.queue_poll();
        let waited = with_timeout(self.config.queue_timeout(), async {
            while self.in_flight.load(Ordering::SeqCst) {
                tokio::time::sleep(poll).await;
            }
        })
        .await;
        match waited {
            Timed::Completed(()) => self.coordinator.is_online(),
            Timed::TimedOut => {
                warn!("gave up waiting for in-flight resolution");
                false
            }
        }
    }

    async fn escalate(&self, class: FailureClass, signature: &str) -> bool {
        if self.strategies.is_empty() {
            return self.coordinator.test_connection().await;
        }

        let attempt = {
            let mut episode = self.episode.lock();
            episode.attempts += 1;
            episode.attempts
        };
        let index = (attempt as usize - 1).min(self.strategies.len() - 1);
        let strategy = &self.strategies[index];
        self.coordinator.note_strategy(index);
        info!(
            attempt,
            index,
            strategy = strategy.name(),
            class = ?class,
            error = %signature,
            "applying recovery strategy"
        );

        let recovered = match with_timeout(
            self.config.attempt_timeout(),
            strategy.apply(&self.coordinator),
        )
        .await
        {
            Timed::Completed(Ok(recovered)) => recovered,
            Timed::Completed(Err(e)) => {
                warn!(strategy = strategy.name(), error = %e, "recovery strategy failed");
                false
            }
            Timed::TimedOut => {
                warn!(
                    strategy = strategy.name(),
                    timeout = ?self.config.attempt_timeout(),
                    "recovery strategy timed out"
                );
                false
            }
        };

        let _ = self.events.send(EscalationEvent::Applied {
            attempt,
            index,
            strategy: strategy.name().to_string(),
            recovered,
        });

        if recovered {
            info!(strategy = strategy.name(), "connection recovered");
            self.episode.lock().attempts = 0;
            self.coordinator.reset_failures();
            return true;
        }

        if attempt >= self.config.max_attempts {
            self.exhausted(attempt);
        }
        false
    }

    fn exhausted(&self, attempts: u32) {
        warn!(attempts, "recovery attempts exhausted");
        self.episode.lock().attempts = 0;
        self.coordinator.notifier().notify(
            Notification::new(
                NotifyKind::Error,
                "Connection problem",
                "We could not reconnect to the records server. Reload the page or continue working offline.",
            )
            .with_actions(&[RecoveryAction::Reload, RecoveryAction::GoOffline]),
        );
        let _ = self.events.send(EscalationEvent::Exhausted { attempts });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::connectivity::ManualConnectivity;
    use crate::coordinator::ConnectionCoordinator;
    use crate::memory::{MemoryBackend, MemoryRemoteFactory};
    use crate::notify::RecordingNotifier;
    use crate::remote::RemoteSettings;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Fixed {
        name: String,
        result: bool,
        delay: Duration,
    }

    #[async_trait]
    impl RecoveryStrategy for Fixed {
        fn name(&self) -> &str {
            &self.name
        }

        async fn apply(&self, _coordinator: &ConnectionCoordinator) -> Result<bool> {
            tokio::time::sleep(self.delay).await;
            Ok(self.result)
        }
    }

    fn fixed(result: bool, delay: Duration) -> Arc<dyn RecoveryStrategy> {
        Arc::new(Fixed {
            name: "fixed".to_string(),
            result,
            delay,
        })
    }

    fn coordinator() -> (Arc<ConnectionCoordinator>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let coordinator = Arc::new(ConnectionCoordinator::new(
            Arc::new(MemoryRemoteFactory::new(MemoryBackend::new())),
            Arc::new(ManualConnectivity::new(true)),
            notifier.clone(),
            RemoteSettings::default(),
            CoordinatorConfig::default(),
        ));
        (coordinator, notifier)
    }

    fn transport_error() -> SyncError {
        SyncError::Transport("Failed to fetch".to_string())
    }

    #[tokio::test]
    async fn test_unclassified_errors_are_rejected() {
        let (coordinator, _) = coordinator();
        let escalator = ResolutionEscalator::new(coordinator, EscalatorConfig::default());

        let err = SyncError::NotFound("records/r1".to_string());
        assert!(matches!(escalator.resolve(&err).await, Err(SyncError::NotFound(_))));
        assert_eq!(escalator.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_errors_are_dropped_within_window() {
        let (coordinator, _) = coordinator();
        let escalator = ResolutionEscalator::with_strategies(
            coordinator,
            vec![fixed(false, Duration::ZERO)],
            EscalatorConfig {
                max_attempts: 10,
                ..EscalatorConfig::default()
            },
        );
        let mut events = escalator.subscribe();

        assert!(!escalator.resolve(&transport_error()).await.unwrap());
        assert!(!escalator.resolve(&transport_error()).await.unwrap());
        assert_eq!(escalator.attempts(), 1);
        assert!(matches!(events.try_recv().unwrap(), EscalationEvent::Applied { .. }));
        assert!(matches!(
            events.try_recv().unwrap(),
            EscalationEvent::Deduplicated { .. }
        ));

        tokio::time::advance(Duration::from_secs(4)).await;
        escalator.resolve(&transport_error()).await.unwrap();
        assert_eq!(escalator.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_attempts() {
        let (coordinator, _) = coordinator();
        let escalator = ResolutionEscalator::with_strategies(
            coordinator,
            vec![fixed(false, Duration::ZERO), fixed(true, Duration::ZERO)],
            EscalatorConfig::default(),
        );

        assert!(!escalator.resolve(&transport_error()).await.unwrap());
        assert_eq!(escalator.attempts(), 1);
        let auth = SyncError::Auth("token expired".to_string());
        assert!(escalator.resolve(&auth).await.unwrap());
        assert_eq!(escalator.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let (coordinator, _) = coordinator();
        let escalator = ResolutionEscalator::with_strategies(
            coordinator,
            vec![fixed(true, Duration::from_secs(60))],
            EscalatorConfig::default(),
        );

        assert!(!escalator.resolve(&transport_error()).await.unwrap());
        assert_eq!(escalator.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_queue_behind_in_flight() {
        let (coordinator, _) = coordinator();
        coordinator.initialize().await.unwrap();
        let escalator = Arc::new(ResolutionEscalator::with_strategies(
            coordinator,
            vec![fixed(true, Duration::from_secs(2))],
            EscalatorConfig::default(),
        ));

        let first = {
            let escalator = escalator.clone();
            tokio::spawn(async move { escalator.resolve(&transport_error()).await })
        };
        tokio::task::yield_now().await;
        assert!(escalator.is_resolving());

        let queued = escalator
            .resolve(&SyncError::Transport("ECONNREFUSED".to_string()))
            .await
            .unwrap();
        assert!(queued);
        assert!(first.await.unwrap().unwrap());
        // Only the first caller escalated.
        assert_eq!(escalator.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_resolves_false() {
        let (coordinator, _) = coordinator();
        let escalator = Arc::new(ResolutionEscalator::with_strategies(
            coordinator,
            vec![fixed(true, Duration::from_secs(14))],
            EscalatorConfig::default(),
        ));

        let first = {
            let escalator = escalator.clone();
            tokio::spawn(async move { escalator.resolve(&transport_error()).await })
        };
        tokio::task::yield_now().await;

        let started = Instant::now();
        let queued = escalator
            .resolve(&SyncError::Transport("dns".to_string()))
            .await
            .unwrap();
        assert!(!queued);
        assert!(started.elapsed() >= Duration::from_secs(10));
        first.await.unwrap().unwrap();
    }
}
