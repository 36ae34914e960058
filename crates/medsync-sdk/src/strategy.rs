//! Recovery strategies applied by the resolution escalator.

use crate::coordinator::{ConnectionCoordinator, ReinitOverrides};
use crate::error::Result;
use crate::remote::TransportMode;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// One rung of the recovery ladder.
///
/// `apply` returns whether the remote store is reachable afterwards.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn apply(&self, coordinator: &ConnectionCoordinator) -> Result<bool>;
}

/// The built-in strategies, from least to most invasive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinStrategy {
    EnableLongPolling,
    RotateEmulatorPort,
    ApplyTransportFallback,
    ForceOfflineMode,
    FullReset,
}

impl BuiltinStrategy {
    pub const ORDER: [BuiltinStrategy; 5] = [
        BuiltinStrategy::EnableLongPolling,
        BuiltinStrategy::RotateEmulatorPort,
        BuiltinStrategy::ApplyTransportFallback,
        BuiltinStrategy::ForceOfflineMode,
        BuiltinStrategy::FullReset,
    ];

    /// The default ladder, in escalation order.
    pub fn ladder() -> Vec<Arc<dyn RecoveryStrategy>> {
        Self::ORDER
            .iter()
            .map(|s| Arc::new(*s) as Arc<dyn RecoveryStrategy>)
            .collect()
    }

    fn overrides(&self, coordinator: &ConnectionCoordinator) -> ReinitOverrides {
        match self {
            BuiltinStrategy::EnableLongPolling => {
                ReinitOverrides::transport(TransportMode::LongPolling)
            }
            BuiltinStrategy::RotateEmulatorPort => match coordinator.next_emulator_port() {
                Some(port) => ReinitOverrides::emulator_port(port),
                None => {
                    debug!("no emulator configured; rebuilding client with current settings");
                    ReinitOverrides::default()
                }
            },
            BuiltinStrategy::ApplyTransportFallback => ReinitOverrides {
                transport: Some(TransportMode::LongPollingNoFetchStreams),
                force_cache: Some(false),
                ..ReinitOverrides::default()
            },
            BuiltinStrategy::ForceOfflineMode => ReinitOverrides::force_offline(),
            BuiltinStrategy::FullReset => ReinitOverrides::reset(),
        }
    }
}

#[async_trait]
impl RecoveryStrategy for BuiltinStrategy {
    fn name(&self) -> &str {
        match self {
            BuiltinStrategy::EnableLongPolling => "enable_long_polling",
            BuiltinStrategy::RotateEmulatorPort => "rotate_emulator_port",
            BuiltinStrategy::ApplyTransportFallback => "apply_transport_fallback",
            BuiltinStrategy::ForceOfflineMode => "force_offline_mode",
            BuiltinStrategy::FullReset => "full_reset",
        }
    }

    async fn apply(&self, coordinator: &ConnectionCoordinator) -> Result<bool> {
        coordinator.reinitialize(self.overrides(coordinator)).await
    }
}
