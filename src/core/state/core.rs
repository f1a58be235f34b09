// src/core/state/core.rs

//! Defines the central `BridgeState` struct, holding all shared daemon state.

use super::stats::StatsState;
use crate::config::Config;
use crate::core::errors::BridgeError;
use crate::core::events::{DiscoveryEvent, SpoolerEvent};
use crate::core::persist::StateDir;
use crate::core::policy::{AccessPolicy, BrowseFilters};
use crate::core::registry::Registry;
use crate::core::spooler::{
    DescriptorGenerator, EndpointRpc, LocalQueueCache, SpoolerRpc, Subscription,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing_subscriber::{filter::EnvFilter, reload};

/// Channel capacity for discovery events; bursts happen when a network with
/// many printers comes up.
const DISCOVERY_CHANNEL_CAPACITY: usize = 1024;

/// Channel capacity for spooler notifications.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// Why the daemon is asking itself to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    AutoShutdown,
}

/// Default-printer bookkeeping, driven by the notification handler.
#[derive(Debug, Default)]
pub struct DefaultTracking {
    /// The spooler's current default queue, as last observed.
    pub current: Option<String>,
}

/// Contains all initialized components required to spawn the daemon's
/// background tasks. Created once during initialization and consumed by the
/// spawner.
pub struct BridgeInit {
    pub state: Arc<BridgeState>,
    /// Receives discovery events for the controller loop.
    pub discovery_rx: mpsc::Receiver<DiscoveryEvent>,
    /// Receives spooler notifications for the controller loop.
    pub spooler_event_rx: mpsc::Receiver<SpoolerEvent>,
    /// Wakes the reconciler when registry deadlines change.
    pub reconciler_wake_rx: mpsc::Receiver<()>,
    /// Receives shutdown requests from signals and the auto-shutdown task.
    pub shutdown_request_rx: mpsc::Receiver<ShutdownReason>,
}

/// The central struct holding all shared daemon state. Wrapped in an `Arc`
/// and passed to every task.
pub struct BridgeState {
    /// Runtime configuration; a mutex so reload paths can swap values.
    pub config: Arc<Mutex<Config>>,
    /// The remote-printer registry.
    pub registry: RwLock<Registry>,
    /// Cached mirror of the spooler's queue list.
    pub local_queues: RwLock<LocalQueueCache>,
    /// All RPC to the local spooler.
    pub spooler: Arc<dyn SpoolerRpc>,
    /// All RPC to remote endpoints.
    pub endpoints: Arc<dyn EndpointRpc>,
    /// The external descriptor generator.
    pub generator: Arc<dyn DescriptorGenerator>,
    pub access_policy: AccessPolicy,
    pub browse_filters: BrowseFilters,
    /// Persisted state files in the cache directory.
    pub state_dir: StateDir,
    /// The active notification subscription, once established.
    pub subscription: Mutex<Option<Subscription>>,
    pub defaults: Mutex<DefaultTracking>,
    pub stats: StatsState,
    /// Senders cloned into the discovery sources and notification intake.
    pub discovery_tx: mpsc::Sender<DiscoveryEvent>,
    pub spooler_event_tx: mpsc::Sender<SpoolerEvent>,
    reconciler_wake_tx: mpsc::Sender<()>,
    shutdown_request_tx: mpsc::Sender<ShutdownReason>,
    pub auto_shutdown_enabled: AtomicBool,
    pub shutting_down: AtomicBool,
    /// Handle to the logging filter, for dynamic level changes.
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
}

impl BridgeState {
    /// Initializes the shared state and the channels its tasks communicate
    /// over.
    pub fn initialize(
        config: Config,
        spooler: Arc<dyn SpoolerRpc>,
        endpoints: Arc<dyn EndpointRpc>,
        generator: Arc<dyn DescriptorGenerator>,
        log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    ) -> Result<BridgeInit, BridgeError> {
        let access_policy = AccessPolicy::compile(&config.policy)?;
        let browse_filters = BrowseFilters::compile(&config.policy)?;
        let state_dir = StateDir::new(&config.cache_dir);
        let auto_shutdown = config.policy.auto_shutdown;

        let (discovery_tx, discovery_rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);
        let (spooler_event_tx, spooler_event_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let (reconciler_wake_tx, reconciler_wake_rx) = mpsc::channel(1);
        let (shutdown_request_tx, shutdown_request_rx) = mpsc::channel(4);

        let state = Arc::new(Self {
            config: Arc::new(Mutex::new(config)),
            registry: RwLock::new(Registry::new()),
            local_queues: RwLock::new(LocalQueueCache::default()),
            spooler,
            endpoints,
            generator,
            access_policy,
            browse_filters,
            state_dir,
            subscription: Mutex::new(None),
            defaults: Mutex::new(DefaultTracking::default()),
            stats: StatsState::new(),
            discovery_tx,
            spooler_event_tx,
            reconciler_wake_tx,
            shutdown_request_tx,
            auto_shutdown_enabled: AtomicBool::new(auto_shutdown),
            shutting_down: AtomicBool::new(false),
            log_reload_handle,
        });

        Ok(BridgeInit {
            state,
            discovery_rx,
            spooler_event_rx,
            reconciler_wake_rx,
            shutdown_request_rx,
        })
    }

    /// Nudges the reconciler to recompute its timer. Lossless enough: the
    /// channel holds one pending wake and the reconciler drains it.
    pub fn wake_reconciler(&self) {
        let _ = self.reconciler_wake_tx.try_send(());
    }

    /// Requests daemon shutdown.
    pub async fn request_shutdown(&self, reason: ShutdownReason) {
        let _ = self.shutdown_request_tx.send(reason).await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Whether the daemon holds a live notification subscription; sentinel
    /// URIs are only safe with one.
    pub async fn has_notification_channel(&self) -> bool {
        self.subscription.lock().await.is_some()
    }
}
