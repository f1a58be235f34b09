// src/server/context.rs

use crate::core::events::{DiscoveryEvent, SpoolerEvent};
use crate::core::state::{BridgeState, ShutdownReason};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

/// Holds everything the spawner and the controller loop need.
pub struct ServerContext {
    pub state: Arc<BridgeState>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<anyhow::Result<()>>,
    pub discovery_rx: mpsc::Receiver<DiscoveryEvent>,
    pub spooler_event_rx: mpsc::Receiver<SpoolerEvent>,
    /// Consumed by the spawner when the reconciler task starts.
    pub reconciler_wake_rx: Option<mpsc::Receiver<()>>,
    pub shutdown_request_rx: mpsc::Receiver<ShutdownReason>,
}
