// src/core/discovery/mod.rs

//! Discovery sources: multicast DNS browsing and periodic polling of remote
//! spoolers, unified behind the [`DiscoverySource`] capability set.

pub mod mdns;
pub mod poll;

pub use mdns::MdnsSource;
pub use poll::PollSource;

use crate::core::errors::BridgeError;
use crate::core::events::DiscoveryEvent;
use crate::core::state::BridgeState;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

/// A source of discovery events. `start` begins producing events into the
/// given channel; `stop` ceases production and releases resources.
pub trait DiscoverySource: Send {
    fn name(&self) -> &'static str;

    fn start(&mut self, tx: mpsc::Sender<DiscoveryEvent>) -> Result<(), BridgeError>;

    fn stop(&mut self);
}

/// Owns the configured sources for the lifetime of the daemon.
pub struct DiscoverySupervisor {
    state: Arc<BridgeState>,
    sources: Vec<Box<dyn DiscoverySource>>,
}

impl DiscoverySupervisor {
    /// Builds the supervisor from the configuration: an mDNS source when
    /// browsing is enabled, and one poll source when servers are configured.
    pub async fn from_config(state: Arc<BridgeState>) -> Result<Self, BridgeError> {
        let discovery = state.config.lock().await.discovery.clone();
        let mut sources: Vec<Box<dyn DiscoverySource>> = Vec::new();

        if discovery.mdns {
            sources.push(Box::new(MdnsSource::new(discovery.service_types.clone())));
        }
        if !discovery.poll_servers.is_empty() {
            sources.push(Box::new(PollSource::new(
                discovery.poll_servers.clone(),
                discovery.poll_interval,
                discovery.endpoint_timeout,
            )?));
        }

        Ok(Self { state, sources })
    }

    /// Starts every source, waits for shutdown, then stops them.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let tx = self.state.discovery_tx.clone();
        for source in &mut self.sources {
            match source.start(tx.clone()) {
                Ok(()) => info!("Discovery source '{}' started.", source.name()),
                Err(e) => error!("Discovery source '{}' failed to start: {e}", source.name()),
            }
        }

        let _ = shutdown_rx.recv().await;

        for source in &mut self.sources {
            source.stop();
            info!("Discovery source '{}' stopped.", source.name());
        }
    }
}
