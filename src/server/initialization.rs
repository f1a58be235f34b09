// src/server/initialization.rs

//! Handles the complete daemon initialization process: state setup, the
//! spooler client, persisted state, and absorption of prior-session queues.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::registry::intake;
use crate::core::spooler::{IppSpoolerClient, PpdGenerator};
use crate::core::state::{BridgeInit, BridgeState};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

/// Initializes all daemon components before starting the controller loop.
pub async fn setup(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let client = Arc::new(
        IppSpoolerClient::new(
            &config.spooler.host,
            config.spooler.port,
            config.spooler.timeout,
            config.discovery.endpoint_timeout,
        )
        .context("Failed to construct the spooler client")?,
    );

    let BridgeInit {
        state,
        discovery_rx,
        spooler_event_rx,
        reconciler_wake_rx,
        shutdown_request_rx,
    } = BridgeState::initialize(
        config,
        client.clone(),
        client,
        Arc::new(PpdGenerator),
        log_reload_handle,
    )
    .context("Failed to initialize daemon state")?;
    info!("Daemon state initialized.");

    state
        .state_dir
        .ensure()
        .await
        .context("Cache directory is unusable")?;

    prime_from_spooler(&state).await;

    Ok(ServerContext {
        state,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        discovery_rx,
        spooler_event_rx,
        reconciler_wake_rx: Some(reconciler_wake_rx),
        shutdown_request_rx,
    })
}

/// Primes the local-queue mirror and the default tracking from the live
/// spooler, and absorbs queues a previous session left behind. Failures are
/// tolerated; the daemon converges once the spooler is reachable.
async fn prime_from_spooler(state: &Arc<BridgeState>) {
    match state.spooler.list_local_printers().await {
        Ok(queues) => {
            info!("Spooler lists {} local queues.", queues.len());
            let ours: Vec<_> = queues.iter().filter(|q| q.daemon_controlled).cloned().collect();
            state.local_queues.write().await.replace_all(queues);
            for queue in &ours {
                intake::absorb_prior_queue(state, queue).await;
            }
        }
        Err(e) => {
            warn!("Cannot list spooler queues yet: {e}");
        }
    }

    match state.spooler.get_default().await {
        Ok(default) => {
            state.defaults.lock().await.current = default;
        }
        Err(e) => {
            warn!("Cannot read the default queue yet: {e}");
        }
    }
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Bridging spooler at {}:{} (RPC timeout {:?}).",
        config.spooler.host, config.spooler.port, config.spooler.timeout
    );
    if config.discovery.mdns {
        info!(
            "Browsing for {} via multicast DNS.",
            config.discovery.service_types.join(", ")
        );
    }
    if !config.discovery.poll_servers.is_empty() {
        info!(
            "Polling {} remote spooler(s) every {:?}.",
            config.discovery.poll_servers.len(),
            config.discovery.poll_interval
        );
    }
    if config.policy.auto_shutdown {
        info!(
            "Auto-shutdown enabled ({:?} after {:?}).",
            config.policy.auto_shutdown_on, config.policy.auto_shutdown_timeout
        );
    }
}
