// src/server/event_loop.rs

//! The controller loop: consumes discovery events and spooler notifications,
//! reacts to signals, and drives the graceful shutdown sequence.

use super::context::ServerContext;
use crate::core::notifications;
use crate::core::registry::{PrinterStatus, intake};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Upper bound on draining retiring entries at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on waiting for background tasks once the stop signal is out.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// The main controller loop. Runs until a shutdown signal or request.
pub async fn run(mut ctx: ServerContext) {
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");
    #[cfg(unix)]
    let mut sigusr1 = signal(SignalKind::user_defined1()).expect("Failed to create USR1 stream");
    #[cfg(unix)]
    let mut sigusr2 = signal(SignalKind::user_defined2()).expect("Failed to create USR2 stream");

    loop {
        tokio::select! {
            biased; // Prioritize shutdown over event intake.

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }
            _ = sigusr1.recv() => {
                info!("USR1 received: permanent mode, auto-shutdown disabled.");
                ctx.state.auto_shutdown_enabled.store(false, Ordering::SeqCst);
            }
            _ = sigusr2.recv() => {
                info!("USR2 received: auto-shutdown enabled.");
                ctx.state.auto_shutdown_enabled.store(true, Ordering::SeqCst);
            }

            Some(reason) = ctx.shutdown_request_rx.recv() => {
                info!("Shutdown requested ({reason:?}).");
                break;
            }

            // A task ending on its own is fatal unless it finished cleanly
            // (a disabled feature's task, for instance).
            Some(result) = ctx.background_tasks.join_next() => {
                match result {
                    Ok(Ok(())) => debug!("A background task finished."),
                    Ok(Err(e)) => {
                        error!("Background task failed, stopping the daemon: {e}");
                        break;
                    }
                    Err(e) => {
                        error!("Background task panicked, stopping the daemon: {e:?}");
                        break;
                    }
                }
            }

            // Discovery events, in arrival order per identity.
            Some(event) = ctx.discovery_rx.recv() => {
                intake::handle_discovery_event(&ctx.state, event).await;
            }

            // Spooler notifications.
            Some(event) = ctx.spooler_event_rx.recv() => {
                notifications::handle_spooler_event(&ctx.state, event).await;
            }
        }
    }

    shutdown(ctx).await;
}

/// The orderly shutdown sequence: stop accepting events, retire or release
/// every entry, drain the reconciler, then stop all tasks.
async fn shutdown(mut ctx: ServerContext) {
    ctx.state.begin_shutdown();

    let keep_generated = ctx.state.config.lock().await.queues.keep_generated;
    let now = Instant::now();

    // Persist the option records of every master before queues go away.
    let masters: Vec<(String, std::collections::BTreeMap<String, String>)> = {
        let registry = ctx.state.registry.read().await;
        registry
            .iter()
            .filter(|e| e.is_master())
            .map(|e| (e.queue_name.clone(), e.options.clone()))
            .collect()
    };
    for (queue_name, mut options) in masters {
        options.remove(crate::core::spooler::CONTROLLED_MARKER_OPTION);
        options.remove(crate::core::spooler::DEST_OPTION);
        if let Err(e) = ctx.state.state_dir.write_options(&queue_name, &options).await {
            warn!("Persisting options of '{queue_name}' failed: {e}");
        }
    }

    {
        let mut registry = ctx.state.registry.write().await;
        for entry in registry.iter_mut() {
            if keep_generated {
                // Queues survive the daemon; entries wait out a confirm
                // window that never comes.
                entry.status = PrinterStatus::Unconfirmed;
                entry.clear_timeout();
            } else {
                entry.status = PrinterStatus::Disappeared;
                entry.schedule_now(now);
            }
        }
    }
    ctx.state.wake_reconciler();

    if !keep_generated {
        drain_registry(&ctx).await;
    }

    // Tell every task to stop, then give the set a bounded window to
    // drain; a wedged task must not keep the process alive.
    let _ = ctx.shutdown_tx.send(());

    let reap_all = async {
        while let Some(result) = ctx.background_tasks.join_next().await {
            if let Err(e) = result {
                warn!("A task ended badly during shutdown: {e:?}");
            }
        }
    };
    match tokio::time::timeout(TASK_STOP_TIMEOUT, reap_all).await {
        Ok(()) => info!("All tasks stopped; daemon exiting."),
        Err(_) => warn!(
            "Tasks still running after {TASK_STOP_TIMEOUT:?}; exiting anyway."
        ),
    }
}

/// Waits for the reconciler to retire every entry, bounded by
/// [`DRAIN_TIMEOUT`]. Entries stuck behind active jobs are left behind.
async fn drain_registry(ctx: &ServerContext) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    loop {
        let retiring = {
            let registry = ctx.state.registry.read().await;
            registry
                .iter()
                .filter(|e| e.status.is_terminal())
                .count()
        };
        if retiring == 0 {
            info!("All queues retired.");
            return;
        }
        if Instant::now() >= deadline {
            warn!("{retiring} entries could not be retired before shutdown.");
            return;
        }
        ctx.state.wake_reconciler();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
