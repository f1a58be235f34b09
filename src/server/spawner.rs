// src/server/spawner.rs

//! Spawns all of the daemon's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use crate::core::discovery::DiscoverySupervisor;
use crate::core::notifications::NotificationIntake;
use crate::core::reconciler::QueueReconciler;
use crate::core::tasks::auto_shutdown::AutoShutdownTask;
use anyhow::{Result, anyhow};
use tracing::info;

/// Spawns all critical background tasks into the provided JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;

    // --- Metrics Endpoint ---
    if state.config.lock().await.metrics.enabled {
        let metrics_state = state.clone();
        let metrics_shutdown = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, metrics_shutdown).await;
            Ok(())
        });
    }

    // --- Queue Reconciler ---
    let wake_rx = ctx
        .reconciler_wake_rx
        .take()
        .ok_or_else(|| anyhow!("reconciler wake channel already taken"))?;
    let reconciler = QueueReconciler::new(state.clone());
    let shutdown_rx_reconciler = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        reconciler.run(shutdown_rx_reconciler, wake_rx).await;
        Ok(())
    });

    // --- Discovery Sources ---
    let supervisor = DiscoverySupervisor::from_config(state.clone())
        .await
        .map_err(|e| anyhow!("discovery setup failed: {e}"))?;
    let shutdown_rx_discovery = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        supervisor.run(shutdown_rx_discovery).await;
        Ok(())
    });

    // --- Notification Intake ---
    let intake = NotificationIntake::new(state.clone());
    let shutdown_rx_intake = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        intake.run(shutdown_rx_intake).await;
        Ok(())
    });

    // --- Auto-Shutdown Policy ---
    // Spawned regardless of the configured default; USR2 can enable the
    // policy at runtime.
    let auto_shutdown = AutoShutdownTask::new(state.clone());
    let shutdown_rx_auto = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        auto_shutdown.run(shutdown_rx_auto).await;
        Ok(())
    });

    info!("All background tasks have been spawned.");
    Ok(())
}
