// src/core/reconciler/mod.rs

//! The queue reconciler: a timer-driven control loop that walks the registry
//! and converges the spooler's queue list onto the desired state, with
//! bounded work per tick.

pub mod creation;
pub mod removal;

use crate::core::metrics;
use crate::core::registry::{Identity, PrinterStatus};
use crate::core::state::BridgeState;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

pub struct QueueReconciler {
    state: Arc<BridgeState>,
}

impl QueueReconciler {
    pub fn new(state: Arc<BridgeState>) -> Self {
        Self { state }
    }

    /// The reconciler's main loop: sleep until the earliest pending entry
    /// deadline, tick, repeat. Registry changes nudge the wake channel so
    /// the timer is recomputed.
    pub async fn run(
        self,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut wake_rx: mpsc::Receiver<()>,
    ) {
        info!("Queue reconciler started.");
        loop {
            let next_deadline = self.state.registry.read().await.earliest_timeout();

            match next_deadline {
                Some(deadline) => {
                    let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => break,
                        _ = wake_rx.recv() => continue,
                        _ = sleep => {
                            self.tick().await;
                        }
                    }
                }
                None => {
                    // Nothing pending: the timer is stopped until a wake.
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => break,
                        _ = wake_rx.recv() => continue,
                    }
                }
            }
        }
        info!("Queue reconciler shutting down.");
    }

    /// One pass over the registry, in insertion order.
    async fn tick(&self) {
        let now = Instant::now();

        // Reset the shared per-tick HTTP-timeout flag.
        self.state.spooler.take_timeout_flag();

        let (max_per_tick, pause_between_ticks) = {
            let config = self.state.config.lock().await;
            (
                config.queues.max_per_tick,
                config.queues.pause_between_ticks,
            )
        };

        let due: Vec<Identity> = {
            let registry = self.state.registry.read().await;
            update_registry_gauges(&registry);
            registry.identities()
        };

        let mut handoffs = 0usize;
        let mut saturated = false;

        for identity in due {
            if self.state.is_shutting_down() {
                break;
            }

            let action = {
                let registry = self.state.registry.read().await;
                let Some(entry) = registry.get(&identity) else {
                    continue;
                };
                if !entry.is_due(now) || entry.called {
                    continue;
                }
                entry.status
            };

            match action {
                PrinterStatus::Unconfirmed => {
                    // The confirm window expired without a fresh appearance.
                    removal::retire_unconfirmed(&self.state, &identity, now).await;
                }
                PrinterStatus::Disappeared | PrinterStatus::ToBeReleased => {
                    removal::process_removal(&self.state, &identity, now).await;
                }
                PrinterStatus::ToBeCreated => {
                    if handoffs >= max_per_tick {
                        saturated = true;
                        break;
                    }
                    handoffs += 1;
                    {
                        let mut registry = self.state.registry.write().await;
                        if let Some(entry) = registry.get_mut(&identity) {
                            entry.called = true;
                        }
                    }
                    let state = self.state.clone();
                    let identity = identity.clone();
                    tokio::spawn(async move {
                        creation::create_or_update(state, identity).await;
                    });
                }
                PrinterStatus::Confirmed => {
                    let mut registry = self.state.registry.write().await;
                    if let Some(entry) = registry.get_mut(&identity) {
                        if entry.legacy {
                            // The poll window expired without a re-sighting.
                            debug!(
                                "Legacy entry '{identity}' expired; retiring queue '{}'",
                                entry.queue_name
                            );
                            entry.status = PrinterStatus::Disappeared;
                            entry.schedule_now(now);
                        } else {
                            entry.clear_timeout();
                        }
                    }
                }
            }
        }

        if saturated {
            // Push everything still pending past the pause so the next tick
            // does not spin on the same entries.
            let mut registry = self.state.registry.write().await;
            for entry in registry.iter_mut() {
                if !entry.called && entry.is_due(now) {
                    entry.push_back(now + pause_between_ticks);
                }
            }
            debug!("Tick saturated after {handoffs} handoffs; deferring the rest");
        }
    }
}

fn update_registry_gauges(registry: &crate::core::registry::Registry) {
    for (status, count) in registry.status_counts() {
        let label = status.to_string();
        metrics::REGISTRY_ENTRIES
            .with_label_values(&[label.as_str()])
            .set(count as f64);
    }
}
