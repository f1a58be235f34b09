// src/core/tasks/auto_shutdown.rs

//! The auto-shutdown policy: when enabled, the daemon exits after its
//! configured timeout of having nothing to do. Appearances and new jobs
//! disarm the timer; USR1/USR2 toggle the whole policy at runtime.

use crate::config::AutoShutdownOn;
use crate::core::state::{BridgeState, ShutdownReason};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub struct AutoShutdownTask {
    state: Arc<BridgeState>,
}

impl AutoShutdownTask {
    pub fn new(state: Arc<BridgeState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let (timeout, variant) = {
            let config = self.state.config.lock().await;
            (
                config.policy.auto_shutdown_timeout,
                config.policy.auto_shutdown_on,
            )
        };

        info!(
            "Auto-shutdown task started (timeout {:?}, on {:?}).",
            timeout, variant
        );
        let mut check_timer = tokio::time::interval(CHECK_INTERVAL);
        let mut armed_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = check_timer.tick() => {
                    if !self.state.auto_shutdown_enabled.load(Ordering::SeqCst) {
                        armed_since = None;
                        continue;
                    }

                    let idle = match variant {
                        AutoShutdownOn::NoQueues => {
                            self.state.registry.read().await.is_empty()
                        }
                        AutoShutdownOn::NoJobs => {
                            self.state.stats.active_job_count() == 0
                        }
                    };

                    if !idle {
                        if armed_since.take().is_some() {
                            debug!("Auto-shutdown timer disarmed");
                        }
                        continue;
                    }

                    let since = *armed_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= timeout {
                        info!("Idle for {:?}; requesting auto-shutdown", timeout);
                        self.state.request_shutdown(ShutdownReason::AutoShutdown).await;
                        return;
                    }
                }
                _ = shutdown_rx.recv() => {
                    return;
                }
            }
        }
    }
}
