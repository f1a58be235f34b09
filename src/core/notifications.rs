// src/core/notifications.rs

//! Consumes spooler notifications: default-printer tracking, reaction to
//! external deletion and modification of daemon queues, and job dispatch
//! triggering.

use crate::core::dispatch;
use crate::core::events::{JobState, SpoolerEvent};
use crate::core::metrics;
use crate::core::naming::host_qualified;
use crate::core::registry::PrinterStatus;
use crate::core::spooler::{CONTROLLED_MARKER_OPTION, DEST_OPTION, is_sentinel_uri};
use crate::core::state::BridgeState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// How often queued notifications are pulled from the spooler.
const PULL_INTERVAL: Duration = Duration::from_secs(2);

/// Backoff ceiling for re-establishing a lost subscription.
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(60);

/// Events the daemon subscribes to.
const SUBSCRIBED_EVENTS: &[&str] = &[
    "printer-state-changed",
    "printer-modified",
    "printer-config-changed",
    "printer-deleted",
    "job-created",
    "job-state-changed",
    "job-completed",
];

/// What the overwrite probe found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteProbe {
    Ok,
    UriOverwritten,
    DescriptorOverwritten,
}

/// The intake task: keeps the subscription alive and pumps notifications
/// into the controller's channel.
pub struct NotificationIntake {
    state: Arc<BridgeState>,
}

impl NotificationIntake {
    pub fn new(state: Arc<BridgeState>) -> Self {
        Self { state }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let lease = self.state.config.lock().await.queues.notify_lease;
        let mut resubscribe_delay = Duration::from_secs(1);
        let mut pull_timer = tokio::time::interval(PULL_INTERVAL);
        let mut renew_deadline = Instant::now() + lease / 2;

        loop {
            let subscribed = self.state.subscription.lock().await.is_some();
            if !subscribed {
                match self.state.spooler.subscribe(SUBSCRIBED_EVENTS, lease).await {
                    Ok(subscription) => {
                        info!(
                            "Notification subscription {} established (lease {:?})",
                            subscription.id, subscription.lease
                        );
                        renew_deadline = Instant::now() + subscription.lease / 2;
                        *self.state.subscription.lock().await = Some(subscription);
                        resubscribe_delay = Duration::from_secs(1);
                    }
                    Err(e) => {
                        warn!(
                            "Cannot subscribe for notifications: {e}. Retrying in {:?}",
                            resubscribe_delay
                        );
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = tokio::time::sleep(resubscribe_delay) => {}
                        }
                        resubscribe_delay = (resubscribe_delay * 2).min(MAX_RESUBSCRIBE_DELAY);
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = pull_timer.tick() => {
                    self.pull_notifications().await;
                    if Instant::now() >= renew_deadline {
                        renew_deadline = Instant::now() + self.renew(lease).await / 2;
                    }
                }
            }
        }

        // Leave no dangling subscription behind.
        let id = self.state.subscription.lock().await.as_ref().map(|s| s.id);
        if let Some(id) = id {
            if let Err(e) = self.state.spooler.cancel_subscription(id).await {
                debug!("Cancelling subscription {id} failed: {e}");
            }
        }
        info!("Notification intake shutting down.");
    }

    async fn pull_notifications(&self) {
        let Some((id, sequence)) = self
            .state
            .subscription
            .lock()
            .await
            .as_ref()
            .map(|s| (s.id, s.next_sequence))
        else {
            return;
        };

        match self.state.spooler.fetch_notifications(id, sequence).await {
            Ok((events, next_sequence)) => {
                if let Some(subscription) = self.state.subscription.lock().await.as_mut() {
                    subscription.next_sequence = next_sequence;
                }
                for event in events {
                    if self.state.spooler_event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                // The spooler dropped the subscription; re-establish it.
                warn!("Subscription {id} vanished; resubscribing");
                *self.state.subscription.lock().await = None;
            }
            Err(e) => {
                debug!("Notification pull failed: {e}");
            }
        }
    }

    /// Renews the lease, returning the granted lease for deadline
    /// computation. A failed renewal drops the subscription so the outer
    /// loop re-establishes it.
    async fn renew(&self, lease: Duration) -> Duration {
        let Some(id) = self.state.subscription.lock().await.as_ref().map(|s| s.id) else {
            return lease;
        };
        match self.state.spooler.renew_subscription(id, lease).await {
            Ok(granted) => {
                debug!("Renewed subscription {id} for {granted:?}");
                granted
            }
            Err(e) => {
                warn!("Renewing subscription {id} failed: {e}");
                *self.state.subscription.lock().await = None;
                lease
            }
        }
    }
}

/// Whether a queue name belongs to this daemon.
async fn is_our_queue(state: &Arc<BridgeState>, queue: &str) -> bool {
    if state
        .local_queues
        .read()
        .await
        .get(queue)
        .is_some_and(|q| q.daemon_controlled)
    {
        return true;
    }
    state.registry.read().await.master_of(queue).is_some()
}

/// Consumes one spooler event. Runs on the controller loop; anything doing
/// RPC work is spawned.
pub async fn handle_spooler_event(state: &Arc<BridgeState>, event: SpoolerEvent) {
    match event {
        SpoolerEvent::PrinterStateChanged {
            queue,
            is_now_default,
            ..
        } => {
            if is_now_default {
                track_default_change(state, &queue).await;
            }
        }
        SpoolerEvent::PrinterDeleted { queue } => {
            handle_printer_deleted(state, &queue).await;
        }
        SpoolerEvent::PrinterModified { queue } => {
            let state = state.clone();
            tokio::spawn(async move {
                handle_printer_modified(&state, &queue).await;
            });
        }
        SpoolerEvent::JobState {
            queue,
            job_id,
            state: job_state,
        } => {
            handle_job_state(state, &queue, job_id, job_state).await;
        }
    }
}

/// Tracks the system default. Losing the default from one of our queues to a
/// foreign one is remembered so a reappearance can reclaim it; gaining it
/// records the displaced local default.
async fn track_default_change(state: &Arc<BridgeState>, queue: &str) {
    let new_is_ours = is_our_queue(state, queue).await;
    let previous = {
        let mut defaults = state.defaults.lock().await;
        let previous = defaults.current.clone();
        defaults.current = Some(queue.to_string());
        previous
    };

    let Some(previous) = previous else {
        return;
    };
    if previous.eq_ignore_ascii_case(queue) {
        return;
    }
    let previous_is_ours = is_our_queue(state, &previous).await;

    if new_is_ours && !previous_is_ours {
        // Remember the local queue we displaced.
        if let Err(e) = state.state_dir.write_local_default(&previous).await {
            warn!("Recording displaced default '{previous}' failed: {e}");
        }
    } else if previous_is_ours && !new_is_ours {
        // One of ours lost the default; restore it if it reappears.
        if let Err(e) = state.state_dir.write_remote_default(&previous).await {
            warn!("Recording lost default '{previous}' failed: {e}");
        }
    }
    debug!("Default queue is now '{queue}'");
}

/// The spooler deleted one of our queues: re-create it, unless something
/// else already claimed the name.
async fn handle_printer_deleted(state: &Arc<BridgeState>, queue: &str) {
    let master_id = {
        let registry = state.registry.read().await;
        registry.master_identity(queue)
    };
    let Some(master_id) = master_id else {
        return;
    };

    state.local_queues.write().await.remove(queue);
    state.stats.forget_queue(queue);

    // Check whether the queue has already reappeared under someone else's
    // control before recreating.
    let reappeared = match state.spooler.list_local_printers().await {
        Ok(queues) => {
            let reappeared = queues
                .iter()
                .any(|q| q.name.eq_ignore_ascii_case(queue) && !q.daemon_controlled);
            state.local_queues.write().await.replace_all(queues);
            reappeared
        }
        Err(e) => {
            debug!("Queue listing after deletion of '{queue}' failed: {e}");
            false
        }
    };
    if reappeared {
        info!("Queue '{queue}' was deleted but re-created externally; leaving it");
        return;
    }

    // Preserve default bookkeeping across the delete/recreate cycle.
    let was_default = state
        .defaults
        .lock()
        .await
        .current
        .as_deref()
        .is_some_and(|d| d.eq_ignore_ascii_case(queue));
    if was_default {
        if let Err(e) = state.state_dir.write_remote_default(queue).await {
            warn!("Recording default '{queue}' failed: {e}");
        }
    }

    info!("Queue '{queue}' was deleted externally; scheduling re-creation");
    let now = Instant::now();
    let mut registry = state.registry.write().await;
    if let Some(entry) = registry.get_mut(&master_id) {
        entry.status = PrinterStatus::ToBeCreated;
        entry.schedule_now(now);
    }
    drop(registry);
    state.wake_reconciler();
}

/// The spooler reported one of our queues as modified: probe for an
/// external overwrite and react.
async fn handle_printer_modified(state: &Arc<BridgeState>, queue: &str) {
    let master_id = {
        let registry = state.registry.read().await;
        let Some(master) = registry.master_of(queue) else {
            return;
        };
        // Our own installs fire modify notifications too; a record that is
        // mid-creation or already queued for re-creation is not probed.
        if master.called || master.status != PrinterStatus::Confirmed {
            return;
        }
        master.identity.clone()
    };

    match probe_overwrite(state, queue).await {
        OverwriteProbe::Ok => {}
        OverwriteProbe::DescriptorOverwritten => {
            info!("Descriptor of '{queue}' was replaced; re-creating");
            let now = Instant::now();
            let mut registry = state.registry.write().await;
            if let Some(entry) = registry.get_mut(&master_id) {
                entry.status = PrinterStatus::ToBeCreated;
                entry.schedule_now(now);
            }
            drop(registry);
            state.wake_reconciler();
        }
        OverwriteProbe::UriOverwritten => {
            release_overwritten_queue(state, queue).await;
        }
    }
}

/// Fetches the queue's live attributes and compares the device URI and the
/// descriptor nickname against what the daemon installed.
pub async fn probe_overwrite(state: &Arc<BridgeState>, queue: &str) -> OverwriteProbe {
    let attrs = match state.spooler.fetch_printer_attributes(queue).await {
        Ok(attrs) => attrs,
        Err(e) => {
            debug!("Overwrite probe of '{queue}' failed: {e}");
            return OverwriteProbe::Ok;
        }
    };

    let (expected_uri, expected_nickname) = {
        let registry = state.registry.read().await;
        let Some(master) = registry.master_of(queue) else {
            return OverwriteProbe::Ok;
        };
        (master.uri.clone(), master.nickname.clone())
    };

    match &attrs.device_uri {
        Some(uri) if is_sentinel_uri(uri, queue) || *uri == expected_uri => {}
        Some(_) | None => return OverwriteProbe::UriOverwritten,
    }

    if let (Some(current), Some(expected)) = (&attrs.nickname, &expected_nickname) {
        if current != expected {
            return OverwriteProbe::DescriptorOverwritten;
        }
    }

    OverwriteProbe::Ok
}

/// The user pointed our queue somewhere else: every registry entry sharing
/// the name moves to a host-qualified name and is re-created there, while
/// the user keeps the original queue untouched.
async fn release_overwritten_queue(state: &Arc<BridgeState>, queue: &str) {
    info!("Queue '{queue}' was taken over by the user; renaming our entries");

    // Record what we wrote to the old queue before walking away from it.
    let options: BTreeMap<String, String> = {
        let registry = state.registry.read().await;
        registry
            .iter()
            .find(|e| e.queue_name == queue && e.is_master())
            .map(|e| {
                let mut options = e.options.clone();
                options.remove(CONTROLLED_MARKER_OPTION);
                options.remove(DEST_OPTION);
                options
            })
            .unwrap_or_default()
    };
    if let Err(e) = state.state_dir.write_options(queue, &options).await {
        warn!("Persisting options of released queue '{queue}' failed: {e}");
    }

    let now = Instant::now();
    let mut registry = state.registry.write().await;
    let mut renamed = 0usize;
    for entry in registry.iter_mut() {
        if entry.queue_name != queue {
            continue;
        }
        let new_name = {
            let qualified = host_qualified(queue, &entry.host);
            if qualified.is_empty() {
                entry.queue_name.clone()
            } else {
                qualified
            }
        };
        if new_name == entry.queue_name {
            // No usable host to qualify with; release the record instead.
            entry.status = PrinterStatus::ToBeReleased;
            entry.schedule_now(now);
            continue;
        }
        entry.queue_name = new_name;
        entry.overwritten = true;
        entry.nickname = None;
        entry.status = PrinterStatus::ToBeCreated;
        entry.schedule_now(now);
        renamed += 1;
    }
    drop(registry);

    // The old queue is the user's now.
    {
        let mut cache = state.local_queues.write().await;
        if let Some(mut info) = cache.remove(queue) {
            info.daemon_controlled = false;
            cache.upsert(info);
        }
    }
    state.stats.forget_queue(queue);

    info!("Renamed {renamed} entries away from '{queue}'");
    state.wake_reconciler();
}

/// Job-state accounting plus the dispatch trigger for sentinel queues.
async fn handle_job_state(
    state: &Arc<BridgeState>,
    queue: &str,
    job_id: i32,
    job_state: JobState,
) {
    if is_our_queue(state, queue).await {
        state
            .stats
            .record_job(job_id, queue, job_state.is_active());
        metrics::ACTIVE_JOBS.set(state.stats.active_job_count() as f64);
    }

    if job_state != JobState::Processing {
        return;
    }

    let sentinel_routed = state
        .local_queues
        .read()
        .await
        .get(queue)
        .and_then(|q| q.device_uri.as_ref().map(|u| is_sentinel_uri(u, queue)))
        .unwrap_or(false);
    if !sentinel_routed {
        return;
    }

    let state = state.clone();
    let queue = queue.to_string();
    tokio::spawn(async move {
        dispatch::dispatch_job(&state, &queue, job_id).await;
    });
}
