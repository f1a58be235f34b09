// src/core/reconciler/removal.rs

//! The removal path: slave promotion, queue retirement, and entry teardown.

use crate::core::metrics;
use crate::core::registry::{Identity, PrinterStatus, SlaveLink};
use crate::core::spooler::{CONTROLLED_MARKER_OPTION, DEST_OPTION, DISABLE_REASON};
use crate::core::state::BridgeState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// An unconfirmed entry whose confirm window ran out: retire it, honouring
/// the keep-generated-queues policy.
pub async fn retire_unconfirmed(state: &Arc<BridgeState>, identity: &Identity, now: Instant) {
    let keep_generated = state.config.lock().await.queues.keep_generated;
    {
        let mut registry = state.registry.write().await;
        let Some(entry) = registry.get_mut(identity) else {
            return;
        };
        entry.status = if keep_generated {
            PrinterStatus::ToBeReleased
        } else {
            PrinterStatus::Disappeared
        };
    }
    process_removal(state, identity, now).await;
}

/// Processes one entry in `Disappeared` or `ToBeReleased` state.
pub async fn process_removal(state: &Arc<BridgeState>, identity: &Identity, now: Instant) {
    let retry_delay = state.config.lock().await.spooler.retry_delay;

    // Phase one, under the registry lock: claim the entry and decide the
    // route. Promotion is pure record surgery and completes here.
    let route = {
        let mut registry = state.registry.write().await;
        let Some(entry) = registry.get_mut(identity) else {
            return;
        };
        if entry.called {
            return;
        }
        entry.called = true;
        let status = entry.status;
        let queue_name = entry.queue_name.clone();
        let is_slave = entry.is_slave();

        if !is_slave {
            let slaves = registry.live_slaves(identity);
            if let Some(heir) = slaves.first().cloned() {
                // Promote the earliest live slave; the local queue survives
                // untouched under the new master.
                let options = registry
                    .get(identity)
                    .map(|e| e.options.clone())
                    .unwrap_or_default();
                registry.detach_master(identity);

                if let Some(promoted) = registry.get_mut(&heir) {
                    promoted.slave_of = None;
                    promoted.options = options;
                    promoted.status = PrinterStatus::ToBeCreated;
                    promoted.schedule_now(now);
                }
                registry.adopt_orphans(&queue_name, &heir);

                let entry = registry.get_mut(identity).expect("claimed above");
                entry.slave_of = Some(SlaveLink::Master(heir.clone()));
                entry.called = false;
                // The record itself stays due, and is freed as a slave on
                // the next pass.
                entry.schedule_now(now);

                info!(
                    "Promoted '{heir}' to master of '{queue_name}'; '{identity}' demoted"
                );
                drop(registry);
                state.wake_reconciler();
                return;
            }
        }

        Route {
            status,
            queue_name,
            is_slave,
        }
    };

    // A slave's queue belongs to its master; the record is simply freed.
    if route.is_slave {
        free_entry(state, identity).await;
        return;
    }

    // Phase two, without the lock: persist the option record, then retire
    // the queue as the status dictates.
    persist_options(state, &route.queue_name).await;

    if route.status == PrinterStatus::ToBeReleased {
        // The user has taken the queue over; leave it in place.
        info!("Releasing queue '{}' to the user", route.queue_name);
        state.stats.forget_queue(&route.queue_name);
        free_entry(state, identity).await;
        return;
    }

    // Disappeared: the queue is deleted unless jobs or default-printer
    // safety forbid it right now.
    let active_jobs = match state.spooler.list_active_jobs(&route.queue_name).await {
        Ok(jobs) => jobs.len(),
        Err(e) => {
            debug!("Job check for '{}' failed: {e}", route.queue_name);
            0
        }
    };

    let is_default = state
        .defaults
        .lock()
        .await
        .current
        .as_deref()
        .is_some_and(|d| d.eq_ignore_ascii_case(&route.queue_name));
    let default_hazard = is_default && !state.has_notification_channel().await;

    if active_jobs > 0 || default_hazard {
        if let Err(e) = state
            .spooler
            .disable_queue(&route.queue_name, DISABLE_REASON)
            .await
        {
            warn!("Could not disable '{}': {e}", route.queue_name);
        }
        let mut registry = state.registry.write().await;
        if let Some(entry) = registry.get_mut(identity) {
            entry.schedule_at(now + retry_delay);
            entry.called = false;
        }
        debug!(
            "Deferring deletion of '{}' ({} active jobs, default hazard: {default_hazard})",
            route.queue_name, active_jobs
        );
        return;
    }

    if is_default {
        // Remember that one of ours was default, so a reappearance can
        // reclaim it.
        if let Err(e) = state.state_dir.write_remote_default(&route.queue_name).await {
            warn!("Could not record default '{}': {e}", route.queue_name);
        }
    }

    match state.spooler.delete_queue(&route.queue_name).await {
        Ok(()) => {
            info!("Deleted queue '{}'", route.queue_name);
            metrics::QUEUES_DELETED_TOTAL.inc();
            state
                .stats
                .queues_deleted
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            state.local_queues.write().await.remove(&route.queue_name);
            state.stats.forget_queue(&route.queue_name);
            free_entry(state, identity).await;
        }
        Err(e) => {
            warn!("Deleting queue '{}' failed: {e}", route.queue_name);
            let mut registry = state.registry.write().await;
            if let Some(entry) = registry.get_mut(identity) {
                entry.schedule_at(now + retry_delay);
                entry.called = false;
            }
        }
    }
}

struct Route {
    status: PrinterStatus,
    queue_name: String,
    is_slave: bool,
}

/// Records the queue's current option defaults before it goes away, so a
/// re-created queue can restore them.
async fn persist_options(state: &Arc<BridgeState>, queue_name: &str) {
    let mut options: BTreeMap<String, String> = match state
        .spooler
        .fetch_printer_attributes(queue_name)
        .await
    {
        Ok(attrs) => attrs.options,
        Err(e) => {
            debug!("Could not fetch options of '{queue_name}': {e}");
            // Fall back to the options recorded on the registry entry.
            let registry = state.registry.read().await;
            registry
                .iter()
                .find(|e| e.queue_name == queue_name && e.is_master())
                .map(|e| e.options.clone())
                .unwrap_or_default()
        }
    };

    // The daemon's own bookkeeping options do not survive re-creation.
    options.remove(CONTROLLED_MARKER_OPTION);
    options.remove(DEST_OPTION);

    if let Err(e) = state.state_dir.write_options(queue_name, &options).await {
        warn!("Could not persist options of '{queue_name}': {e}");
    }
}

/// Removes the record and re-points any sentinel bookkeeping.
async fn free_entry(state: &Arc<BridgeState>, identity: &Identity) {
    let mut registry = state.registry.write().await;
    registry.detach_master(identity);
    if registry.remove(identity).is_some() {
        debug!("Freed registry entry '{identity}'");
    }
    drop(registry);
    state.stats.touch();
    state.wake_reconciler();
}
