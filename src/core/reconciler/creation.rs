// src/core/reconciler/creation.rs

//! The creation/update path: a worker that installs or refreshes the local
//! queue for one registry entry (the cluster master, for clustered queues).
//!
//! The worker holds the registry write lock only for record mutations; every
//! RPC happens with the lock released.

use crate::core::capabilities::{Capabilities, merge_capabilities};
use crate::core::metrics;
use crate::core::naming::is_remote_spooler_resource;
use crate::core::registry::{Identity, PrinterStatus, SlaveLink};
use crate::core::spooler::descriptor::{DescriptorEdits, edit_descriptor};
use crate::core::spooler::{
    BACKEND_ERROR_REASON, CONTROLLED_MARKER_OPTION, DISABLE_REASON, LocalQueueInfo, PrinterState,
    QueueInstall, sentinel_uri,
};
use crate::core::state::BridgeState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Entry point for the worker spawned by the reconciler. The `called` flag
/// is already set; it is always cleared on exit.
pub async fn create_or_update(state: Arc<BridgeState>, identity: Identity) {
    let outcome = run(&state, &identity).await;

    let mut registry = state.registry.write().await;
    if let Some(entry) = registry.get_mut(&identity) {
        entry.called = false;
        if let Err(e) = outcome {
            debug!("Creation worker for '{identity}' ended early: {e}");
        }
    }
    drop(registry);
    state.wake_reconciler();
}

#[derive(Debug, thiserror::Error)]
enum WorkerEnd {
    #[error("entry vanished")]
    EntryGone,
    #[error("redirected to master")]
    Redirected,
    #[error("rescheduled: {0}")]
    Rescheduled(String),
    #[error("abandoned: {0}")]
    Abandoned(String),
    #[error("shutdown")]
    Shutdown,
}

async fn run(state: &Arc<BridgeState>, identity: &Identity) -> Result<(), WorkerEnd> {
    if state.is_shutting_down() {
        return Err(WorkerEnd::Shutdown);
    }

    let config = state.config.lock().await.clone();
    let now = Instant::now();

    // Snapshot the record; slaves redirect to their master, which is the
    // single object representing the cluster to the spooler.
    let (queue_name, uri, legacy, info_text, location, entry_options, resource) = {
        let mut registry = state.registry.write().await;
        let Some(entry) = registry.get(identity) else {
            return Err(WorkerEnd::EntryGone);
        };
        let slave_link = entry.slave_of.clone();
        let snapshot = (
            entry.queue_name.clone(),
            entry.uri.clone(),
            entry.legacy,
            entry.info.clone(),
            entry.location.clone(),
            entry.options.clone(),
            entry.resource.clone(),
        );

        match slave_link {
            Some(SlaveLink::Master(master_id)) => {
                // A single master object represents the cluster to the
                // spooler; the slave itself is done once the master is
                // queued for (re-)creation.
                if let Some(master) = registry.get_mut(&master_id) {
                    master.status = PrinterStatus::ToBeCreated;
                    master.schedule_now(now);
                }
                let entry = registry.get_mut(identity).expect("present above");
                entry.status = PrinterStatus::Confirmed;
                entry.clear_timeout();
                drop(registry);
                state.wake_reconciler();
                return Err(WorkerEnd::Redirected);
            }
            Some(SlaveLink::DeletedMaster) => {
                // Teardown is still in flight; try again shortly.
                let entry = registry.get_mut(identity).expect("present above");
                entry.schedule_at(now + config.spooler.retry_delay);
                return Err(WorkerEnd::Rescheduled("master teardown in flight".into()));
            }
            None => {}
        }

        snapshot
    };

    // Bounded-timeout connection check; consecutive timeouts are counted
    // against the configured ceiling.
    if let Err(e) = state.spooler.connect().await {
        return reschedule_after_rpc_failure(state, identity, &config, &e.to_string()).await;
    }

    // Refresh the local-queue mirror and inspect an existing queue with our
    // name.
    match state.spooler.list_local_printers().await {
        Ok(queues) => {
            let mut cache = state.local_queues.write().await;
            cache.replace_all(queues);
        }
        Err(e) => {
            return reschedule_after_rpc_failure(state, identity, &config, &e.to_string()).await;
        }
    }

    let existing = state.local_queues.read().await.get(&queue_name).cloned();
    if let Some(existing) = existing {
        if existing.temporary && !existing.daemon_controlled {
            take_over_temporary_queue(state, &queue_name, &config).await?;

            match state.spooler.list_active_jobs(&queue_name).await {
                Ok(jobs) if !jobs.is_empty() => {
                    let mut registry = state.registry.write().await;
                    if let Some(entry) = registry.get_mut(identity) {
                        entry.schedule_at(now + config.spooler.retry_delay);
                    }
                    return Err(WorkerEnd::Rescheduled(format!(
                        "{} jobs still on the temporary queue",
                        jobs.len()
                    )));
                }
                Ok(_) => {}
                Err(e) => {
                    return reschedule_after_rpc_failure(state, identity, &config, &e.to_string())
                        .await;
                }
            }
        }
    }

    // Capability fetches for every active cluster member (including this
    // entry), cached on the records.
    let members = collect_member_capabilities(state, identity, &queue_name, now).await?;

    let merged = merge_capabilities(&members.iter().collect::<Vec<_>>());

    // The external generator turns the merged document into a descriptor.
    let descriptor = match state
        .generator
        .generate(&queue_name, &merged.caps, &merged.constraints)
    {
        Ok(d) => d,
        Err(e) => {
            warn!("Descriptor generation for '{queue_name}' failed: {e}");
            mark_disappeared(state, identity, now).await;
            return Err(WorkerEnd::Abandoned("descriptor generation failed".into()));
        }
    };

    // Restore previously saved option defaults on top of what the record
    // carries.
    let mut saved_options = state.state_dir.read_options(&queue_name).await;
    for (key, value) in &entry_options {
        saved_options.insert(key.clone(), value.clone());
    }

    let remote_spooler = legacy || is_remote_spooler_resource(&resource);
    let (edited_descriptor, nickname) = edit_descriptor(
        &descriptor,
        &DescriptorEdits {
            remote_queue: remote_spooler,
            option_defaults: saved_options.clone(),
        },
    );

    // Sentinel routing needs the notification channel; without it the
    // cooperating backend would never learn a destination.
    let notifications = state.has_notification_channel().await;
    let clustered = members.len() > 1;
    let device_uri: Url = if notifications && (remote_spooler || clustered) {
        sentinel_uri(&queue_name)
    } else {
        uri.clone()
    };

    let mut install_options: BTreeMap<String, String> = saved_options.clone();
    install_options.insert(CONTROLLED_MARKER_OPTION.to_string(), "true".to_string());

    let install = QueueInstall {
        name: queue_name.clone(),
        device_uri: device_uri.clone(),
        descriptor: Some(edited_descriptor),
        info: info_text.or_else(|| {
            (!merged.caps.make_model.is_empty()).then(|| merged.caps.make_model.clone())
        }),
        location,
        options: install_options.clone(),
    };

    if let Err(e) = state.spooler.create_or_modify_queue(&install).await {
        return reschedule_after_rpc_failure(state, identity, &config, &e.to_string()).await;
    }

    // The shared flag is set in a second RPC whose errors are absorbed: a
    // remote-pointed queue may legitimately refuse it.
    if let Err(e) = state
        .spooler
        .set_shared(&queue_name, config.queues.shared)
        .await
    {
        debug!("Setting shared flag on '{queue_name}' failed: {e}");
    }

    // Re-establish the queue as default if it was default when it went away.
    if state.state_dir.read_remote_default().await.as_deref() == Some(queue_name.as_str()) {
        match state.spooler.set_default(&queue_name).await {
            Ok(()) => {
                info!("Restored '{queue_name}' as the default queue");
                state.state_dir.clear_remote_default().await;
                state.defaults.lock().await.current = Some(queue_name.clone());
            }
            Err(e) => warn!("Could not restore '{queue_name}' as default: {e}"),
        }
    }

    // Re-enable the queue if it was stopped for one of the reasons this
    // daemon knows to be transient.
    if let Ok(attrs) = state.spooler.fetch_printer_attributes(&queue_name).await {
        let ours = attrs
            .state_message
            .as_deref()
            .is_some_and(|m| m.contains(DISABLE_REASON) || m.contains(BACKEND_ERROR_REASON));
        if attrs.state == PrinterState::Stopped && ours {
            if let Err(e) = state.spooler.enable_queue(&queue_name).await {
                warn!("Could not re-enable '{queue_name}': {e}");
            }
        }
    }

    // A deadline missed during any step above makes this a partial success:
    // the queue may be half-updated, so the entry is retried.
    if state.spooler.take_timeout_flag() {
        metrics::SPOOLER_TIMEOUTS_TOTAL.inc();
        return reschedule_after_rpc_failure(state, identity, &config, "deadline missed mid-update")
            .await;
    }

    // Success: confirm the record and mirror the installed queue.
    {
        let mut registry = state.registry.write().await;
        let Some(entry) = registry.get_mut(identity) else {
            return Err(WorkerEnd::EntryGone);
        };
        // The endpoint may have disappeared while the install was in
        // flight; the removal path owns it now.
        if entry.status.is_terminal() {
            return Err(WorkerEnd::Abandoned("entry retired mid-install".into()));
        }
        entry.status = PrinterStatus::Confirmed;
        entry.retry_count = 0;
        entry.nickname = nickname;
        entry.options = install_options;
        entry.overwritten = false;
        if entry.legacy {
            entry.timeout_at = Some(now + config.discovery.browse_timeout);
        } else {
            entry.clear_timeout();
        }

        // The installed queue covers every pending slave of this cluster.
        for slave in registry.iter_mut() {
            if slave.queue_name == queue_name
                && slave.is_slave()
                && slave.status == PrinterStatus::ToBeCreated
                && !slave.called
            {
                slave.status = PrinterStatus::Confirmed;
                slave.clear_timeout();
            }
        }
    }

    state.local_queues.write().await.upsert(LocalQueueInfo {
        name: queue_name.clone(),
        device_uri: Some(device_uri),
        uuid: None,
        daemon_controlled: true,
        shared: config.queues.shared,
        temporary: false,
        is_default: false,
    });

    metrics::QUEUES_CREATED_TOTAL.inc();
    state
        .stats
        .queues_created
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    info!("Queue '{queue_name}' is confirmed");
    Ok(())
}

/// Takes ownership of a spooler-managed temporary queue by flipping its
/// shared flag; a queue pointing at a remote spooler refuses that and is
/// deleted instead.
async fn take_over_temporary_queue(
    state: &Arc<BridgeState>,
    queue_name: &str,
    config: &crate::config::Config,
) -> Result<(), WorkerEnd> {
    match state.spooler.set_shared(queue_name, true).await {
        Ok(()) => {
            if !config.queues.shared {
                if let Err(e) = state.spooler.set_shared(queue_name, false).await {
                    debug!("Clearing shared flag on '{queue_name}' failed: {e}");
                }
            }
            Ok(())
        }
        Err(e) => {
            debug!("Temporary queue '{queue_name}' refused the shared flag: {e}");
            match state.spooler.delete_queue(queue_name).await {
                Ok(()) => Ok(()),
                Err(e) => Err(WorkerEnd::Rescheduled(format!(
                    "cannot displace temporary queue: {e}"
                ))),
            }
        }
    }
}

/// Ensures every active member of the cluster has a capability document,
/// fetching missing ones from the endpoints. Members whose fetch fails are
/// marked disappeared and excluded. Returns the documents in registry
/// insertion order.
async fn collect_member_capabilities(
    state: &Arc<BridgeState>,
    identity: &Identity,
    queue_name: &str,
    now: Instant,
) -> Result<Vec<Capabilities>, WorkerEnd> {
    let member_ids: Vec<(Identity, Option<Capabilities>, Url)> = {
        let registry = state.registry.read().await;
        registry
            .active_members(queue_name)
            .into_iter()
            .map(|m| (m.identity.clone(), m.capabilities.clone(), m.uri.clone()))
            .collect()
    };

    let mut documents = Vec::new();
    for (member_id, cached, member_uri) in member_ids {
        let caps = match cached {
            Some(caps) => caps,
            None => match state.endpoints.fetch_capabilities(&member_uri).await {
                Ok(caps) => {
                    let mut registry = state.registry.write().await;
                    if let Some(member) = registry.get_mut(&member_id) {
                        member.capabilities = Some(caps.clone());
                        if member.make_model.is_empty() {
                            member.make_model = caps.make_model.clone();
                        }
                    }
                    caps
                }
                Err(e) => {
                    warn!("Capability fetch for '{member_id}' failed: {e}");
                    if member_id == *identity {
                        mark_disappeared(state, identity, now).await;
                        return Err(WorkerEnd::Abandoned("capability fetch failed".into()));
                    }
                    mark_disappeared(state, &member_id, now).await;
                    continue;
                }
            },
        };
        documents.push(caps);
    }

    if documents.is_empty() {
        mark_disappeared(state, identity, now).await;
        return Err(WorkerEnd::Abandoned("no member capabilities".into()));
    }
    Ok(documents)
}

async fn mark_disappeared(state: &Arc<BridgeState>, identity: &Identity, now: Instant) {
    let mut registry = state.registry.write().await;
    if let Some(entry) = registry.get_mut(identity) {
        entry.status = PrinterStatus::Disappeared;
        entry.schedule_now(now);
    }
    drop(registry);
    state.wake_reconciler();
}

/// Books an RPC failure against the retry ceiling: under it, the entry is
/// retried after the configured delay; past it, it is abandoned.
async fn reschedule_after_rpc_failure(
    state: &Arc<BridgeState>,
    identity: &Identity,
    config: &crate::config::Config,
    reason: &str,
) -> Result<(), WorkerEnd> {
    let now = Instant::now();
    let mut registry = state.registry.write().await;
    let Some(entry) = registry.get_mut(identity) else {
        return Err(WorkerEnd::EntryGone);
    };

    entry.retry_count += 1;
    if entry.retry_count > config.spooler.retry_max {
        warn!(
            "Abandoning '{}' after {} failed attempts ({reason})",
            identity, entry.retry_count
        );
        entry.status = PrinterStatus::Disappeared;
        entry.schedule_now(now);
        drop(registry);
        state.wake_reconciler();
        return Err(WorkerEnd::Abandoned(reason.to_string()));
    }

    if !entry.status.is_terminal() {
        entry.status = PrinterStatus::ToBeCreated;
    }
    entry.schedule_at(now + config.spooler.retry_delay);
    debug!(
        "Attempt {}/{} for '{identity}' failed ({reason}); retrying",
        entry.retry_count, config.spooler.retry_max
    );
    drop(registry);
    state.wake_reconciler();
    Err(WorkerEnd::Rescheduled(reason.to_string()))
}
