// src/core/registry/intake.rs

//! Applies discovery events to the registry: creation of new records, the
//! upgrade/downgrade rule for repeated sightings, instance removal, and
//! cluster joining.

use super::entry::{DiscoveredInstance, Identity, PrinterStatus, RemotePrinter, SlaveLink};
use crate::core::events::{DiscoveryEvent, ServiceMeta};
use crate::core::metrics;
use crate::core::naming::{self, host_qualified};
use crate::core::state::BridgeState;
use crate::core::spooler::LocalQueueInfo;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// How a fresh sighting relates to what the registry already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    Upgrade,
    Downgrade,
    Equal,
}

/// Consumes one discovery event. This is the single-writer path for a given
/// identity: the controller loop calls it sequentially in arrival order.
pub async fn handle_discovery_event(state: &Arc<BridgeState>, event: DiscoveryEvent) {
    if state.is_shutting_down() {
        return;
    }

    match event {
        DiscoveryEvent::Appeared { identity, .. } => {
            // Unresolved sightings carry no metadata to act on; the resolve
            // follows from the same source.
            debug!("'{identity}' appeared, awaiting resolution");
        }
        DiscoveryEvent::Resolved {
            identity,
            instance,
            meta,
            source_addr,
        } => {
            handle_resolved(state, identity, instance, *meta, source_addr).await;
        }
        DiscoveryEvent::Removed { identity, instance } => {
            handle_removed(state, identity, instance).await;
        }
    }
}

async fn handle_resolved(
    state: &Arc<BridgeState>,
    identity: Identity,
    instance: DiscoveredInstance,
    meta: ServiceMeta,
    source_addr: Option<std::net::IpAddr>,
) {
    // Policy gates: a rejected event is dropped silently.
    if let Some(addr) = source_addr {
        if !state.access_policy.permits(addr) {
            metrics::DISCOVERY_EVENTS_TOTAL
                .with_label_values(&["denied"])
                .inc();
            debug!("Dropping '{identity}': source {addr} denied by access rules");
            return;
        }
    }
    if !state.browse_filters.admits(&meta) {
        metrics::DISCOVERY_EVENTS_TOTAL
            .with_label_values(&["filtered"])
            .inc();
        return;
    }
    metrics::DISCOVERY_EVENTS_TOTAL
        .with_label_values(&["accepted"])
        .inc();

    let now = Instant::now();
    let (naming_config, browse_timeout) = {
        let config = state.config.lock().await;
        (config.naming.clone(), config.discovery.browse_timeout)
    };
    let mut registry = state.registry.write().await;

    if registry.contains(&identity) {
        let entry = registry.get_mut(&identity).expect("checked above");
        match classify(entry, &instance, &meta) {
            Observation::Upgrade => {
                debug!("Upgrading '{identity}' from new sighting on {}", instance.interface);
                apply_metadata(entry, &meta, &instance);
                entry.capabilities = None;
                entry.status = PrinterStatus::ToBeCreated;
                entry.schedule_now(now);
            }
            Observation::Downgrade => {
                debug!("Keeping '{identity}'; recording downgraded sighting");
            }
            Observation::Equal => {
                // Poll refreshes keep legacy entries confirmed for another
                // browse-timeout window.
                if entry.legacy && entry.status == PrinterStatus::Confirmed {
                    entry.schedule_at(now + browse_timeout);
                }
            }
        }
        entry.discoveries.insert(instance);
        drop(registry);
        state.stats.touch();
        state.wake_reconciler();
        return;
    }

    // New endpoint: resolve its local queue name and join or found a cluster.
    let local_queues = state.local_queues.read().await;
    let resolution = match naming::resolve_queue_name(&meta, &naming_config, &local_queues) {
        Ok(r) => r,
        Err(e) => {
            warn!("Refusing '{identity}': {e}");
            metrics::DISCOVERY_EVENTS_TOTAL
                .with_label_values(&["refused"])
                .inc();
            return;
        }
    };
    drop(local_queues);

    let mut queue_name = resolution.queue_name;
    let mut slave_of = None;

    if let Some(master_id) = registry.master_identity(&queue_name) {
        let may_cluster = naming_config.auto_clustering || resolution.manual_cluster;
        if may_cluster {
            // Join the cluster: the new entry becomes a slave, the master is
            // re-created so the merged capability set includes the newcomer.
            slave_of = Some(SlaveLink::Master(master_id.clone()));
            if let Some(master) = registry.get_mut(&master_id) {
                master.status = PrinterStatus::ToBeCreated;
                master.schedule_now(now);
            }
            info!("'{identity}' joins cluster '{queue_name}'");
        } else {
            // Clustering is off: give the newcomer a host-qualified name of
            // its own instead.
            let qualified = host_qualified(&queue_name, &meta.host);
            if qualified.is_empty() || registry.master_of(&qualified).is_some() {
                warn!(
                    "Refusing '{identity}': '{queue_name}' is taken and clustering is disabled"
                );
                return;
            }
            queue_name = qualified;
        }
    }

    let uri_string = meta.endpoint_uri(instance.kind.is_secure());
    let uri = match Url::parse(&uri_string) {
        Ok(u) => u,
        Err(e) => {
            warn!("Refusing '{identity}': bad endpoint URI '{uri_string}': {e}");
            return;
        }
    };

    let mut entry = RemotePrinter::new(identity.clone(), queue_name.clone(), uri);
    apply_metadata(&mut entry, &meta, &instance);
    entry.discoveries.insert(instance);
    entry.slave_of = slave_of;
    entry.manual_cluster = resolution.manual_cluster;
    entry.status = PrinterStatus::ToBeCreated;
    entry.schedule_now(now);

    info!(
        "Discovered '{}' -> local queue '{}'{}",
        identity,
        queue_name,
        if entry.is_slave() { " (cluster member)" } else { "" }
    );
    registry.insert(entry);
    drop(registry);

    state.stats.touch();
    state.wake_reconciler();
}

async fn handle_removed(
    state: &Arc<BridgeState>,
    identity: Identity,
    instance: DiscoveredInstance,
) {
    let (keep_generated, confirm_window) = {
        let config = state.config.lock().await;
        (
            config.queues.keep_generated,
            config.discovery.confirm_window,
        )
    };
    let now = Instant::now();

    let mut registry = state.registry.write().await;
    let Some(entry) = registry.get_mut(&identity) else {
        return;
    };

    entry.discoveries.remove(&instance);
    if !entry.discoveries.is_empty() {
        debug!(
            "'{identity}' lost one sighting, {} remain",
            entry.discoveries.len()
        );
        return;
    }

    if keep_generated {
        // Stale queues are kept until shutdown; the entry waits out another
        // confirm window instead of retiring the queue.
        entry.status = PrinterStatus::Unconfirmed;
        entry.timeout_at = Some(now + confirm_window);
        info!("'{identity}' disappeared; keeping queue '{}'", entry.queue_name);
    } else {
        entry.status = PrinterStatus::Disappeared;
        entry.schedule_now(now);
        info!("'{identity}' disappeared; queue '{}' scheduled for retirement", entry.queue_name);
    }
    drop(registry);

    state.stats.touch();
    state.wake_reconciler();
}

/// Copies resolved metadata into a record, replacing its addressing.
fn apply_metadata(entry: &mut RemotePrinter, meta: &ServiceMeta, instance: &DiscoveredInstance) {
    if !meta.service_name.is_empty() {
        entry.service_name = meta.service_name.clone();
    }
    if !meta.service_type.is_empty() {
        entry.service_type = meta.service_type.clone();
    }
    if !meta.domain.is_empty() {
        entry.domain = meta.domain.clone();
    }
    entry.host = meta.host.clone();
    entry.ip = meta.ip;
    entry.port = meta.port;
    entry.resource = meta.resource.clone();
    if let Ok(uri) = Url::parse(&meta.endpoint_uri(instance.kind.is_secure())) {
        entry.uri = uri;
    }
    if let Some(mm) = &meta.make_model {
        entry.make_model = mm.clone();
    }
    if !meta.pdl.is_empty() {
        entry.pdl_list = meta.pdl.clone();
    }
    if let Some(color) = meta.color {
        entry.color = color;
    }
    if let Some(duplex) = meta.duplex {
        entry.duplex = duplex;
    }
    if meta.location.is_some() {
        entry.location = meta.location.clone();
    }
    entry.legacy = meta.legacy;
}

/// Classifies a fresh sighting against the stored record.
fn classify(
    entry: &RemotePrinter,
    instance: &DiscoveredInstance,
    meta: &ServiceMeta,
) -> Observation {
    if matches!(
        entry.status,
        PrinterStatus::Unconfirmed | PrinterStatus::Disappeared
    ) {
        return Observation::Upgrade;
    }

    let stored = entry.best_discovery();
    let stored_secure = stored.map(|d| d.kind.is_secure()).unwrap_or(false);
    let stored_loopback = stored.map(|d| d.is_loopback()).unwrap_or(false);

    if instance.kind.is_secure() && !stored_secure {
        return Observation::Upgrade;
    }
    if instance.is_loopback() && !stored_loopback {
        return Observation::Upgrade;
    }
    if !entry.has_service_metadata() && !meta.legacy {
        return Observation::Upgrade;
    }

    if (!instance.kind.is_secure() && stored_secure)
        || (!instance.is_loopback() && stored_loopback)
        || (meta.legacy && entry.has_service_metadata())
    {
        return Observation::Downgrade;
    }

    Observation::Equal
}

/// Registers a queue left over from a previous session as an unconfirmed
/// entry: it is reclaimed if its printer reappears within the confirm window
/// and retired like any other stale queue otherwise.
pub async fn absorb_prior_queue(state: &Arc<BridgeState>, queue: &LocalQueueInfo) {
    let confirm_window = state.config.lock().await.discovery.confirm_window;
    let now = Instant::now();

    let (uri, identity) = match &queue.device_uri {
        Some(uri) => {
            let identity = Identity::Polled {
                host: uri.host_str().unwrap_or(&queue.name).to_string(),
                port: uri.port().unwrap_or(631),
                resource: uri.path().to_string(),
            };
            (uri.clone(), identity)
        }
        None => return,
    };

    let mut registry = state.registry.write().await;
    if registry.contains(&identity) {
        return;
    }

    let mut entry = RemotePrinter::new(identity.clone(), queue.name.clone(), uri);
    entry.status = PrinterStatus::Unconfirmed;
    entry.timeout_at = Some(now + confirm_window);
    // No discoveries: nothing has been seen this session yet.
    info!(
        "Absorbed prior-session queue '{}' (confirm window {:?})",
        queue.name, confirm_window
    );
    registry.insert(entry);
    drop(registry);
    state.wake_reconciler();
}
