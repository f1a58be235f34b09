// src/core/discovery/mdns.rs

//! Multicast DNS service browsing, bridging `mdns-sd` browse events into the
//! daemon's discovery event stream.

use super::DiscoverySource;
use crate::core::errors::BridgeError;
use crate::core::events::{DiscoveryEvent, ServiceMeta};
use crate::core::registry::{AddressFamily, DiscoveredInstance, Identity, ServiceKind};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Browses the configured DNS-SD service types.
pub struct MdnsSource {
    service_types: Vec<String>,
    daemon: Option<ServiceDaemon>,
    forwarders: Vec<JoinHandle<()>>,
}

impl MdnsSource {
    pub fn new(service_types: Vec<String>) -> Self {
        Self {
            service_types,
            daemon: None,
            forwarders: Vec::new(),
        }
    }
}

impl DiscoverySource for MdnsSource {
    fn name(&self) -> &'static str {
        "mdns"
    }

    fn start(&mut self, tx: mpsc::Sender<DiscoveryEvent>) -> Result<(), BridgeError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| BridgeError::Discovery(format!("failed to start mDNS daemon: {e}")))?;

        for service_type in &self.service_types {
            let full_type = qualify(service_type);
            let receiver = daemon
                .browse(&full_type)
                .map_err(|e| BridgeError::Discovery(format!("browse {full_type}: {e}")))?;

            let tx = tx.clone();
            let kind = ServiceKind::from_service_type(service_type);
            let bare_type = service_type.clone();
            self.forwarders.push(tokio::spawn(async move {
                while let Ok(event) = receiver.recv_async().await {
                    forward_event(event, kind, &bare_type, &tx).await;
                }
                debug!("mDNS receiver for '{bare_type}' closed");
            }));
        }

        self.daemon = Some(daemon);
        Ok(())
    }

    fn stop(&mut self) {
        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
        if let Some(daemon) = self.daemon.take() {
            if let Err(e) = daemon.shutdown() {
                warn!("mDNS daemon shutdown failed: {e}");
            }
        }
    }
}

/// Appends the `.local.` domain the browse API expects.
fn qualify(service_type: &str) -> String {
    if service_type.ends_with(".local.") {
        service_type.to_string()
    } else {
        format!("{}.local.", service_type.trim_end_matches('.'))
    }
}

/// Splits a full instance name (`Printer._ipp._tcp.local.`) into the
/// instance part.
fn instance_name(fullname: &str, service_type: &str) -> String {
    let suffix = format!(".{}", qualify(service_type));
    fullname
        .strip_suffix(&suffix)
        .unwrap_or(fullname)
        .to_string()
}

async fn forward_event(
    event: ServiceEvent,
    kind: ServiceKind,
    service_type: &str,
    tx: &mpsc::Sender<DiscoveryEvent>,
) {
    match event {
        ServiceEvent::ServiceFound(ty, fullname) => {
            let identity = Identity::Service {
                name: instance_name(&fullname, &ty),
                domain: "local".to_string(),
            };
            let _ = tx
                .send(DiscoveryEvent::Appeared {
                    identity,
                    instance: DiscoveredInstance {
                        interface: "any".to_string(),
                        kind,
                        family: AddressFamily::V4,
                    },
                })
                .await;
        }
        ServiceEvent::ServiceResolved(info) => {
            for event in resolved_events(&info, kind, service_type) {
                let _ = tx.send(event).await;
            }
        }
        ServiceEvent::ServiceRemoved(ty, fullname) => {
            let identity = Identity::Service {
                name: instance_name(&fullname, &ty),
                domain: "local".to_string(),
            };
            // The removal does not say which family vanished; retire both
            // sightings of this flavour.
            for family in [AddressFamily::V4, AddressFamily::V6] {
                for interface in ["any", "lo"] {
                    let _ = tx
                        .send(DiscoveryEvent::Removed {
                            identity: identity.clone(),
                            instance: DiscoveredInstance {
                                interface: interface.to_string(),
                                kind,
                                family,
                            },
                        })
                        .await;
                }
            }
        }
        other => debug!("Ignoring mDNS event {other:?}"),
    }
}

/// Converts one resolved service into per-address-family discovery events.
fn resolved_events(
    info: &ServiceInfo,
    kind: ServiceKind,
    service_type: &str,
) -> Vec<DiscoveryEvent> {
    let name = instance_name(info.get_fullname(), service_type);
    let identity = Identity::Service {
        name: name.clone(),
        domain: "local".to_string(),
    };

    let mut txt = BTreeMap::new();
    for property in info.get_properties().iter() {
        txt.insert(property.key().to_string(), property.val_str().to_string());
    }

    let host = info
        .get_hostname()
        .trim_end_matches('.')
        .to_string();
    let resource = txt.get("rp").cloned().unwrap_or_default();
    let meta_base = ServiceMeta {
        service_name: name,
        service_type: service_type.to_string(),
        domain: "local".to_string(),
        host,
        ip: None,
        port: info.get_port(),
        resource: if resource.is_empty() {
            "/ipp/print".to_string()
        } else {
            format!("/{}", resource.trim_start_matches('/'))
        },
        make_model: txt.get("ty").or_else(|| txt.get("product")).cloned(),
        pdl: txt
            .get("pdl")
            .map(|p| p.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
        color: txt.get("Color").map(|v| v == "T"),
        duplex: txt.get("Duplex").map(|v| v == "T"),
        location: txt.get("note").cloned(),
        uuid: txt.get("UUID").cloned(),
        txt,
        legacy: false,
    };

    let mut events = Vec::new();
    let mut families_seen = [false, false];
    for addr in info.get_addresses() {
        let (family, slot) = match addr {
            IpAddr::V4(_) => (AddressFamily::V4, 0),
            IpAddr::V6(_) => (AddressFamily::V6, 1),
        };
        if families_seen[slot] {
            continue;
        }
        families_seen[slot] = true;

        let mut meta = meta_base.clone();
        meta.ip = Some(*addr);
        events.push(DiscoveryEvent::Resolved {
            identity: identity.clone(),
            instance: DiscoveredInstance {
                interface: if addr.is_loopback() {
                    "lo".to_string()
                } else {
                    "any".to_string()
                },
                kind,
                family,
            },
            meta: Box::new(meta),
            source_addr: Some(*addr),
        });
    }
    events
}
