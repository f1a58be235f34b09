// src/core/discovery/poll.rs

//! Periodic polling of remote spoolers for their exported printer lists.
//!
//! Poll-discovered printers are legacy entries: they carry no service-record
//! metadata and stay confirmed only as long as polls keep re-seeing them.

use super::DiscoverySource;
use crate::core::errors::BridgeError;
use crate::core::events::{DiscoveryEvent, ServiceMeta};
use crate::core::registry::{AddressFamily, DiscoveredInstance, Identity, ServiceKind};
use crate::core::spooler::{IppSpoolerClient, SpoolerRpc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One configured remote spooler.
#[derive(Debug, Clone)]
struct PollTarget {
    host: String,
    port: u16,
}

fn parse_target(entry: &str) -> Result<PollTarget, BridgeError> {
    let entry = entry.trim();
    match entry.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok(PollTarget {
            host: host.to_string(),
            port: port
                .parse()
                .map_err(|_| BridgeError::Discovery(format!("bad poll server '{entry}'")))?,
        }),
        _ => Ok(PollTarget {
            host: entry.to_string(),
            port: 631,
        }),
    }
}

/// Polls the configured servers on an interval with a little jitter, so a
/// fleet of daemons does not synchronise against one server.
pub struct PollSource {
    targets: Vec<PollTarget>,
    interval: Duration,
    timeout: Duration,
    worker: Option<JoinHandle<()>>,
}

impl PollSource {
    pub fn new(
        servers: Vec<String>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let targets = servers
            .iter()
            .map(|s| parse_target(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            targets,
            interval,
            timeout,
            worker: None,
        })
    }
}

impl DiscoverySource for PollSource {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn start(&mut self, tx: mpsc::Sender<DiscoveryEvent>) -> Result<(), BridgeError> {
        let targets = self.targets.clone();
        let interval = self.interval;
        let timeout = self.timeout;

        self.worker = Some(tokio::spawn(async move {
            let mut rng = SmallRng::from_entropy();
            // One seen-set per target, to synthesise removals.
            let mut seen: Vec<HashSet<Identity>> = targets.iter().map(|_| HashSet::new()).collect();

            loop {
                for (target, previously_seen) in targets.iter().zip(seen.iter_mut()) {
                    match poll_one(target, timeout, &tx, previously_seen).await {
                        Ok(current) => *previously_seen = current,
                        Err(e) => {
                            warn!("Poll of {}:{} failed: {e}", target.host, target.port);
                        }
                    }
                }

                let jitter = rng.gen_range(0..=interval.as_millis() as u64 / 10);
                tokio::time::sleep(interval + Duration::from_millis(jitter)).await;
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Polls one server, emits appearance events for every exported printer, and
/// removal events for printers missing since the previous cycle.
async fn poll_one(
    target: &PollTarget,
    timeout: Duration,
    tx: &mpsc::Sender<DiscoveryEvent>,
    previously_seen: &HashSet<Identity>,
) -> Result<HashSet<Identity>, BridgeError> {
    let client = IppSpoolerClient::new(&target.host, target.port, timeout, timeout)?;
    let printers = client.list_local_printers().await?;
    debug!(
        "Poll of {}:{} returned {} printers",
        target.host,
        target.port,
        printers.len()
    );

    let instance = DiscoveredInstance {
        interface: "poll".to_string(),
        kind: ServiceKind::Ipp,
        family: AddressFamily::V4,
    };
    let source_addr = target.host.parse().ok();

    let mut current = HashSet::new();
    for printer in printers {
        let resource = format!("/printers/{}", printer.name);
        let identity = Identity::Polled {
            host: target.host.clone(),
            port: target.port,
            resource: resource.clone(),
        };
        current.insert(identity.clone());

        let meta = ServiceMeta {
            host: target.host.clone(),
            port: target.port,
            resource,
            legacy: true,
            ..Default::default()
        };
        let _ = tx
            .send(DiscoveryEvent::Resolved {
                identity,
                instance: instance.clone(),
                meta: Box::new(meta),
                source_addr,
            })
            .await;
    }

    for gone in previously_seen.difference(&current) {
        let _ = tx
            .send(DiscoveryEvent::Removed {
                identity: gone.clone(),
                instance: instance.clone(),
            })
            .await;
    }

    Ok(current)
}
