// src/core/registry/entry.rs

//! The per-endpoint registry record and its supporting types.

use crate::core::capabilities::Capabilities;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;
use strum_macros::Display;
use url::Url;

/// Logical identity of a remote endpoint: the service-record pair for
/// browsed printers, the address triple for polled ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Service { name: String, domain: String },
    Polled {
        host: String,
        port: u16,
        resource: String,
    },
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Service { name, domain } => write!(f, "{name}.{domain}"),
            Identity::Polled {
                host,
                port,
                resource,
            } => write!(f, "{host}:{port}{resource}"),
        }
    }
}

/// Lifecycle state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum PrinterStatus {
    /// Known from a previous session or a stale sighting; awaiting a fresh
    /// appearance within the confirm window.
    Unconfirmed,
    /// The local queue exists and matches the endpoint.
    Confirmed,
    /// The local queue must be created or updated.
    ToBeCreated,
    /// The local queue has been taken over by the user and is to be left alone.
    ToBeReleased,
    /// The endpoint is gone; the local queue is to be retired.
    Disappeared,
}

impl PrinterStatus {
    /// Terminal states exclude an entry from cluster mastership.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PrinterStatus::Disappeared | PrinterStatus::ToBeReleased)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

/// The transport flavour a service was discovered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Ipp,
    Ipps,
}

impl ServiceKind {
    pub fn is_secure(&self) -> bool {
        matches!(self, ServiceKind::Ipps)
    }

    /// Maps a DNS-SD service type (`_ipps._tcp`, possibly fully qualified)
    /// onto the transport flavour.
    pub fn from_service_type(ty: &str) -> Self {
        if ty.starts_with("_ipps.") || ty == "_ipps._tcp" {
            ServiceKind::Ipps
        } else {
            ServiceKind::Ipp
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            ServiceKind::Ipp => "ipp",
            ServiceKind::Ipps => "ipps",
        }
    }
}

/// One `(interface, type, family)` sighting of an endpoint.
///
/// The ordering ranks sightings by preference: loopback interfaces first,
/// then interface name, then secure over insecure, then IPv4 over IPv6. The
/// first element of an ordered set is the sighting the entry's addressing
/// should come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredInstance {
    pub interface: String,
    pub kind: ServiceKind,
    pub family: AddressFamily,
}

impl DiscoveredInstance {
    pub fn is_loopback(&self) -> bool {
        self.interface == "lo" || self.interface.starts_with("lo0")
    }
}

impl Ord for DiscoveredInstance {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .is_loopback()
            .cmp(&self.is_loopback())
            .then_with(|| self.interface.cmp(&other.interface))
            .then_with(|| other.kind.is_secure().cmp(&self.kind.is_secure()))
            .then_with(|| {
                let v4 = |f: &AddressFamily| matches!(f, AddressFamily::V4);
                v4(&other.family).cmp(&v4(&self.family))
            })
    }
}

impl PartialOrd for DiscoveredInstance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What a slave entry's master link points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlaveLink {
    Master(Identity),
    /// The distinguished sentinel used while a master is being torn down, so
    /// slaves never point at a freed record.
    DeletedMaster,
}

/// One discovered remote endpoint and everything the daemon knows about it.
#[derive(Debug, Clone)]
pub struct RemotePrinter {
    pub identity: Identity,
    /// Local queue name; shared by every member of a cluster.
    pub queue_name: String,
    /// Endpoint locator, or the sentinel locator for a cluster master.
    pub uri: Url,
    pub host: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub resource: String,
    pub service_name: String,
    pub service_type: String,
    pub domain: String,
    /// Sightings this endpoint has been seen through, best first.
    pub discoveries: BTreeSet<DiscoveredInstance>,
    pub make_model: String,
    /// Accepted document formats, most preferred first.
    pub pdl_list: Vec<String>,
    pub color: bool,
    pub duplex: bool,
    pub location: Option<String>,
    pub info: Option<String>,
    /// Descriptor nickname recorded at queue create time; used by the
    /// overwrite probe.
    pub nickname: Option<String>,
    pub capabilities: Option<Capabilities>,
    /// Preserved spooler option defaults, restored on queue re-creation.
    pub options: BTreeMap<String, String>,
    pub status: PrinterStatus,
    /// Earliest instant the reconciler may act on this entry; `None` means
    /// quiescent.
    pub timeout_at: Option<Instant>,
    pub slave_of: Option<SlaveLink>,
    /// Round-robin cursor over the cluster; meaningful on the master only.
    pub last_destination_index: usize,
    /// Consecutive local-spooler RPC timeouts.
    pub retry_count: u32,
    /// Learned via polled discovery without service-record metadata.
    pub legacy: bool,
    /// The local queue has been detected as externally modified.
    pub overwritten: bool,
    /// A worker is currently creating this entry.
    pub called: bool,
    /// Matched a manually declared cluster.
    pub manual_cluster: bool,
}

impl RemotePrinter {
    pub fn new(identity: Identity, queue_name: String, uri: Url) -> Self {
        let (host, port, resource, service_name, domain) = match &identity {
            Identity::Service { name, domain } => (
                uri.host_str().unwrap_or_default().to_string(),
                uri.port().unwrap_or(631),
                uri.path().to_string(),
                name.clone(),
                domain.clone(),
            ),
            Identity::Polled {
                host,
                port,
                resource,
            } => (
                host.clone(),
                *port,
                resource.clone(),
                String::new(),
                String::new(),
            ),
        };

        Self {
            identity,
            queue_name,
            uri,
            host,
            ip: None,
            port,
            resource,
            service_name,
            service_type: String::new(),
            domain,
            discoveries: BTreeSet::new(),
            make_model: String::new(),
            pdl_list: Vec::new(),
            color: false,
            duplex: false,
            location: None,
            info: None,
            nickname: None,
            capabilities: None,
            options: BTreeMap::new(),
            status: PrinterStatus::ToBeCreated,
            timeout_at: None,
            slave_of: None,
            last_destination_index: 0,
            retry_count: 0,
            legacy: false,
            overwritten: false,
            called: false,
            manual_cluster: false,
        }
    }

    pub fn is_master(&self) -> bool {
        self.slave_of.is_none()
    }

    pub fn is_slave(&self) -> bool {
        self.slave_of.is_some()
    }

    /// The preferred sighting, if any.
    pub fn best_discovery(&self) -> Option<&DiscoveredInstance> {
        self.discoveries.iter().next()
    }

    /// Whether this entry is due for reconciler attention at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.timeout_at, Some(t) if t <= now)
    }

    /// Schedules the entry for immediate reconciler attention. This is an
    /// explicit reset point of the otherwise non-decreasing timeout.
    pub fn schedule_now(&mut self, now: Instant) {
        self.timeout_at = Some(now);
    }

    /// Schedules the entry at `at`, never pulling an already later deadline
    /// forward.
    pub fn schedule_at(&mut self, at: Instant) {
        self.timeout_at = Some(match self.timeout_at {
            Some(current) => current.max(at),
            None => at,
        });
    }

    /// Pushes a pending deadline back to at least `until`. Quiescent entries
    /// stay quiescent.
    pub fn push_back(&mut self, until: Instant) {
        if let Some(current) = self.timeout_at {
            self.timeout_at = Some(current.max(until));
        }
    }

    /// Marks the entry quiescent.
    pub fn clear_timeout(&mut self) {
        self.timeout_at = None;
    }

    /// Whether the entry carries service-record metadata, as opposed to the
    /// bare address triple polling provides.
    pub fn has_service_metadata(&self) -> bool {
        !self.service_name.is_empty() && !self.legacy
    }
}
