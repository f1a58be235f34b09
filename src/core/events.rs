// src/core/events.rs

//! Defines the event types flowing between the discovery sources, the
//! notification intake, and the controller.

use crate::core::registry::{DiscoveredInstance, Identity};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Resolved service metadata for a discovered endpoint, normalised from the
/// DNS-SD TXT record or synthesised from a poll result.
#[derive(Debug, Clone, Default)]
pub struct ServiceMeta {
    pub service_name: String,
    /// The bare DNS-SD type, e.g. `_ipp._tcp`.
    pub service_type: String,
    pub domain: String,
    pub host: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
    /// Resource path on the endpoint, from the TXT `rp` key.
    pub resource: String,
    pub make_model: Option<String>,
    /// Accepted document formats, from the TXT `pdl` key.
    pub pdl: Vec<String>,
    pub color: Option<bool>,
    pub duplex: Option<bool>,
    pub location: Option<String>,
    pub uuid: Option<String>,
    /// The raw TXT record, for browse-filter evaluation.
    pub txt: BTreeMap<String, String>,
    /// Learned via polled discovery, without service-record metadata.
    pub legacy: bool,
}

impl ServiceMeta {
    /// The printer URI this metadata resolves to.
    pub fn endpoint_uri(&self, secure: bool) -> String {
        let scheme = if secure { "ipps" } else { "ipp" };
        let resource = if self.resource.is_empty() {
            "/ipp/print".to_string()
        } else if self.resource.starts_with('/') {
            self.resource.clone()
        } else {
            format!("/{}", self.resource)
        };
        format!("{scheme}://{}:{}{resource}", self.host, self.port)
    }

    /// String form of a metadata field, as seen by browse filters.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "name" | "service_name" => Some(self.service_name.clone()),
            "type" | "service_type" => Some(self.service_type.clone()),
            "domain" => Some(self.domain.clone()),
            "host" | "hostname" => Some(self.host.clone()),
            "port" => Some(self.port.to_string()),
            "resource" => Some(self.resource.clone()),
            "make_model" => self.make_model.clone(),
            "location" => self.location.clone(),
            other => self.txt.get(other).cloned(),
        }
    }
}

/// A unified event from any discovery source.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A service instance was seen but not yet resolved to an address.
    Appeared {
        identity: Identity,
        instance: DiscoveredInstance,
    },
    /// A service instance resolved with full metadata; this is what drives
    /// registry intake.
    Resolved {
        identity: Identity,
        instance: DiscoveredInstance,
        meta: Box<ServiceMeta>,
        /// Source address for access-control evaluation, when known.
        source_addr: Option<IpAddr>,
    },
    /// One sighting of a service instance went away.
    Removed {
        identity: Identity,
        instance: DiscoveredInstance,
    },
}

impl DiscoveryEvent {
    pub fn identity(&self) -> &Identity {
        match self {
            DiscoveryEvent::Appeared { identity, .. }
            | DiscoveryEvent::Resolved { identity, .. }
            | DiscoveryEvent::Removed { identity, .. } => identity,
        }
    }
}

/// Job lifecycle states reported by the spooler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Held,
    Processing,
    Stopped,
    Canceled,
    Aborted,
    Completed,
}

impl JobState {
    pub fn from_ipp(value: i32) -> Option<Self> {
        match value {
            3 => Some(JobState::Pending),
            4 => Some(JobState::Held),
            5 => Some(JobState::Processing),
            6 => Some(JobState::Stopped),
            7 => Some(JobState::Canceled),
            8 => Some(JobState::Aborted),
            9 => Some(JobState::Completed),
            _ => None,
        }
    }

    /// Whether the job still occupies the queue.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Pending | JobState::Held | JobState::Processing | JobState::Stopped
        )
    }
}

/// A notification consumed from the local spooler.
#[derive(Debug, Clone)]
pub enum SpoolerEvent {
    PrinterStateChanged {
        queue: String,
        /// The spooler flagged this queue as having just become the default.
        is_now_default: bool,
        reasons: Vec<String>,
    },
    PrinterModified {
        queue: String,
    },
    PrinterDeleted {
        queue: String,
    },
    JobState {
        queue: String,
        job_id: i32,
        state: JobState,
    },
}
