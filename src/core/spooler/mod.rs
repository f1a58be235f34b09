// src/core/spooler/mod.rs

//! The spooler client: everything the daemon asks of the local print
//! spooler, behind a trait seam so the control logic can be exercised
//! against a mock.

pub mod client;
pub mod descriptor;
pub mod ipp;

pub use client::IppSpoolerClient;
pub use descriptor::{DescriptorGenerator, PpdGenerator};

use crate::core::capabilities::Capabilities;
use crate::core::errors::BridgeError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use url::Url;

/// The device-URI scheme that routes jobs back through this daemon.
pub const SENTINEL_SCHEME: &str = "implicit-cluster";

/// Queue option marking a queue as created and managed by this daemon.
pub const CONTROLLED_MARKER_OPTION: &str = "spoolbridge";

/// Queue option carrying the per-job destination for the cooperating backend.
pub const DEST_OPTION: &str = "spoolbridge-dest-printer";

/// The reason string this daemon uses when it disables a queue.
pub const DISABLE_REASON: &str = "Paused by spoolbridge";

/// The spooler's own reason string for backend failures; queues stopped with
/// it are safe to re-enable once their endpoint is reachable again.
pub const BACKEND_ERROR_REASON: &str = "Printer stopped due to backend errors";

/// Builds the sentinel device URI for a clustered queue.
pub fn sentinel_uri(queue_name: &str) -> Url {
    let encoded = urlencoding::encode(queue_name);
    Url::parse(&format!("{SENTINEL_SCHEME}://{encoded}"))
        .expect("sentinel URIs are always well-formed")
}

/// Whether a device URI is this daemon's sentinel for the given queue.
pub fn is_sentinel_uri(uri: &Url, queue_name: &str) -> bool {
    uri.scheme() == SENTINEL_SCHEME
        && uri
            .host_str()
            .map(|h| {
                urlencoding::decode(h)
                    .map(|d| d.eq_ignore_ascii_case(queue_name))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
}

/// One queue as listed by the local spooler.
#[derive(Debug, Clone)]
pub struct LocalQueueInfo {
    pub name: String,
    pub device_uri: Option<Url>,
    pub uuid: Option<String>,
    /// Carries the daemon's controlled-marker option.
    pub daemon_controlled: bool,
    pub shared: bool,
    /// Spooler-managed temporary queue.
    pub temporary: bool,
    pub is_default: bool,
}

/// Cached mirror of the spooler's queue list, keyed by lowercased name. Used
/// to detect name collisions and external modifications without an RPC.
#[derive(Debug, Default)]
pub struct LocalQueueCache {
    queues: HashMap<String, LocalQueueInfo>,
}

impl LocalQueueCache {
    pub fn replace_all(&mut self, queues: Vec<LocalQueueInfo>) {
        self.queues = queues
            .into_iter()
            .map(|q| (q.name.to_lowercase(), q))
            .collect();
    }

    pub fn upsert(&mut self, queue: LocalQueueInfo) {
        self.queues.insert(queue.name.to_lowercase(), queue);
    }

    pub fn remove(&mut self, name: &str) -> Option<LocalQueueInfo> {
        self.queues.remove(&name.to_lowercase())
    }

    pub fn get(&self, name: &str) -> Option<&LocalQueueInfo> {
        self.queues.get(&name.to_lowercase())
    }

    /// Whether `name` is taken by a queue this daemon does not control.
    pub fn is_foreign(&self, name: &str) -> bool {
        self.get(name).is_some_and(|q| !q.daemon_controlled)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalQueueInfo> {
        self.queues.values()
    }
}

/// Full attribute view of one queue, as fetched for the overwrite probe.
#[derive(Debug, Clone, Default)]
pub struct QueueAttributes {
    pub name: String,
    pub device_uri: Option<Url>,
    pub state: PrinterState,
    pub state_reasons: Vec<String>,
    /// Free-text reason the queue was stopped with, when any.
    pub state_message: Option<String>,
    pub accepting_jobs: bool,
    pub shared: bool,
    /// The descriptor nickname the queue currently carries.
    pub nickname: Option<String>,
    pub options: BTreeMap<String, String>,
}

/// Printer state as reported over IPP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrinterState {
    #[default]
    Idle,
    Processing,
    Stopped,
}

impl PrinterState {
    pub fn from_ipp(value: i32) -> Self {
        match value {
            4 => PrinterState::Processing,
            5 => PrinterState::Stopped,
            _ => PrinterState::Idle,
        }
    }
}

/// Live state of a remote endpoint, fetched during job dispatch.
#[derive(Debug, Clone)]
pub struct EndpointState {
    pub state: PrinterState,
    pub accepting_jobs: bool,
    /// Jobs currently queued or printing on the endpoint itself.
    pub active_jobs: usize,
}

/// One job as listed by the spooler.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: i32,
    pub state: crate::core::events::JobState,
}

/// Requested job options read for dispatch, in IPP string form.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub format: Option<String>,
    pub media: Option<String>,
    pub duplex: Option<String>,
    pub sides: Option<String>,
    pub color_mode: Option<String>,
    pub media_type: Option<String>,
    pub finishings: Vec<i32>,
    pub quality: Option<i32>,
    pub orientation: Option<i32>,
}

/// Everything needed to install or update one local queue.
#[derive(Debug, Clone)]
pub struct QueueInstall {
    pub name: String,
    pub device_uri: Url,
    /// Descriptor file contents; `None` keeps the existing descriptor.
    pub descriptor: Option<String>,
    pub info: Option<String>,
    pub location: Option<String>,
    /// Option defaults to (re-)apply, including the controlled marker.
    pub options: BTreeMap<String, String>,
}

/// An active notification subscription on the spooler.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: i32,
    pub lease: Duration,
    /// Next event sequence number to request.
    pub next_sequence: i32,
}

/// All RPC against the local spooler. Every call runs under the configured
/// deadline; deadline misses surface as [`BridgeError::SpoolerTimeout`] and
/// additionally raise the shared timeout flag read via
/// [`SpoolerRpc::take_timeout_flag`].
#[async_trait]
pub trait SpoolerRpc: Send + Sync {
    /// Cheap reachability probe used before a creation attempt.
    async fn connect(&self) -> Result<(), BridgeError>;

    async fn list_local_printers(&self) -> Result<Vec<LocalQueueInfo>, BridgeError>;

    async fn fetch_printer_attributes(&self, queue: &str) -> Result<QueueAttributes, BridgeError>;

    async fn fetch_job_request(&self, queue: &str, job_id: i32)
    -> Result<JobRequest, BridgeError>;

    async fn create_or_modify_queue(&self, install: &QueueInstall) -> Result<(), BridgeError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), BridgeError>;

    async fn enable_queue(&self, queue: &str) -> Result<(), BridgeError>;

    async fn disable_queue(&self, queue: &str, reason: &str) -> Result<(), BridgeError>;

    async fn set_shared(&self, queue: &str, shared: bool) -> Result<(), BridgeError>;

    async fn set_default(&self, queue: &str) -> Result<(), BridgeError>;

    async fn get_default(&self) -> Result<Option<String>, BridgeError>;

    async fn list_active_jobs(&self, queue: &str) -> Result<Vec<JobInfo>, BridgeError>;

    /// Publishes one queue option default, used for the per-job destination.
    async fn set_queue_option(
        &self,
        queue: &str,
        option: &str,
        value: &str,
    ) -> Result<(), BridgeError>;

    async fn subscribe(&self, events: &[&str], lease: Duration)
    -> Result<Subscription, BridgeError>;

    async fn renew_subscription(&self, id: i32, lease: Duration) -> Result<Duration, BridgeError>;

    async fn cancel_subscription(&self, id: i32) -> Result<(), BridgeError>;

    /// Fetches queued notifications for the subscription, starting at the
    /// given sequence number.
    async fn fetch_notifications(
        &self,
        id: i32,
        first_sequence: i32,
    ) -> Result<(Vec<crate::core::events::SpoolerEvent>, i32), BridgeError>;

    /// Reads and clears the shared HTTP-timeout flag raised by any RPC since
    /// the last call.
    fn take_timeout_flag(&self) -> bool;
}

/// RPC against remote endpoints (the printers themselves).
#[async_trait]
pub trait EndpointRpc: Send + Sync {
    /// Fetches and normalises the endpoint's capability document.
    async fn fetch_capabilities(&self, uri: &Url) -> Result<Capabilities, BridgeError>;

    /// Fetches the endpoint's live state for dispatch decisions.
    async fn fetch_state(&self, uri: &Url) -> Result<EndpointState, BridgeError>;
}
