// tests/common/mod.rs

//! Shared fixtures: in-memory spooler and endpoint mocks, and a state
//! builder wired to them.

#![allow(dead_code)]

use async_trait::async_trait;
use spoolbridge::config::Config;
use spoolbridge::core::capabilities::{Capabilities, MediaSize, Resolution};
use spoolbridge::core::errors::BridgeError;
use spoolbridge::core::events::SpoolerEvent;
use spoolbridge::core::spooler::{
    CONTROLLED_MARKER_OPTION, EndpointRpc, EndpointState, JobInfo, JobRequest, LocalQueueInfo,
    PpdGenerator, PrinterState, QueueAttributes, QueueInstall, SpoolerRpc, Subscription,
};
use spoolbridge::core::spooler::descriptor::descriptor_nickname;
use spoolbridge::core::state::{BridgeInit, BridgeState};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing_subscriber::{filter::EnvFilter, reload};
use url::Url;

/// One installed queue as the mock spooler sees it.
#[derive(Debug, Clone)]
pub struct MockQueue {
    pub info: LocalQueueInfo,
    pub descriptor: Option<String>,
    pub options: BTreeMap<String, String>,
    pub state: PrinterState,
    pub state_message: Option<String>,
}

/// An in-memory spooler.
#[derive(Default)]
pub struct MockSpooler {
    pub queues: Mutex<HashMap<String, MockQueue>>,
    pub active_jobs: Mutex<HashMap<String, Vec<JobInfo>>>,
    pub job_requests: Mutex<HashMap<i32, JobRequest>>,
    pub default_queue: Mutex<Option<String>>,
    pub pending_events: Mutex<Vec<SpoolerEvent>>,
    pub deleted: Mutex<Vec<String>>,
    pub fail_connect: AtomicBool,
    pub refuse_shared: AtomicBool,
    timeout_flag: AtomicBool,
}

impl MockSpooler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn queue(&self, name: &str) -> Option<MockQueue> {
        self.queues.lock().await.get(&name.to_lowercase()).cloned()
    }

    pub async fn insert_queue(&self, queue: MockQueue) {
        self.queues
            .lock()
            .await
            .insert(queue.info.name.to_lowercase(), queue);
    }

    pub fn raise_timeout_flag(&self) {
        self.timeout_flag.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpoolerRpc for MockSpooler {
    async fn connect(&self) -> Result<(), BridgeError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            self.timeout_flag.store(true, Ordering::SeqCst);
            return Err(BridgeError::SpoolerTimeout);
        }
        Ok(())
    }

    async fn list_local_printers(&self) -> Result<Vec<LocalQueueInfo>, BridgeError> {
        Ok(self
            .queues
            .lock()
            .await
            .values()
            .map(|q| q.info.clone())
            .collect())
    }

    async fn fetch_printer_attributes(&self, queue: &str) -> Result<QueueAttributes, BridgeError> {
        let queues = self.queues.lock().await;
        let Some(q) = queues.get(&queue.to_lowercase()) else {
            return Err(BridgeError::SpoolerStatus {
                code: 0x0406,
                message: "not found".into(),
            });
        };
        Ok(QueueAttributes {
            name: q.info.name.clone(),
            device_uri: q.info.device_uri.clone(),
            state: q.state,
            state_reasons: vec![],
            state_message: q.state_message.clone(),
            accepting_jobs: true,
            shared: q.info.shared,
            nickname: q.descriptor.as_deref().and_then(descriptor_nickname),
            options: q.options.clone(),
        })
    }

    async fn fetch_job_request(
        &self,
        _queue: &str,
        job_id: i32,
    ) -> Result<JobRequest, BridgeError> {
        self.job_requests
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(BridgeError::SpoolerStatus {
                code: 0x0406,
                message: "no such job".into(),
            })
    }

    async fn create_or_modify_queue(&self, install: &QueueInstall) -> Result<(), BridgeError> {
        let mut queues = self.queues.lock().await;
        let entry = queues
            .entry(install.name.to_lowercase())
            .or_insert_with(|| MockQueue {
                info: LocalQueueInfo {
                    name: install.name.clone(),
                    device_uri: None,
                    uuid: None,
                    daemon_controlled: false,
                    shared: false,
                    temporary: false,
                    is_default: false,
                },
                descriptor: None,
                options: BTreeMap::new(),
                state: PrinterState::Idle,
                state_message: None,
            });
        entry.info.device_uri = Some(install.device_uri.clone());
        if let Some(descriptor) = &install.descriptor {
            entry.descriptor = Some(descriptor.clone());
        }
        for (key, value) in &install.options {
            entry.options.insert(key.clone(), value.clone());
        }
        entry.info.daemon_controlled = entry
            .options
            .get(CONTROLLED_MARKER_OPTION)
            .is_some_and(|v| v == "true");
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BridgeError> {
        self.queues.lock().await.remove(&queue.to_lowercase());
        self.deleted.lock().await.push(queue.to_string());
        Ok(())
    }

    async fn enable_queue(&self, queue: &str) -> Result<(), BridgeError> {
        if let Some(q) = self.queues.lock().await.get_mut(&queue.to_lowercase()) {
            q.state = PrinterState::Idle;
            q.state_message = None;
        }
        Ok(())
    }

    async fn disable_queue(&self, queue: &str, reason: &str) -> Result<(), BridgeError> {
        if let Some(q) = self.queues.lock().await.get_mut(&queue.to_lowercase()) {
            q.state = PrinterState::Stopped;
            q.state_message = Some(reason.to_string());
        }
        Ok(())
    }

    async fn set_shared(&self, queue: &str, shared: bool) -> Result<(), BridgeError> {
        if self.refuse_shared.load(Ordering::SeqCst) {
            return Err(BridgeError::SpoolerStatus {
                code: 0x0504,
                message: "refused".into(),
            });
        }
        if let Some(q) = self.queues.lock().await.get_mut(&queue.to_lowercase()) {
            q.info.shared = shared;
        }
        Ok(())
    }

    async fn set_default(&self, queue: &str) -> Result<(), BridgeError> {
        *self.default_queue.lock().await = Some(queue.to_string());
        Ok(())
    }

    async fn get_default(&self) -> Result<Option<String>, BridgeError> {
        Ok(self.default_queue.lock().await.clone())
    }

    async fn list_active_jobs(&self, queue: &str) -> Result<Vec<JobInfo>, BridgeError> {
        Ok(self
            .active_jobs
            .lock()
            .await
            .get(queue)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_queue_option(
        &self,
        queue: &str,
        option: &str,
        value: &str,
    ) -> Result<(), BridgeError> {
        if let Some(q) = self.queues.lock().await.get_mut(&queue.to_lowercase()) {
            q.options.insert(option.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        _events: &[&str],
        lease: Duration,
    ) -> Result<Subscription, BridgeError> {
        Ok(Subscription {
            id: 42,
            lease,
            next_sequence: 1,
        })
    }

    async fn renew_subscription(&self, _id: i32, lease: Duration) -> Result<Duration, BridgeError> {
        Ok(lease)
    }

    async fn cancel_subscription(&self, _id: i32) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn fetch_notifications(
        &self,
        _id: i32,
        first_sequence: i32,
    ) -> Result<(Vec<SpoolerEvent>, i32), BridgeError> {
        let events: Vec<SpoolerEvent> = self.pending_events.lock().await.drain(..).collect();
        let next = first_sequence + events.len() as i32;
        Ok((events, next))
    }

    fn take_timeout_flag(&self) -> bool {
        self.timeout_flag.swap(false, Ordering::SeqCst)
    }
}

/// In-memory remote endpoints.
#[derive(Default)]
pub struct MockEndpoints {
    pub capabilities: Mutex<HashMap<String, Capabilities>>,
    pub states: Mutex<HashMap<String, EndpointState>>,
}

impl MockEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_capabilities(&self, uri: &str, caps: Capabilities) {
        self.capabilities.lock().await.insert(uri.to_string(), caps);
    }

    pub async fn set_state(&self, uri: &str, state: EndpointState) {
        self.states.lock().await.insert(uri.to_string(), state);
    }
}

#[async_trait]
impl EndpointRpc for MockEndpoints {
    async fn fetch_capabilities(&self, uri: &Url) -> Result<Capabilities, BridgeError> {
        self.capabilities
            .lock()
            .await
            .get(uri.as_str())
            .cloned()
            .ok_or_else(|| {
                BridgeError::CapabilityFetch(uri.to_string(), "unreachable".to_string())
            })
    }

    async fn fetch_state(&self, uri: &Url) -> Result<EndpointState, BridgeError> {
        self.states
            .lock()
            .await
            .get(uri.as_str())
            .cloned()
            .ok_or_else(|| BridgeError::HttpTransport("unreachable".to_string()))
    }
}

/// A capability document for a plain A4 duplex office printer.
pub fn office_caps(make_model: &str, throughput: i32) -> Capabilities {
    let mut caps = Capabilities::default();
    caps.make_model = make_model.to_string();
    caps.color = true;
    caps.duplex = true;
    caps.throughput = throughput;
    caps.pdl = vec!["application/pdf".to_string(), "image/urf".to_string()];
    caps.media_sizes.insert(MediaSize::new(21000, 29700));
    caps.media_sizes.insert(MediaSize::new(21590, 27940));
    caps.resolutions.insert(Resolution::new(300, 300));
    caps.resolutions.insert(Resolution::new(600, 600));
    caps.lists.insert(
        "sides".to_string(),
        ["one-sided", "two-sided-long-edge"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    caps.qualities = [3, 4, 5].into_iter().collect();
    caps
}

/// Everything a control-logic test needs.
pub struct Fixture {
    pub state: Arc<BridgeState>,
    pub init: BridgeInit,
    pub spooler: Arc<MockSpooler>,
    pub endpoints: Arc<MockEndpoints>,
    _cache_dir: tempfile::TempDir,
}

/// Builds a state wired to fresh mocks and a temporary cache directory.
pub async fn fixture_with_config(mut config: Config) -> Fixture {
    let cache_dir = tempfile::tempdir().unwrap();
    config.cache_dir = cache_dir.path().to_string_lossy().into_owned();

    let spooler = Arc::new(MockSpooler::new());
    let endpoints = Arc::new(MockEndpoints::new());

    let (_, reload_handle) =
        reload::Layer::<EnvFilter, tracing_subscriber::Registry>::new(EnvFilter::new("warn"));

    let init = BridgeState::initialize(
        config,
        spooler.clone(),
        endpoints.clone(),
        Arc::new(PpdGenerator),
        Arc::new(reload_handle),
    )
    .unwrap();
    init.state.state_dir.ensure().await.unwrap();

    Fixture {
        state: init.state.clone(),
        init,
        spooler,
        endpoints,
        _cache_dir: cache_dir,
    }
}

pub async fn fixture() -> Fixture {
    fixture_with_config(Config::default()).await
}

/// Marks the daemon as holding a notification channel, enabling sentinel
/// routing.
pub async fn with_subscription(state: &Arc<BridgeState>) {
    *state.subscription.lock().await = Some(Subscription {
        id: 42,
        lease: Duration::from_secs(3600),
        next_sequence: 1,
    });
}

/// A resolved mDNS sighting for tests.
pub fn resolved_event(
    name: &str,
    host: &str,
    secure: bool,
) -> spoolbridge::core::events::DiscoveryEvent {
    use spoolbridge::core::events::{DiscoveryEvent, ServiceMeta};
    use spoolbridge::core::registry::{AddressFamily, DiscoveredInstance, Identity, ServiceKind};

    let kind = if secure {
        ServiceKind::Ipps
    } else {
        ServiceKind::Ipp
    };
    DiscoveryEvent::Resolved {
        identity: Identity::Service {
            name: name.to_string(),
            domain: "local".to_string(),
        },
        instance: DiscoveredInstance {
            interface: "any".to_string(),
            kind,
            family: AddressFamily::V4,
        },
        meta: Box::new(ServiceMeta {
            service_name: name.to_string(),
            service_type: if secure { "_ipps._tcp" } else { "_ipp._tcp" }.to_string(),
            domain: "local".to_string(),
            host: host.to_string(),
            ip: None,
            port: 631,
            resource: "/printers/lj".to_string(),
            make_model: Some("HP LaserJet 600".to_string()),
            pdl: vec!["application/pdf".to_string(), "image/urf".to_string()],
            color: Some(true),
            duplex: Some(true),
            location: None,
            uuid: None,
            txt: Default::default(),
            legacy: false,
        }),
        source_addr: None,
    }
}

