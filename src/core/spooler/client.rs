// src/core/spooler/client.rs

//! The IPP client used against both the local spooler and remote endpoints.
//!
//! IPP runs as binary request/response bodies over HTTP POST. Every call is
//! bounded by the configured per-call deadline; a missed deadline raises the
//! shared timeout flag the reconciler inspects after each step.

use super::ipp::{
    IppAttribute, IppCodec, IppGroup, IppMessage, IppValue, OP_CANCEL_SUBSCRIPTION,
    OP_CREATE_PRINTER_SUBSCRIPTIONS, OP_CUPS_ADD_MODIFY_PRINTER, OP_CUPS_DELETE_PRINTER,
    OP_CUPS_GET_DEFAULT, OP_CUPS_GET_PRINTERS, OP_CUPS_SET_DEFAULT, OP_GET_JOB_ATTRIBUTES,
    OP_GET_JOBS, OP_GET_NOTIFICATIONS, OP_GET_PRINTER_ATTRIBUTES, OP_PAUSE_PRINTER,
    OP_RENEW_SUBSCRIPTION, OP_RESUME_PRINTER, TAG_EVENT_NOTIFICATION, TAG_JOB, TAG_PRINTER,
    TAG_SUBSCRIPTION,
};
use super::{
    CONTROLLED_MARKER_OPTION, EndpointRpc, EndpointState, JobInfo, JobRequest, LocalQueueInfo,
    PrinterState, QueueAttributes, QueueInstall, SpoolerRpc, Subscription,
};
use crate::core::capabilities::{
    Capabilities, MediaColEntry, MediaSize, MediaSizeRange, Resolution,
};
use crate::core::errors::BridgeError;
use crate::core::events::{JobState, SpoolerEvent};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};
use url::Url;

/// The concrete IPP client. One instance serves the whole daemon; requests
/// are independent and may run concurrently.
pub struct IppSpoolerClient {
    http: reqwest::Client,
    /// HTTP base of the local spooler, e.g. `http://localhost:631`.
    base: Url,
    spooler_timeout: Duration,
    endpoint_timeout: Duration,
    timeout_flag: AtomicBool,
    request_id: AtomicU32,
}

impl IppSpoolerClient {
    pub fn new(
        host: &str,
        port: u16,
        spooler_timeout: Duration,
        endpoint_timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let base = Url::parse(&format!("http://{host}:{port}/"))?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| BridgeError::HttpTransport(e.to_string()))?;
        Ok(Self {
            http,
            base,
            spooler_timeout,
            endpoint_timeout,
            timeout_flag: AtomicBool::new(false),
            request_id: AtomicU32::new(1),
        })
    }

    fn next_request_id(&self) -> u32 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The IPP URI of a local queue, with the name percent-encoded.
    pub fn queue_uri(&self, queue: &str) -> String {
        format!(
            "ipp://{}:{}/printers/{}",
            self.base.host_str().unwrap_or("localhost"),
            self.base.port().unwrap_or(631),
            urlencoding::encode(queue)
        )
    }

    /// Rewrites an `ipp`/`ipps` URI into its HTTP transport form.
    fn transport_url(uri: &Url) -> Result<Url, BridgeError> {
        let scheme = match uri.scheme() {
            "ipp" | "http" => "http",
            "ipps" | "https" => "https",
            other => {
                return Err(BridgeError::InvalidUri(format!(
                    "cannot transport scheme '{other}'"
                )));
            }
        };
        let host = uri
            .host_str()
            .ok_or_else(|| BridgeError::InvalidUri("URI has no host".into()))?;
        let port = uri.port().unwrap_or(631);
        let mut out = Url::parse(&format!("{scheme}://{host}:{port}/"))?;
        out.set_path(uri.path());
        Ok(out)
    }

    /// One request/response exchange. `extra_body` carries a descriptor file
    /// when installing a queue.
    async fn roundtrip(
        &self,
        target: &Url,
        message: IppMessage,
        deadline: Duration,
        extra_body: Option<&str>,
    ) -> Result<IppMessage, BridgeError> {
        let mut body = message.encode_to_vec()?;
        if let Some(extra) = extra_body {
            body.extend_from_slice(extra.as_bytes());
        }

        let request = self
            .http
            .post(target.clone())
            .header("Content-Type", "application/ipp")
            .body(body);

        let result = timeout(deadline, async {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(BridgeError::HttpTransport(format!(
                    "HTTP {status} from {target}"
                )));
            }
            let bytes = response.bytes().await?;
            Ok::<_, BridgeError>(bytes)
        })
        .await;

        let bytes = match result {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                self.timeout_flag.store(true, Ordering::SeqCst);
                return Err(BridgeError::SpoolerTimeout);
            }
        };

        let mut buf = BytesMut::from(&bytes[..]);
        IppCodec
            .decode(&mut buf)?
            .ok_or(BridgeError::IncompleteData)
    }

    /// Exchange against the local spooler, failing on non-success status.
    async fn spooler_call(
        &self,
        message: IppMessage,
        extra_body: Option<&str>,
    ) -> Result<IppMessage, BridgeError> {
        let response = self
            .roundtrip(&self.base, message, self.spooler_timeout, extra_body)
            .await?;
        expect_success(response)
    }

    /// Exchange against a remote endpoint.
    async fn endpoint_call(
        &self,
        uri: &Url,
        message: IppMessage,
    ) -> Result<IppMessage, BridgeError> {
        let target = Self::transport_url(uri)?;
        let response = self
            .roundtrip(&target, message, self.endpoint_timeout, None)
            .await?;
        expect_success(response)
    }

    fn printer_uri_attr(&self, queue: &str) -> IppAttribute {
        IppAttribute::new("printer-uri", IppValue::Uri(self.queue_uri(queue)))
    }
}

fn expect_success(response: IppMessage) -> Result<IppMessage, BridgeError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(BridgeError::SpoolerStatus {
            code: response.operation_or_status,
            message: response
                .status_message()
                .unwrap_or("no status message")
                .to_string(),
        })
    }
}

#[async_trait]
impl SpoolerRpc for IppSpoolerClient {
    async fn connect(&self) -> Result<(), BridgeError> {
        let request = IppMessage::request(OP_CUPS_GET_DEFAULT, self.next_request_id())
            .operation_attr(IppAttribute::with_values(
                "requested-attributes",
                vec![IppValue::Keyword("printer-name".into())],
            ));
        // Having no default queue is still a successful connection.
        match self.spooler_call(request, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_local_printers(&self) -> Result<Vec<LocalQueueInfo>, BridgeError> {
        let marker_attr = format!("{CONTROLLED_MARKER_OPTION}-default");
        let requested: Vec<&str> = vec![
            "printer-name",
            "device-uri",
            "printer-uuid",
            "printer-is-shared",
            "printer-is-temporary",
            &marker_attr,
        ];
        let request = IppMessage::request(OP_CUPS_GET_PRINTERS, self.next_request_id())
            .operation_attr(IppAttribute::with_values(
                "requested-attributes",
                requested
                    .iter()
                    .map(|s| IppValue::Keyword(s.to_string()))
                    .collect(),
            ));

        let response = match self.spooler_call(request, None).await {
            Ok(r) => r,
            // An empty spooler answers CUPS-Get-Printers with not-found.
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut queues = Vec::new();
        for group in response.groups_of(TAG_PRINTER) {
            let Some(name) = group.attr("printer-name").and_then(|a| a.first_str()) else {
                continue;
            };
            queues.push(LocalQueueInfo {
                name: name.to_string(),
                device_uri: group
                    .attr("device-uri")
                    .and_then(|a| a.first_str())
                    .and_then(|u| Url::parse(u).ok()),
                uuid: group
                    .attr("printer-uuid")
                    .and_then(|a| a.first_str())
                    .map(|s| s.to_string()),
                daemon_controlled: group
                    .attr(&format!("{CONTROLLED_MARKER_OPTION}-default"))
                    .and_then(|a| a.first_str())
                    .is_some_and(|v| v == "true"),
                shared: group
                    .attr("printer-is-shared")
                    .and_then(|a| a.first_bool())
                    .unwrap_or(false),
                temporary: group
                    .attr("printer-is-temporary")
                    .and_then(|a| a.first_bool())
                    .unwrap_or(false),
                // Default membership is established separately via
                // `get_default`; the listing itself does not carry it.
                is_default: false,
            });
        }
        Ok(queues)
    }

    async fn fetch_printer_attributes(&self, queue: &str) -> Result<QueueAttributes, BridgeError> {
        let request = IppMessage::request(OP_GET_PRINTER_ATTRIBUTES, self.next_request_id())
            .operation_attr(self.printer_uri_attr(queue))
            .operation_attr(IppAttribute::with_values(
                "requested-attributes",
                vec![IppValue::Keyword("all".into())],
            ));
        let response = self.spooler_call(request, None).await?;
        let group = response
            .first_group(TAG_PRINTER)
            .ok_or_else(|| BridgeError::Protocol("response carries no printer group".into()))?;

        let mut options = BTreeMap::new();
        for attribute in &group.attributes {
            if let Some(option) = attribute.name.strip_suffix("-default") {
                if let Some(value) = attribute.first_str() {
                    options.insert(option.to_string(), value.to_string());
                }
            }
        }

        Ok(QueueAttributes {
            name: queue.to_string(),
            device_uri: group
                .attr("device-uri")
                .and_then(|a| a.first_str())
                .and_then(|u| Url::parse(u).ok()),
            state: PrinterState::from_ipp(
                group
                    .attr("printer-state")
                    .and_then(|a| a.first_i32())
                    .unwrap_or(3),
            ),
            state_reasons: group
                .attr("printer-state-reasons")
                .map(|a| a.strings().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
            state_message: group
                .attr("printer-state-message")
                .and_then(|a| a.first_str())
                .map(|s| s.to_string()),
            accepting_jobs: group
                .attr("printer-is-accepting-jobs")
                .and_then(|a| a.first_bool())
                .unwrap_or(true),
            shared: group
                .attr("printer-is-shared")
                .and_then(|a| a.first_bool())
                .unwrap_or(false),
            nickname: group
                .attr("printer-make-and-model")
                .and_then(|a| a.first_str())
                .map(|s| s.to_string()),
            options,
        })
    }

    async fn fetch_job_request(
        &self,
        queue: &str,
        job_id: i32,
    ) -> Result<JobRequest, BridgeError> {
        let request = IppMessage::request(OP_GET_JOB_ATTRIBUTES, self.next_request_id())
            .operation_attr(self.printer_uri_attr(queue))
            .operation_attr(IppAttribute::new("job-id", IppValue::Integer(job_id)))
            .operation_attr(IppAttribute::with_values(
                "requested-attributes",
                vec![IppValue::Keyword("all".into())],
            ));
        let response = self.spooler_call(request, None).await?;
        let group = response
            .first_group(TAG_JOB)
            .ok_or_else(|| BridgeError::Protocol("response carries no job group".into()))?;

        let str_attr = |name: &str| {
            group
                .attr(name)
                .and_then(|a| a.first_str())
                .map(|s| s.to_string())
        };

        Ok(JobRequest {
            format: str_attr("document-format"),
            media: str_attr("media"),
            duplex: str_attr("duplex"),
            sides: str_attr("sides"),
            color_mode: str_attr("print-color-mode"),
            media_type: str_attr("media-type"),
            finishings: group
                .attr("finishings")
                .map(|a| a.integers().collect())
                .unwrap_or_default(),
            quality: group.attr("print-quality").and_then(|a| a.first_i32()),
            orientation: group
                .attr("orientation-requested")
                .and_then(|a| a.first_i32()),
        })
    }

    async fn create_or_modify_queue(&self, install: &QueueInstall) -> Result<(), BridgeError> {
        let mut printer_group = IppGroup::new(TAG_PRINTER);
        printer_group.attributes.push(IppAttribute::new(
            "device-uri",
            IppValue::Uri(install.device_uri.to_string()),
        ));
        printer_group.attributes.push(IppAttribute::new(
            "printer-is-accepting-jobs",
            IppValue::Boolean(true),
        ));
        printer_group
            .attributes
            .push(IppAttribute::new("printer-state", IppValue::Enum(3)));
        if let Some(info) = &install.info {
            printer_group
                .attributes
                .push(IppAttribute::new("printer-info", IppValue::Text(info.clone())));
        }
        if let Some(location) = &install.location {
            printer_group.attributes.push(IppAttribute::new(
                "printer-location",
                IppValue::Text(location.clone()),
            ));
        }
        for (option, value) in &install.options {
            printer_group.attributes.push(IppAttribute::new(
                &format!("{option}-default"),
                IppValue::Name(value.clone()),
            ));
        }

        let request = IppMessage::request(OP_CUPS_ADD_MODIFY_PRINTER, self.next_request_id())
            .operation_attr(self.printer_uri_attr(&install.name))
            .group(printer_group);

        self.spooler_call(request, install.descriptor.as_deref())
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BridgeError> {
        let request = IppMessage::request(OP_CUPS_DELETE_PRINTER, self.next_request_id())
            .operation_attr(self.printer_uri_attr(queue));
        match self.spooler_call(request, None).await {
            Ok(_) => Ok(()),
            // Deleting an already-deleted queue is success.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn enable_queue(&self, queue: &str) -> Result<(), BridgeError> {
        let request = IppMessage::request(OP_RESUME_PRINTER, self.next_request_id())
            .operation_attr(self.printer_uri_attr(queue));
        self.spooler_call(request, None).await?;
        Ok(())
    }

    async fn disable_queue(&self, queue: &str, reason: &str) -> Result<(), BridgeError> {
        let request = IppMessage::request(OP_PAUSE_PRINTER, self.next_request_id())
            .operation_attr(self.printer_uri_attr(queue))
            .operation_attr(IppAttribute::new(
                "printer-state-message",
                IppValue::Text(reason.to_string()),
            ));
        self.spooler_call(request, None).await?;
        Ok(())
    }

    async fn set_shared(&self, queue: &str, shared: bool) -> Result<(), BridgeError> {
        let mut printer_group = IppGroup::new(TAG_PRINTER);
        printer_group.attributes.push(IppAttribute::new(
            "printer-is-shared",
            IppValue::Boolean(shared),
        ));
        let request = IppMessage::request(OP_CUPS_ADD_MODIFY_PRINTER, self.next_request_id())
            .operation_attr(self.printer_uri_attr(queue))
            .group(printer_group);
        self.spooler_call(request, None).await?;
        Ok(())
    }

    async fn set_default(&self, queue: &str) -> Result<(), BridgeError> {
        let request = IppMessage::request(OP_CUPS_SET_DEFAULT, self.next_request_id())
            .operation_attr(self.printer_uri_attr(queue));
        self.spooler_call(request, None).await?;
        Ok(())
    }

    async fn get_default(&self) -> Result<Option<String>, BridgeError> {
        let request = IppMessage::request(OP_CUPS_GET_DEFAULT, self.next_request_id())
            .operation_attr(IppAttribute::with_values(
                "requested-attributes",
                vec![IppValue::Keyword("printer-name".into())],
            ));
        match self.spooler_call(request, None).await {
            Ok(response) => Ok(response
                .first_group(TAG_PRINTER)
                .and_then(|g| g.attr("printer-name"))
                .and_then(|a| a.first_str())
                .map(|s| s.to_string())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_active_jobs(&self, queue: &str) -> Result<Vec<JobInfo>, BridgeError> {
        let request = IppMessage::request(OP_GET_JOBS, self.next_request_id())
            .operation_attr(self.printer_uri_attr(queue))
            .operation_attr(IppAttribute::new(
                "which-jobs",
                IppValue::Keyword("not-completed".into()),
            ))
            .operation_attr(IppAttribute::with_values(
                "requested-attributes",
                vec![
                    IppValue::Keyword("job-id".into()),
                    IppValue::Keyword("job-state".into()),
                ],
            ));
        let response = self.spooler_call(request, None).await?;

        let mut jobs = Vec::new();
        for group in response.groups_of(TAG_JOB) {
            let (Some(id), Some(state)) = (
                group.attr("job-id").and_then(|a| a.first_i32()),
                group
                    .attr("job-state")
                    .and_then(|a| a.first_i32())
                    .and_then(JobState::from_ipp),
            ) else {
                continue;
            };
            jobs.push(JobInfo { id, state });
        }
        Ok(jobs)
    }

    async fn set_queue_option(
        &self,
        queue: &str,
        option: &str,
        value: &str,
    ) -> Result<(), BridgeError> {
        let mut printer_group = IppGroup::new(TAG_PRINTER);
        printer_group.attributes.push(IppAttribute::new(
            &format!("{option}-default"),
            IppValue::Name(value.to_string()),
        ));
        let request = IppMessage::request(OP_CUPS_ADD_MODIFY_PRINTER, self.next_request_id())
            .operation_attr(self.printer_uri_attr(queue))
            .group(printer_group);
        self.spooler_call(request, None).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        events: &[&str],
        lease: Duration,
    ) -> Result<Subscription, BridgeError> {
        let mut subscription_group = IppGroup::new(TAG_SUBSCRIPTION);
        subscription_group.attributes.push(IppAttribute::with_values(
            "notify-events",
            events
                .iter()
                .map(|e| IppValue::Keyword(e.to_string()))
                .collect(),
        ));
        subscription_group.attributes.push(IppAttribute::new(
            "notify-pull-method",
            IppValue::Keyword("ippget".into()),
        ));
        subscription_group.attributes.push(IppAttribute::new(
            "notify-lease-duration",
            IppValue::Integer(lease.as_secs() as i32),
        ));

        let request =
            IppMessage::request(OP_CREATE_PRINTER_SUBSCRIPTIONS, self.next_request_id())
                .operation_attr(IppAttribute::new(
                    "printer-uri",
                    IppValue::Uri(format!(
                        "ipp://{}:{}/",
                        self.base.host_str().unwrap_or("localhost"),
                        self.base.port().unwrap_or(631)
                    )),
                ))
                .group(subscription_group);

        let response = self.spooler_call(request, None).await?;
        let id = response
            .first_group(TAG_SUBSCRIPTION)
            .and_then(|g| g.attr("notify-subscription-id"))
            .and_then(|a| a.first_i32())
            .ok_or_else(|| BridgeError::Protocol("no notify-subscription-id granted".into()))?;
        let granted_lease = response
            .first_group(TAG_SUBSCRIPTION)
            .and_then(|g| g.attr("notify-lease-duration"))
            .and_then(|a| a.first_i32())
            .map(|s| Duration::from_secs(s.max(0) as u64))
            .unwrap_or(lease);

        debug!("Created notification subscription {id} (lease {granted_lease:?})");
        Ok(Subscription {
            id,
            lease: granted_lease,
            next_sequence: 1,
        })
    }

    async fn renew_subscription(&self, id: i32, lease: Duration) -> Result<Duration, BridgeError> {
        let request = IppMessage::request(OP_RENEW_SUBSCRIPTION, self.next_request_id())
            .operation_attr(IppAttribute::new(
                "printer-uri",
                IppValue::Uri(format!(
                    "ipp://{}:{}/",
                    self.base.host_str().unwrap_or("localhost"),
                    self.base.port().unwrap_or(631)
                )),
            ))
            .operation_attr(IppAttribute::new(
                "notify-subscription-id",
                IppValue::Integer(id),
            ))
            .operation_attr(IppAttribute::new(
                "notify-lease-duration",
                IppValue::Integer(lease.as_secs() as i32),
            ));
        let response = self.spooler_call(request, None).await?;
        Ok(response
            .first_group(TAG_SUBSCRIPTION)
            .and_then(|g| g.attr("notify-lease-duration"))
            .and_then(|a| a.first_i32())
            .map(|s| Duration::from_secs(s.max(0) as u64))
            .unwrap_or(lease))
    }

    async fn cancel_subscription(&self, id: i32) -> Result<(), BridgeError> {
        let request = IppMessage::request(OP_CANCEL_SUBSCRIPTION, self.next_request_id())
            .operation_attr(IppAttribute::new(
                "printer-uri",
                IppValue::Uri(format!(
                    "ipp://{}:{}/",
                    self.base.host_str().unwrap_or("localhost"),
                    self.base.port().unwrap_or(631)
                )),
            ))
            .operation_attr(IppAttribute::new(
                "notify-subscription-id",
                IppValue::Integer(id),
            ));
        match self.spooler_call(request, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn fetch_notifications(
        &self,
        id: i32,
        first_sequence: i32,
    ) -> Result<(Vec<SpoolerEvent>, i32), BridgeError> {
        let request = IppMessage::request(OP_GET_NOTIFICATIONS, self.next_request_id())
            .operation_attr(IppAttribute::new(
                "printer-uri",
                IppValue::Uri(format!(
                    "ipp://{}:{}/",
                    self.base.host_str().unwrap_or("localhost"),
                    self.base.port().unwrap_or(631)
                )),
            ))
            .operation_attr(IppAttribute::new(
                "notify-subscription-ids",
                IppValue::Integer(id),
            ))
            .operation_attr(IppAttribute::new(
                "notify-sequence-numbers",
                IppValue::Integer(first_sequence),
            ));

        let response = self.spooler_call(request, None).await?;
        let mut events = Vec::new();
        let mut next_sequence = first_sequence;

        for group in response.groups_of(TAG_EVENT_NOTIFICATION) {
            if let Some(seq) = group
                .attr("notify-sequence-number")
                .and_then(|a| a.first_i32())
            {
                next_sequence = next_sequence.max(seq + 1);
            }
            if let Some(event) = parse_event(group) {
                events.push(event);
            }
        }
        Ok((events, next_sequence))
    }

    fn take_timeout_flag(&self) -> bool {
        self.timeout_flag.swap(false, Ordering::SeqCst)
    }
}

fn parse_event(group: &IppGroup) -> Option<SpoolerEvent> {
    let kind = group
        .attr("notify-subscribed-event")
        .and_then(|a| a.first_str())?;
    let queue = group
        .attr("printer-name")
        .and_then(|a| a.first_str())
        .unwrap_or_default()
        .to_string();

    match kind {
        "printer-state-changed" => {
            let reasons: Vec<String> = group
                .attr("printer-state-reasons")
                .map(|a| a.strings().map(|s| s.to_string()).collect())
                .unwrap_or_default();
            let is_now_default = reasons.iter().any(|r| r == "is-now-default");
            Some(SpoolerEvent::PrinterStateChanged {
                queue,
                is_now_default,
                reasons,
            })
        }
        "printer-modified" | "printer-config-changed" => {
            Some(SpoolerEvent::PrinterModified { queue })
        }
        "printer-deleted" => Some(SpoolerEvent::PrinterDeleted { queue }),
        "job-created" | "job-state-changed" | "job-completed" | "job-stopped" => {
            let job_id = group.attr("notify-job-id").and_then(|a| a.first_i32())?;
            let state = group
                .attr("job-state")
                .and_then(|a| a.first_i32())
                .and_then(JobState::from_ipp)?;
            Some(SpoolerEvent::JobState {
                queue,
                job_id,
                state,
            })
        }
        other => {
            debug!("Ignoring notification event '{other}'");
            None
        }
    }
}

#[async_trait]
impl EndpointRpc for IppSpoolerClient {
    async fn fetch_capabilities(&self, uri: &Url) -> Result<Capabilities, BridgeError> {
        let request = IppMessage::request(OP_GET_PRINTER_ATTRIBUTES, self.next_request_id())
            .operation_attr(IppAttribute::new(
                "printer-uri",
                IppValue::Uri(uri.to_string()),
            ))
            .operation_attr(IppAttribute::with_values(
                "requested-attributes",
                vec![IppValue::Keyword("all".into())],
            ));

        let response = self
            .endpoint_call(uri, request)
            .await
            .map_err(|e| BridgeError::CapabilityFetch(uri.to_string(), e.to_string()))?;
        let group = response.first_group(TAG_PRINTER).ok_or_else(|| {
            BridgeError::CapabilityFetch(uri.to_string(), "no printer group in response".into())
        })?;
        Ok(parse_capabilities(group))
    }

    async fn fetch_state(&self, uri: &Url) -> Result<EndpointState, BridgeError> {
        let request = IppMessage::request(OP_GET_PRINTER_ATTRIBUTES, self.next_request_id())
            .operation_attr(IppAttribute::new(
                "printer-uri",
                IppValue::Uri(uri.to_string()),
            ))
            .operation_attr(IppAttribute::with_values(
                "requested-attributes",
                vec![
                    IppValue::Keyword("printer-state".into()),
                    IppValue::Keyword("printer-is-accepting-jobs".into()),
                    IppValue::Keyword("queued-job-count".into()),
                ],
            ));
        let response = self.endpoint_call(uri, request).await?;
        let group = response
            .first_group(TAG_PRINTER)
            .ok_or_else(|| BridgeError::Protocol("no printer group in response".into()))?;
        Ok(EndpointState {
            state: PrinterState::from_ipp(
                group
                    .attr("printer-state")
                    .and_then(|a| a.first_i32())
                    .unwrap_or(3),
            ),
            accepting_jobs: group
                .attr("printer-is-accepting-jobs")
                .and_then(|a| a.first_bool())
                .unwrap_or(false),
            active_jobs: group
                .attr("queued-job-count")
                .and_then(|a| a.first_i32())
                .unwrap_or(0)
                .max(0) as usize,
        })
    }
}

/// Keyword-list attributes lifted verbatim into [`Capabilities::lists`].
const LIST_ATTRIBUTES: &[(&str, &str)] = &[
    ("media-source-supported", "media-source"),
    ("media-type-supported", "media-type"),
    ("output-bin-supported", "output-bin"),
    ("print-color-mode-supported", "print-color-mode"),
    ("sides-supported", "sides"),
    ("print-content-optimize-supported", "print-content-optimize"),
    ("print-rendering-intent-supported", "print-rendering-intent"),
    ("print-scaling-supported", "print-scaling"),
];

/// Attributes whose `-default` form is captured into string defaults.
const DEFAULT_ATTRIBUTES: &[(&str, &str)] = &[
    ("media-default", "media"),
    ("print-color-mode-default", "print-color-mode"),
    ("output-bin-default", "output-bin"),
    ("sides-default", "sides"),
    ("print-content-optimize-default", "print-content-optimize"),
    ("print-rendering-intent-default", "print-rendering-intent"),
    ("print-scaling-default", "print-scaling"),
];

/// Normalises a printer attribute group into the capability model.
pub fn parse_capabilities(group: &IppGroup) -> Capabilities {
    let mut caps = Capabilities::default();

    if let Some(mm) = group
        .attr("printer-make-and-model")
        .and_then(|a| a.first_str())
    {
        caps.make_model = mm.to_string();
    }
    caps.color = group
        .attr("color-supported")
        .and_then(|a| a.first_bool())
        .unwrap_or(false);
    caps.throughput = group
        .attr("pages-per-minute")
        .and_then(|a| a.first_i32())
        .unwrap_or(0)
        .max(
            group
                .attr("pages-per-minute-color")
                .and_then(|a| a.first_i32())
                .unwrap_or(0),
        );
    if let Some(formats) = group.attr("document-format-supported") {
        caps.pdl = formats.strings().map(|s| s.to_string()).collect();
    }

    for (wire_name, keyword) in LIST_ATTRIBUTES {
        if let Some(attribute) = group.attr(wire_name) {
            let values: std::collections::BTreeSet<String> =
                attribute.strings().map(|s| s.to_string()).collect();
            if !values.is_empty() {
                caps.lists.insert((*keyword).to_string(), values);
            }
        }
    }
    caps.duplex = caps
        .lists
        .get("sides")
        .is_some_and(|s| s.iter().any(|v| v.starts_with("two-sided")));

    if let Some(attribute) = group.attr("printer-resolution-supported") {
        for value in &attribute.values {
            if let IppValue::Resolution { x, y, .. } = value {
                caps.resolutions.insert(Resolution::new(*x, *y));
            }
        }
    }

    if let Some(attribute) = group.attr("media-supported") {
        for name in attribute.strings() {
            if let Some(size) = MediaSize::from_pwg_name(name) {
                caps.media_sizes.insert(size);
            }
        }
    }

    if let Some(attribute) = group.attr("media-size-supported") {
        for value in &attribute.values {
            if let IppValue::Collection(members) = value {
                parse_media_size_entry(&mut caps, members);
            }
        }
    }

    if let Some(attribute) = group.attr("media-col-database") {
        for value in &attribute.values {
            if let IppValue::Collection(members) = value {
                if let Some(entry) = parse_media_col(members) {
                    caps.media_cols.insert(entry);
                }
            }
        }
    }

    if let Some(attribute) = group.attr("finishings-supported") {
        caps.finishings = attribute.integers().collect();
    }
    if let Some(attribute) = group.attr("print-quality-supported") {
        caps.qualities = attribute.integers().collect();
    }
    if let Some(attribute) = group.attr("finishing-template-supported") {
        caps.finishing_templates = attribute.strings().map(|s| s.to_string()).collect();
    }

    for (wire_name, edge) in [
        ("media-bottom-margin-supported", 0usize),
        ("media-left-margin-supported", 1),
        ("media-right-margin-supported", 2),
        ("media-top-margin-supported", 3),
    ] {
        if let Some(attribute) = group.attr(wire_name) {
            let values = attribute.integers();
            match edge {
                0 => caps.margins.bottom.extend(values),
                1 => caps.margins.left.extend(values),
                2 => caps.margins.right.extend(values),
                _ => caps.margins.top.extend(values),
            }
        }
    }

    for (wire_name, keyword) in DEFAULT_ATTRIBUTES {
        if let Some(value) = group.attr(wire_name).and_then(|a| a.first_str()) {
            caps.defaults
                .insert((*keyword).to_string(), value.to_string());
        }
    }
    if let Some(IppValue::Resolution { x, y, .. }) = group
        .attr("printer-resolution-default")
        .and_then(|a| a.values.first())
    {
        caps.defaults.insert(
            "printer-resolution".to_string(),
            Resolution::new(*x, *y).to_dpi_string(),
        );
    }
    if let Some(IppValue::Collection(members)) = group
        .attr("media-col-default")
        .and_then(|a| a.values.first())
    {
        if let Some(entry) = parse_media_col(members) {
            caps.defaults.insert(
                "media-col".to_string(),
                format!("{}/{}", entry.source, entry.media_type),
            );
        }
    }

    caps
}

fn collection_i32(members: &[(String, IppValue)], name: &str) -> Option<i32> {
    members
        .iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, v)| v.as_i32())
}

fn collection_str<'a>(members: &'a [(String, IppValue)], name: &str) -> Option<&'a str> {
    members
        .iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, v)| v.as_str())
}

fn collection_range(members: &[(String, IppValue)], name: &str) -> Option<(i32, i32)> {
    members.iter().find(|(n, _)| n == name).and_then(|(_, v)| {
        if let IppValue::RangeOfInteger { lower, upper } = v {
            Some((*lower, *upper))
        } else {
            v.as_i32().map(|i| (i, i))
        }
    })
}

fn parse_media_size_entry(caps: &mut Capabilities, members: &[(String, IppValue)]) {
    match (
        collection_range(members, "x-dimension"),
        collection_range(members, "y-dimension"),
    ) {
        (Some((x_lo, x_hi)), Some((y_lo, y_hi))) if x_lo != x_hi || y_lo != y_hi => {
            caps.media_ranges.insert(MediaSizeRange {
                min_width: x_lo,
                max_width: x_hi,
                min_length: y_lo,
                max_length: y_hi,
            });
        }
        (Some((x, _)), Some((y, _))) => {
            caps.media_sizes.insert(MediaSize::new(x, y));
        }
        _ => warn!("media-size-supported entry without dimensions"),
    }
}

fn parse_media_col(members: &[(String, IppValue)]) -> Option<MediaColEntry> {
    let size = members.iter().find_map(|(n, v)| {
        if n == "media-size" {
            if let IppValue::Collection(inner) = v {
                return Some(inner.as_slice());
            }
        }
        None
    })?;
    let width = collection_i32(size, "x-dimension")?;
    let length = collection_i32(size, "y-dimension")?;

    Some(MediaColEntry {
        width,
        length,
        bottom_margin: collection_i32(members, "media-bottom-margin").unwrap_or(0),
        left_margin: collection_i32(members, "media-left-margin").unwrap_or(0),
        right_margin: collection_i32(members, "media-right-margin").unwrap_or(0),
        top_margin: collection_i32(members, "media-top-margin").unwrap_or(0),
        source: collection_str(members, "media-source")
            .unwrap_or_default()
            .to_string(),
        media_type: collection_str(members, "media-type")
            .unwrap_or_default()
            .to_string(),
    })
}

