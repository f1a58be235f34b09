// src/core/naming.rs

//! Decides the local queue name for a discovered printer.
//!
//! The resolver is a pure function of the event metadata, the current
//! local-queue snapshot, and the manual cluster table: the same inputs always
//! produce the same name (or the same refusal).

use crate::core::errors::BridgeError;
use crate::core::events::ServiceMeta;
use crate::core::spooler::LocalQueueCache;
use crate::config::{NamingConfig, NamingPolicy};
use tracing::{debug, warn};
use wildmatch::WildMatch;

/// Maximum queue name length accepted by the spooler.
const MAX_QUEUE_NAME_LEN: usize = 127;

/// The outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameResolution {
    pub queue_name: String,
    /// The printer matched a manually declared cluster.
    pub manual_cluster: bool,
}

/// Whether the endpoint sits behind a remote spooler rather than being a
/// directly-attached network printer. Remote spoolers expose their queues
/// under `/printers/` or `/classes/`.
pub fn is_remote_spooler(meta: &ServiceMeta) -> bool {
    meta.legacy || is_remote_spooler_resource(&meta.resource)
}

/// The resource-path half of the remote-spooler test, for callers that only
/// hold the registry record.
pub fn is_remote_spooler_resource(resource: &str) -> bool {
    let resource = resource.strip_prefix('/').unwrap_or(resource);
    resource.starts_with("printers/") || resource.starts_with("classes/")
}

/// Rewrites a string into a spooler-legal queue name fragment: word
/// separators become `separator` one for one, any other character the
/// spooler refuses is dropped, and separators are trimmed from both ends.
fn sanitize_with(input: &str, separator: char) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
            out.push(c);
        } else if c.is_whitespace() || matches!(c, '/' | '\\' | '#') {
            out.push(separator);
        }
        // Everything else is dropped without a separator.
    }
    out.truncate(MAX_QUEUE_NAME_LEN);
    out.trim_matches(|c| c == separator).to_string()
}

/// Spooler-native sanitisation, matching what the spooler itself does when
/// it generates queue names.
pub fn sanitize_queue_name(input: &str) -> String {
    sanitize_with(input, '_')
}

fn sanitize_dashed(input: &str) -> String {
    sanitize_with(input, '-')
}

/// The last path segment of the remote resource.
fn resource_tail(resource: &str) -> &str {
    resource.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// The host-qualified fallback name used when a candidate collides with a
/// queue this daemon does not own. The `@` joins two separately sanitised
/// halves; it never survives sanitisation itself.
pub fn host_qualified(candidate: &str, host: &str) -> String {
    let host = sanitize_queue_name(host);
    if host.is_empty() {
        return String::new();
    }
    let mut name = format!("{candidate}@{host}");
    name.truncate(MAX_QUEUE_NAME_LEN);
    name
}

/// The base candidate under the configured policy, before any collision
/// handling.
fn candidate_base(meta: &ServiceMeta, policy: NamingPolicy) -> String {
    match policy {
        NamingPolicy::ServiceName => {
            let name = if meta.service_name.is_empty() {
                resource_tail(&meta.resource)
            } else {
                &meta.service_name
            };
            sanitize_queue_name(name)
        }
        NamingPolicy::MakeModel => {
            let mm = meta.make_model.as_deref().unwrap_or("");
            let base = if mm.is_empty() {
                &meta.service_name
            } else {
                mm
            };
            sanitize_dashed(base)
        }
        NamingPolicy::ResourceTail => {
            let tail = resource_tail(&meta.resource);
            let base = if tail.is_empty() {
                &meta.service_name
            } else {
                tail
            };
            sanitize_dashed(base)
        }
    }
}

/// Looks the printer up in the manual cluster table. Member patterns are
/// matched against the service name, the make/model string, and the resource
/// tail.
fn manual_cluster_name<'a>(meta: &ServiceMeta, naming: &'a NamingConfig) -> Option<&'a str> {
    let tail = resource_tail(&meta.resource);
    let make_model = meta.make_model.as_deref().unwrap_or("");
    for cluster in &naming.cluster {
        for pattern in &cluster.members {
            let matcher = WildMatch::new(pattern);
            if matcher.matches(&meta.service_name)
                || (!make_model.is_empty() && matcher.matches(make_model))
                || (!tail.is_empty() && matcher.matches(tail))
            {
                return Some(&cluster.name);
            }
        }
    }
    None
}

/// Resolves the local queue name for a discovered printer, or refuses it.
pub fn resolve_queue_name(
    meta: &ServiceMeta,
    naming: &NamingConfig,
    local: &LocalQueueCache,
) -> Result<NameResolution, BridgeError> {
    // Manual clusters take precedence over every policy.
    if let Some(cluster_name) = manual_cluster_name(meta, naming) {
        let queue_name = sanitize_queue_name(cluster_name);
        if queue_name.is_empty() {
            return Err(BridgeError::NameResolution(
                meta.service_name.clone(),
                format!("manual cluster name '{cluster_name}' sanitises to nothing"),
            ));
        }
        debug!(
            "'{}' matches manual cluster '{}'",
            meta.service_name, queue_name
        );
        return Ok(NameResolution {
            queue_name,
            manual_cluster: true,
        });
    }

    let policy = if is_remote_spooler(meta) {
        naming.remote_spooler
    } else {
        naming.network_printer
    };

    let mut candidate = candidate_base(meta, policy);
    if candidate.is_empty() {
        candidate = sanitize_queue_name(&meta.host);
    }
    if candidate.is_empty() {
        return Err(BridgeError::NameResolution(
            meta.service_name.clone(),
            "no usable characters in any name source".to_string(),
        ));
    }

    // A foreign local queue with the same name forces the host-qualified
    // fallback.
    if local.is_foreign(&candidate) {
        let qualified = host_qualified(&candidate, &meta.host);
        if qualified.is_empty() || local.is_foreign(&qualified) {
            return Err(BridgeError::NameResolution(
                meta.service_name.clone(),
                format!("both '{candidate}' and its host-qualified form are taken"),
            ));
        }
        candidate = qualified;
    }

    // With auto-clustering off, a name colliding with a declared cluster
    // would silently join it; refuse the printer instead.
    if !naming.auto_clustering {
        for cluster in &naming.cluster {
            if sanitize_queue_name(&cluster.name).eq_ignore_ascii_case(&candidate) {
                warn!(
                    "Refusing '{}': resolved name '{}' collides with manual cluster '{}'",
                    meta.service_name, candidate, cluster.name
                );
                return Err(BridgeError::NameResolution(
                    meta.service_name.clone(),
                    format!("name collides with manual cluster '{}'", cluster.name),
                ));
            }
        }
    }

    Ok(NameResolution {
        queue_name: candidate,
        manual_cluster: false,
    })
}
