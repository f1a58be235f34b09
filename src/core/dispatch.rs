// src/core/dispatch.rs

//! The job dispatcher: when the spooler starts processing a job on a
//! sentinel-routed queue, pick one cluster member and publish the choice for
//! the cooperating backend.

use crate::config::LoadBalancingPolicy;
use crate::core::capabilities::{Capabilities, QUALITY_DRAFT, QUALITY_HIGH, Resolution};
use crate::core::metrics;
use crate::core::registry::{Identity, PrinterStatus};
use crate::core::spooler::{DEST_OPTION, JobRequest, PrinterState};
use crate::core::state::BridgeState;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Published when every member is busy under client-side queueing; the
/// cooperating backend retries.
pub const ALL_DESTS_BUSY: &str = "ALL_DESTS_BUSY";

/// Published when no member satisfies the job at all; the backend surfaces
/// the job-level failure.
pub const NO_DEST_FOUND: &str = "NO_DEST_FOUND";

/// Resolution published when an endpoint advertises none.
const FALLBACK_RESOLUTION: Resolution = Resolution { x: 300, y: 300 };

/// The destination decision, as published on the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched { uri: Url },
    AllBusy,
    NoDestination,
}

struct Candidate {
    identity: Identity,
    uri: Url,
    caps: Capabilities,
}

/// Handles one `job-processing` event on a clustered queue end to end:
/// member selection, per-job option publication, and cursor update.
pub async fn dispatch_job(state: &Arc<BridgeState>, queue_name: &str, job_id: i32) {
    let policy = state.config.lock().await.queues.load_balancing;

    let request = match state.spooler.fetch_job_request(queue_name, job_id).await {
        Ok(request) => request,
        Err(e) => {
            // A job this daemon cannot inspect (typically one already
            // processing across a restart) fails fast rather than wedging
            // the queue.
            warn!("Cannot read job {job_id} on '{queue_name}': {e}");
            publish(state, queue_name, job_id, NO_DEST_FOUND, "", "").await;
            metrics::DISPATCHES_TOTAL
                .with_label_values(&["no_destination"])
                .inc();
            return;
        }
    };

    let snapshot = {
        let registry = state.registry.read().await;
        registry.master_of(queue_name).map(|master| {
            let members: Vec<Candidate> = registry
                .cluster_members(queue_name)
                .into_iter()
                .filter(|m| m.status == PrinterStatus::Confirmed)
                .filter_map(|m| {
                    m.capabilities.as_ref().map(|caps| Candidate {
                        identity: m.identity.clone(),
                        uri: m.uri.clone(),
                        caps: caps.clone(),
                    })
                })
                .collect();
            (
                master.identity.clone(),
                master.last_destination_index,
                members,
            )
        })
    };
    let Some((master_id, start_index, members)) = snapshot else {
        warn!("Dispatch for unknown cluster '{queue_name}'");
        publish(state, queue_name, job_id, NO_DEST_FOUND, "", "").await;
        metrics::DISPATCHES_TOTAL
            .with_label_values(&["no_destination"])
            .inc();
        return;
    };

    let outcome = select_destination(state, &request, start_index, &members, policy).await;

    match &outcome {
        DispatchOutcome::Dispatched { uri } => {
            let chosen = members
                .iter()
                .find(|c| c.uri == *uri)
                .expect("selected uri comes from members");
            let format = chosen_format(&chosen.caps, &request);
            let resolution = chosen_resolution(&chosen.caps, &request);
            publish(
                state,
                queue_name,
                job_id,
                uri.as_str(),
                &format,
                &resolution.to_dpi_string(),
            )
            .await;

            // Advance the round-robin cursor past the member that took the
            // job; the cursor always names the next member to try first.
            let position = members.iter().position(|c| c.uri == *uri);
            if let Some(position) = position {
                let mut registry = state.registry.write().await;
                if let Some(master) = registry.get_mut(&master_id) {
                    master.last_destination_index = (position + 1) % members.len();
                }
            }
            info!(
                "Job {job_id} on '{queue_name}' dispatched to {} ({format})",
                chosen.identity
            );
            metrics::DISPATCHES_TOTAL
                .with_label_values(&["dispatched"])
                .inc();
        }
        DispatchOutcome::AllBusy => {
            info!("Job {job_id} on '{queue_name}': all destinations busy");
            publish(state, queue_name, job_id, ALL_DESTS_BUSY, "", "").await;
            metrics::DISPATCHES_TOTAL
                .with_label_values(&["all_busy"])
                .inc();
        }
        DispatchOutcome::NoDestination => {
            info!("Job {job_id} on '{queue_name}': no destination satisfies it");
            publish(state, queue_name, job_id, NO_DEST_FOUND, "", "").await;
            metrics::DISPATCHES_TOTAL
                .with_label_values(&["no_destination"])
                .inc();
        }
    }
}

/// Walks the members round-robin from the cursor and applies the queueing
/// policy.
async fn select_destination(
    state: &Arc<BridgeState>,
    request: &JobRequest,
    start_index: usize,
    members: &[Candidate],
    policy: LoadBalancingPolicy,
) -> DispatchOutcome {
    if members.is_empty() {
        return DispatchOutcome::NoDestination;
    }

    let n = members.len();
    let mut any_capable = false;
    // Best busy member under server-side queueing: fewest active jobs wins.
    let mut best_busy: Option<(usize, &Candidate)> = None;

    for step in 0..n {
        let candidate = &members[(start_index + step) % n];
        if !member_satisfies(&candidate.caps, request) {
            debug!("'{}' cannot satisfy the job options", candidate.identity);
            continue;
        }
        any_capable = true;

        let live = match state.endpoints.fetch_state(&candidate.uri).await {
            Ok(live) => live,
            Err(e) => {
                debug!("State fetch for '{}' failed: {e}", candidate.identity);
                continue;
            }
        };
        if !live.accepting_jobs {
            continue;
        }

        match live.state {
            PrinterState::Idle => {
                return DispatchOutcome::Dispatched {
                    uri: candidate.uri.clone(),
                };
            }
            PrinterState::Processing => {
                if policy == LoadBalancingPolicy::QueueOnServers {
                    let better = match best_busy {
                        Some((best_jobs, _)) => live.active_jobs < best_jobs,
                        None => true,
                    };
                    if better {
                        best_busy = Some((live.active_jobs, candidate));
                    }
                }
            }
            PrinterState::Stopped => {}
        }
    }

    if let Some((_, candidate)) = best_busy {
        return DispatchOutcome::Dispatched {
            uri: candidate.uri.clone(),
        };
    }
    if any_capable {
        DispatchOutcome::AllBusy
    } else {
        DispatchOutcome::NoDestination
    }
}

/// Whether a member's capability set satisfies the requested job options.
pub fn member_satisfies(caps: &Capabilities, request: &JobRequest) -> bool {
    if let Some(format) = &request.format {
        if !caps.accepts_format(format) {
            return false;
        }
    }

    if let Some(media) = &request.media {
        if !caps.supports_page_size(media) {
            return false;
        }
    }

    // The spooler names duplex by descriptor choice; endpoints speak sides
    // keywords.
    let sides_wanted = request
        .sides
        .clone()
        .or_else(|| request.duplex.as_deref().map(duplex_to_sides));
    if let Some(sides) = sides_wanted {
        if sides.starts_with("two-sided") {
            let supported = caps.supported_values("sides");
            if !supported.contains(&sides) {
                return false;
            }
        }
    }

    if let Some(color_mode) = &request.color_mode {
        if color_mode == "color" && !caps.color {
            return false;
        }
    }

    if let Some(media_type) = &request.media_type {
        let supported = caps.supported_values("media-type");
        if !supported.is_empty() && !supported.contains(media_type) {
            return false;
        }
    }

    for finishing in &request.finishings {
        // 3 is the "none" finishing; everything requests it implicitly.
        if *finishing != 3 && !caps.finishings.contains(finishing) {
            return false;
        }
    }

    if let Some(quality) = request.quality {
        if !caps.qualities.is_empty() && !caps.qualities.contains(&quality) {
            return false;
        }
    }

    true
}

/// Maps the spooler's duplex choice names onto IPP sides keywords.
pub fn duplex_to_sides(duplex: &str) -> String {
    match duplex {
        "DuplexNoTumble" => "two-sided-long-edge".to_string(),
        "DuplexTumble" => "two-sided-short-edge".to_string(),
        _ => "one-sided".to_string(),
    }
}

/// The format actually sent: the requested one when the member accepts it,
/// the member's preferred format otherwise.
fn chosen_format(caps: &Capabilities, request: &JobRequest) -> String {
    if let Some(format) = &request.format {
        if caps.accepts_format(format) {
            return format.clone();
        }
    }
    caps.pdl
        .first()
        .cloned()
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

/// Draft jobs run at the minimum supported resolution, high-quality jobs at
/// the maximum, everything else at the endpoint default.
fn chosen_resolution(caps: &Capabilities, request: &JobRequest) -> Resolution {
    match request.quality {
        Some(QUALITY_DRAFT) => caps.min_resolution(),
        Some(QUALITY_HIGH) => caps.max_resolution(),
        _ => caps.default_resolution().or_else(|| caps.min_resolution()),
    }
    .unwrap_or(FALLBACK_RESOLUTION)
}

/// Publishes the per-job destination option the cooperating backend reads.
async fn publish(
    state: &Arc<BridgeState>,
    queue_name: &str,
    job_id: i32,
    destination: &str,
    format: &str,
    resolution: &str,
) {
    let value = format!("{job_id} {destination} {format} {resolution}")
        .trim_end()
        .to_string();
    if let Err(e) = state
        .spooler
        .set_queue_option(queue_name, DEST_OPTION, &value)
        .await
    {
        warn!("Publishing destination for job {job_id} on '{queue_name}' failed: {e}");
    }
}
