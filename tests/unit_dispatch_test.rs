// tests/unit_dispatch_test.rs

mod common;

use common::{office_caps, resolved_event, with_subscription};
use spoolbridge::config::{Config, LoadBalancingPolicy};
use spoolbridge::core::dispatch::{ALL_DESTS_BUSY, dispatch_job, member_satisfies};
use spoolbridge::core::events::DiscoveryEvent;
use spoolbridge::core::reconciler::creation;
use spoolbridge::core::registry::{Identity, intake};
use spoolbridge::core::spooler::{
    DEST_OPTION, EndpointState, JobRequest, PrinterState,
};

fn identity(name: &str) -> Identity {
    Identity::Service {
        name: name.to_string(),
        domain: "local".to_string(),
    }
}

/// Two distinct services whose metadata resolves to the same queue name.
fn cluster_event(identity_name: &str, host: &str) -> DiscoveryEvent {
    let mut event = resolved_event("Office kyocera", host, false);
    if let DiscoveryEvent::Resolved { identity, meta, .. } = &mut event {
        *identity = Identity::Service {
            name: identity_name.to_string(),
            domain: "local".to_string(),
        };
        meta.service_name = "Office kyocera".to_string();
    }
    event
}

const URI_A: &str = "ipp://alpha.local:631/printers/lj";
const URI_B: &str = "ipp://beta.local:631/printers/lj";
const QUEUE: &str = "Office_kyocera";

async fn cluster_fixture(policy: LoadBalancingPolicy) -> common::Fixture {
    let mut config = Config::default();
    config.queues.load_balancing = policy;
    let fx = common::fixture_with_config(config).await;
    with_subscription(&fx.state).await;

    fx.endpoints
        .set_capabilities(URI_A, office_caps("Kyocera A", 30))
        .await;
    fx.endpoints
        .set_capabilities(URI_B, office_caps("Kyocera B", 10))
        .await;

    intake::handle_discovery_event(&fx.state, cluster_event("Office kyocera A", "alpha.local"))
        .await;
    intake::handle_discovery_event(&fx.state, cluster_event("Office kyocera B", "beta.local"))
        .await;
    creation::create_or_update(fx.state.clone(), identity("Office kyocera A")).await;

    fx
}

fn idle() -> EndpointState {
    EndpointState {
        state: PrinterState::Idle,
        accepting_jobs: true,
        active_jobs: 0,
    }
}

fn processing(active_jobs: usize) -> EndpointState {
    EndpointState {
        state: PrinterState::Processing,
        accepting_jobs: true,
        active_jobs,
    }
}

fn pdf_job() -> JobRequest {
    JobRequest {
        format: Some("application/pdf".to_string()),
        media: Some("iso_a4_210x297mm".to_string()),
        quality: Some(4),
        ..Default::default()
    }
}

async fn published_destination(fx: &common::Fixture) -> String {
    fx.spooler
        .queue(QUEUE)
        .await
        .unwrap()
        .options
        .get(DEST_OPTION)
        .cloned()
        .unwrap()
}

#[tokio::test]
async fn round_robin_alternates_between_idle_members() {
    let fx = cluster_fixture(LoadBalancingPolicy::QueueOnClient).await;
    fx.endpoints.set_state(URI_A, idle()).await;
    fx.endpoints.set_state(URI_B, idle()).await;

    let mut destinations = Vec::new();
    for job_id in 1..=4 {
        fx.spooler
            .job_requests
            .lock()
            .await
            .insert(job_id, pdf_job());
        dispatch_job(&fx.state, QUEUE, job_id).await;
        let value = published_destination(&fx).await;
        let uri = value.split_whitespace().nth(1).unwrap().to_string();
        destinations.push(uri);
    }

    assert_eq!(
        destinations,
        vec![
            URI_A.to_string(),
            URI_B.to_string(),
            URI_A.to_string(),
            URI_B.to_string()
        ]
    );
}

#[tokio::test]
async fn published_value_carries_job_format_and_resolution() {
    let fx = cluster_fixture(LoadBalancingPolicy::QueueOnClient).await;
    fx.endpoints.set_state(URI_A, idle()).await;
    fx.endpoints.set_state(URI_B, idle()).await;
    fx.spooler.job_requests.lock().await.insert(7, pdf_job());

    dispatch_job(&fx.state, QUEUE, 7).await;

    let value = published_destination(&fx).await;
    let parts: Vec<&str> = value.split_whitespace().collect();
    assert_eq!(parts[0], "7");
    assert_eq!(parts[1], URI_A);
    assert_eq!(parts[2], "application/pdf");
    // Normal quality prints at the minimum advertised resolution when no
    // default is published.
    assert_eq!(parts[3], "300dpi");
}

#[tokio::test]
async fn server_side_queueing_picks_the_least_loaded_busy_member() {
    let fx = cluster_fixture(LoadBalancingPolicy::QueueOnServers).await;
    fx.endpoints.set_state(URI_A, processing(2)).await;
    fx.endpoints.set_state(URI_B, processing(3)).await;
    fx.spooler.job_requests.lock().await.insert(9, pdf_job());

    dispatch_job(&fx.state, QUEUE, 9).await;

    let value = published_destination(&fx).await;
    assert_eq!(value.split_whitespace().nth(1), Some(URI_A));
}

#[tokio::test]
async fn client_side_queueing_reports_all_busy() {
    let fx = cluster_fixture(LoadBalancingPolicy::QueueOnClient).await;
    fx.endpoints.set_state(URI_A, processing(2)).await;
    fx.endpoints.set_state(URI_B, processing(3)).await;
    fx.spooler.job_requests.lock().await.insert(9, pdf_job());

    dispatch_job(&fx.state, QUEUE, 9).await;

    let value = published_destination(&fx).await;
    assert_eq!(
        value.split_whitespace().nth(1),
        Some(ALL_DESTS_BUSY)
    );
}

#[tokio::test]
async fn unsatisfiable_job_reports_no_destination() {
    let fx = cluster_fixture(LoadBalancingPolicy::QueueOnClient).await;
    fx.endpoints.set_state(URI_A, idle()).await;
    fx.endpoints.set_state(URI_B, idle()).await;

    let mut job = pdf_job();
    job.format = Some("application/postscript".to_string());
    fx.spooler.job_requests.lock().await.insert(3, job);

    dispatch_job(&fx.state, QUEUE, 3).await;

    let value = published_destination(&fx).await;
    assert_eq!(value.split_whitespace().nth(1), Some("NO_DEST_FOUND"));
}

#[tokio::test]
async fn unknown_job_fails_fast() {
    let fx = cluster_fixture(LoadBalancingPolicy::QueueOnClient).await;
    // No job request registered, as after a daemon restart.
    dispatch_job(&fx.state, QUEUE, 99).await;
    let value = published_destination(&fx).await;
    assert_eq!(value.split_whitespace().nth(1), Some("NO_DEST_FOUND"));
}

#[test]
fn matching_rules_cover_borderless_duplex_and_quality() {
    let caps = office_caps("Kyocera A", 30);

    // Borderless variants are covered by their bordered base size.
    let mut job = JobRequest {
        media: Some("iso_a4_210x297mm.borderless".to_string()),
        ..Default::default()
    };
    assert!(member_satisfies(&caps, &job));

    // Spooler duplex naming maps onto the endpoint's sides keywords.
    job.duplex = Some("DuplexNoTumble".to_string());
    assert!(member_satisfies(&caps, &job));
    job.duplex = Some("DuplexTumble".to_string());
    assert!(!member_satisfies(&caps, &job));
    job.duplex = None;

    // Unsupported quality values exclude the member.
    job.quality = Some(4);
    assert!(member_satisfies(&caps, &job));
    job.quality = Some(9);
    assert!(!member_satisfies(&caps, &job));
}
