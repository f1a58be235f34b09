// tests/unit_notifications_test.rs

mod common;

use common::{fixture, office_caps, resolved_event, with_subscription};
use spoolbridge::core::events::SpoolerEvent;
use spoolbridge::core::notifications::{OverwriteProbe, handle_spooler_event, probe_overwrite};
use spoolbridge::core::reconciler::creation;
use spoolbridge::core::registry::{Identity, PrinterStatus, intake};
use spoolbridge::core::spooler::SENTINEL_SCHEME;
use url::Url;

fn identity(name: &str) -> Identity {
    Identity::Service {
        name: name.to_string(),
        domain: "local".to_string(),
    }
}

const QUEUE: &str = "HP_LJ__alpha";

async fn confirmed_fixture() -> common::Fixture {
    let fx = fixture().await;
    with_subscription(&fx.state).await;
    fx.endpoints
        .set_capabilities(
            "ipp://alpha.local:631/printers/lj",
            office_caps("HP LaserJet 600", 30),
        )
        .await;
    intake::handle_discovery_event(
        &fx.state,
        resolved_event("HP LJ @ alpha", "alpha.local", false),
    )
    .await;
    creation::create_or_update(fx.state.clone(), identity("HP LJ @ alpha")).await;
    fx
}

#[tokio::test]
async fn probe_reports_ok_on_untouched_queue() {
    let fx = confirmed_fixture().await;
    assert_eq!(probe_overwrite(&fx.state, QUEUE).await, OverwriteProbe::Ok);
}

#[tokio::test]
async fn probe_detects_a_replaced_device_uri() {
    let fx = confirmed_fixture().await;
    {
        let mut queues = fx.spooler.queues.lock().await;
        let queue = queues.get_mut(&QUEUE.to_lowercase()).unwrap();
        queue.info.device_uri = Some(Url::parse("socket://10.0.0.9:9100").unwrap());
    }
    assert_eq!(
        probe_overwrite(&fx.state, QUEUE).await,
        OverwriteProbe::UriOverwritten
    );
}

#[tokio::test]
async fn probe_detects_a_replaced_descriptor() {
    let fx = confirmed_fixture().await;
    {
        let mut queues = fx.spooler.queues.lock().await;
        let queue = queues.get_mut(&QUEUE.to_lowercase()).unwrap();
        queue.descriptor = Some("*PPD-Adobe: \"4.3\"\n*NickName: \"Vendor Driver\"\n".into());
    }
    assert_eq!(
        probe_overwrite(&fx.state, QUEUE).await,
        OverwriteProbe::DescriptorOverwritten
    );
}

#[tokio::test]
async fn uri_overwrite_renames_and_releases() {
    let fx = confirmed_fixture().await;
    {
        let mut queues = fx.spooler.queues.lock().await;
        let queue = queues.get_mut(&QUEUE.to_lowercase()).unwrap();
        queue.info.device_uri = Some(Url::parse("socket://10.0.0.9:9100").unwrap());
    }

    handle_spooler_event(
        &fx.state,
        SpoolerEvent::PrinterModified {
            queue: QUEUE.to_string(),
        },
    )
    .await;
    // The modify handler probes in a spawned task.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let registry = fx.state.registry.read().await;
    let entry = registry.get(&identity("HP LJ @ alpha")).unwrap();
    assert_eq!(entry.queue_name, format!("{QUEUE}@alpha.local"));
    assert_eq!(entry.status, PrinterStatus::ToBeCreated);
    drop(registry);

    // The user's queue is untouched and no longer counted as ours.
    assert!(fx.spooler.queue(QUEUE).await.is_some());
    assert!(fx.spooler.deleted.lock().await.is_empty());
    assert!(
        !fx.state
            .local_queues
            .read()
            .await
            .get(QUEUE)
            .unwrap()
            .daemon_controlled
    );

    // The recorded options survive under the old name for the new queue to
    // inherit nothing daemon-internal.
    let options = fx.state.state_dir.read_options(QUEUE).await;
    assert!(!options.contains_key("spoolbridge"));
}

#[tokio::test]
async fn external_deletion_schedules_re_creation() {
    let fx = confirmed_fixture().await;
    *fx.state.defaults.lock().await = spoolbridge::core::state::DefaultTracking {
        current: Some(QUEUE.to_string()),
    };

    // The queue vanishes from the spooler.
    fx.spooler.queues.lock().await.clear();
    handle_spooler_event(
        &fx.state,
        SpoolerEvent::PrinterDeleted {
            queue: QUEUE.to_string(),
        },
    )
    .await;

    {
        let registry = fx.state.registry.read().await;
        let entry = registry.get(&identity("HP LJ @ alpha")).unwrap();
        assert_eq!(entry.status, PrinterStatus::ToBeCreated);
        assert!(entry.timeout_at.is_some());
    }

    // After the worker runs, the queue exists again and is default again.
    creation::create_or_update(fx.state.clone(), identity("HP LJ @ alpha")).await;
    let queue = fx.spooler.queue(QUEUE).await.unwrap();
    assert_eq!(
        queue.info.device_uri.as_ref().unwrap().scheme(),
        SENTINEL_SCHEME
    );
    assert_eq!(
        fx.spooler.default_queue.lock().await.as_deref(),
        Some(QUEUE)
    );
}

#[tokio::test]
async fn externally_recreated_queue_is_left_alone() {
    let fx = confirmed_fixture().await;

    // Someone re-created the name as their own queue right after deleting
    // ours.
    {
        let mut queues = fx.spooler.queues.lock().await;
        let queue = queues.get_mut(&QUEUE.to_lowercase()).unwrap();
        queue.info.daemon_controlled = false;
        queue.options.remove("spoolbridge");
    }
    handle_spooler_event(
        &fx.state,
        SpoolerEvent::PrinterDeleted {
            queue: QUEUE.to_string(),
        },
    )
    .await;

    let registry = fx.state.registry.read().await;
    let entry = registry.get(&identity("HP LJ @ alpha")).unwrap();
    assert_eq!(entry.status, PrinterStatus::Confirmed);
}

#[tokio::test]
async fn default_loss_to_a_foreign_queue_is_remembered() {
    let fx = confirmed_fixture().await;
    *fx.state.defaults.lock().await = spoolbridge::core::state::DefaultTracking {
        current: Some(QUEUE.to_string()),
    };

    handle_spooler_event(
        &fx.state,
        SpoolerEvent::PrinterStateChanged {
            queue: "Workhorse".to_string(),
            is_now_default: true,
            reasons: vec!["is-now-default".to_string()],
        },
    )
    .await;

    assert_eq!(
        fx.state.state_dir.read_remote_default().await.as_deref(),
        Some(QUEUE)
    );
    assert_eq!(
        fx.state.defaults.lock().await.current.as_deref(),
        Some("Workhorse")
    );
}

#[tokio::test]
async fn gaining_default_records_the_displaced_local_queue() {
    let fx = confirmed_fixture().await;
    *fx.state.defaults.lock().await = spoolbridge::core::state::DefaultTracking {
        current: Some("Workhorse".to_string()),
    };

    handle_spooler_event(
        &fx.state,
        SpoolerEvent::PrinterStateChanged {
            queue: QUEUE.to_string(),
            is_now_default: true,
            reasons: vec!["is-now-default".to_string()],
        },
    )
    .await;

    assert_eq!(
        fx.state.state_dir.read_local_default().await.as_deref(),
        Some("Workhorse")
    );
}
