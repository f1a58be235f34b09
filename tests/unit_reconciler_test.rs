// tests/unit_reconciler_test.rs

mod common;

use common::{fixture, fixture_with_config, office_caps, resolved_event, with_subscription};
use spoolbridge::config::Config;
use spoolbridge::core::events::DiscoveryEvent;
use spoolbridge::core::reconciler::{creation, removal};
use spoolbridge::core::registry::{Identity, PrinterStatus, intake};
use spoolbridge::core::spooler::SENTINEL_SCHEME;
use std::sync::atomic::Ordering;
use std::time::Instant;

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

#[tokio::test]
async fn single_endpoint_is_created_with_sentinel_uri() {
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

    let queue = fx.spooler.queue("HP_LJ__alpha").await.unwrap();
    let device_uri = queue.info.device_uri.unwrap();
    assert_eq!(device_uri.scheme(), SENTINEL_SCHEME);
    assert!(queue.info.daemon_controlled);
    assert!(queue.descriptor.unwrap().contains("*NickName"));

    let registry = fx.state.registry.read().await;
    let entry = registry.get(&identity("HP LJ @ alpha")).unwrap();
    assert_eq!(entry.status, PrinterStatus::Confirmed);
    assert!(entry.timeout_at.is_none());
    assert!(entry.nickname.is_some());
    assert!(!entry.called);
}

#[tokio::test]
async fn without_notifications_the_real_uri_is_used() {
    let fx = fixture().await;
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

    let queue = fx.spooler.queue("HP_LJ__alpha").await.unwrap();
    assert_eq!(
        queue.info.device_uri.unwrap().as_str(),
        "ipp://alpha.local:631/printers/lj"
    );
}

#[tokio::test]
async fn second_member_re_creates_the_cluster_queue() {
    let fx = fixture().await;
    with_subscription(&fx.state).await;
    fx.endpoints
        .set_capabilities(
            "ipp://alpha.local:631/printers/lj",
            office_caps("Kyocera A", 30),
        )
        .await;
    fx.endpoints
        .set_capabilities(
            "ipp://beta.local:631/printers/lj",
            office_caps("Kyocera B", 10),
        )
        .await;

    intake::handle_discovery_event(&fx.state, cluster_event("Office kyocera A", "alpha.local"))
        .await;
    creation::create_or_update(fx.state.clone(), identity("Office kyocera A")).await;

    intake::handle_discovery_event(&fx.state, cluster_event("Office kyocera B", "beta.local"))
        .await;
    // The join flipped the master back to ToBeCreated.
    {
        let registry = fx.state.registry.read().await;
        assert_eq!(
            registry.get(&identity("Office kyocera A")).unwrap().status,
            PrinterStatus::ToBeCreated
        );
    }
    creation::create_or_update(fx.state.clone(), identity("Office kyocera A")).await;

    let registry = fx.state.registry.read().await;
    let master = registry.get(&identity("Office kyocera A")).unwrap();
    let slave = registry.get(&identity("Office kyocera B")).unwrap();
    assert_eq!(master.status, PrinterStatus::Confirmed);
    assert_eq!(slave.status, PrinterStatus::Confirmed);
    // The faster member provides the merged nickname.
    assert_eq!(master.nickname.as_deref(), Some("Kyocera A"));
}

#[tokio::test]
async fn slave_worker_defers_to_the_master() {
    let fx = fixture().await;
    with_subscription(&fx.state).await;
    fx.endpoints
        .set_capabilities(
            "ipp://alpha.local:631/printers/lj",
            office_caps("Kyocera A", 30),
        )
        .await;
    fx.endpoints
        .set_capabilities(
            "ipp://beta.local:631/printers/lj",
            office_caps("Kyocera B", 10),
        )
        .await;

    intake::handle_discovery_event(&fx.state, cluster_event("Office kyocera A", "alpha.local"))
        .await;
    intake::handle_discovery_event(&fx.state, cluster_event("Office kyocera B", "beta.local"))
        .await;

    creation::create_or_update(fx.state.clone(), identity("Office kyocera B")).await;

    let registry = fx.state.registry.read().await;
    assert_eq!(
        registry.get(&identity("Office kyocera B")).unwrap().status,
        PrinterStatus::Confirmed
    );
    assert_eq!(
        registry.get(&identity("Office kyocera A")).unwrap().status,
        PrinterStatus::ToBeCreated
    );
}

#[tokio::test]
async fn capability_fetch_failure_marks_the_entry_disappeared() {
    let fx = fixture().await;
    // No capabilities registered for the endpoint.
    intake::handle_discovery_event(
        &fx.state,
        resolved_event("HP LJ @ alpha", "alpha.local", false),
    )
    .await;
    creation::create_or_update(fx.state.clone(), identity("HP LJ @ alpha")).await;

    let registry = fx.state.registry.read().await;
    let entry = registry.get(&identity("HP LJ @ alpha")).unwrap();
    assert_eq!(entry.status, PrinterStatus::Disappeared);
    assert!(entry.timeout_at.is_some());
}

#[tokio::test]
async fn repeated_timeouts_abandon_the_entry() {
    let mut config = Config::default();
    config.spooler.retry_max = 2;
    let fx = fixture_with_config(config).await;
    fx.spooler.fail_connect.store(true, Ordering::SeqCst);

    intake::handle_discovery_event(
        &fx.state,
        resolved_event("HP LJ @ alpha", "alpha.local", false),
    )
    .await;

    for _ in 0..2 {
        creation::create_or_update(fx.state.clone(), identity("HP LJ @ alpha")).await;
        let registry = fx.state.registry.read().await;
        assert_eq!(
            registry.get(&identity("HP LJ @ alpha")).unwrap().status,
            PrinterStatus::ToBeCreated
        );
    }

    // The third failure crosses the ceiling.
    creation::create_or_update(fx.state.clone(), identity("HP LJ @ alpha")).await;
    let registry = fx.state.registry.read().await;
    assert_eq!(
        registry.get(&identity("HP LJ @ alpha")).unwrap().status,
        PrinterStatus::Disappeared
    );
}

#[tokio::test]
async fn mid_update_timeout_is_a_partial_success() {
    let fx = fixture().await;
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

    // The flag is raised by some RPC after connect succeeded.
    fx.spooler.raise_timeout_flag();
    creation::create_or_update(fx.state.clone(), identity("HP LJ @ alpha")).await;

    let registry = fx.state.registry.read().await;
    let entry = registry.get(&identity("HP LJ @ alpha")).unwrap();
    assert_eq!(entry.status, PrinterStatus::ToBeCreated);
    assert_eq!(entry.retry_count, 1);
}

#[tokio::test]
async fn removing_a_master_promotes_the_earliest_slave() {
    let fx = fixture().await;
    with_subscription(&fx.state).await;
    fx.endpoints
        .set_capabilities(
            "ipp://alpha.local:631/printers/lj",
            office_caps("Kyocera A", 30),
        )
        .await;
    fx.endpoints
        .set_capabilities(
            "ipp://beta.local:631/printers/lj",
            office_caps("Kyocera B", 10),
        )
        .await;

    intake::handle_discovery_event(&fx.state, cluster_event("Office kyocera A", "alpha.local"))
        .await;
    intake::handle_discovery_event(&fx.state, cluster_event("Office kyocera B", "beta.local"))
        .await;
    creation::create_or_update(fx.state.clone(), identity("Office kyocera A")).await;

    // The master's endpoint goes away.
    {
        let mut registry = fx.state.registry.write().await;
        let entry = registry.get_mut(&identity("Office kyocera A")).unwrap();
        entry.status = PrinterStatus::Disappeared;
        entry.schedule_now(Instant::now());
    }
    removal::process_removal(&fx.state, &identity("Office kyocera A"), Instant::now()).await;

    let registry = fx.state.registry.read().await;
    let promoted = registry.get(&identity("Office kyocera B")).unwrap();
    assert!(promoted.is_master());
    assert_eq!(promoted.status, PrinterStatus::ToBeCreated);
    let demoted = registry.get(&identity("Office kyocera A")).unwrap();
    assert!(demoted.is_slave());
    // The local queue was not deleted during promotion.
    assert!(fx.spooler.deleted.try_lock().unwrap().is_empty());
}

#[tokio::test]
async fn disappeared_singleton_deletes_its_queue() {
    let fx = fixture().await;
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
    assert!(fx.spooler.queue("HP_LJ__alpha").await.is_some());

    {
        let mut registry = fx.state.registry.write().await;
        let entry = registry.get_mut(&identity("HP LJ @ alpha")).unwrap();
        entry.status = PrinterStatus::Disappeared;
        entry.schedule_now(Instant::now());
    }
    removal::process_removal(&fx.state, &identity("HP LJ @ alpha"), Instant::now()).await;

    assert!(fx.spooler.queue("HP_LJ__alpha").await.is_none());
    assert!(fx.state.registry.read().await.is_empty());
}

#[tokio::test]
async fn active_jobs_defer_queue_deletion() {
    let fx = fixture().await;
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

    fx.spooler.active_jobs.lock().await.insert(
        "HP_LJ__alpha".to_string(),
        vec![spoolbridge::core::spooler::JobInfo {
            id: 17,
            state: spoolbridge::core::events::JobState::Processing,
        }],
    );

    {
        let mut registry = fx.state.registry.write().await;
        let entry = registry.get_mut(&identity("HP LJ @ alpha")).unwrap();
        entry.status = PrinterStatus::Disappeared;
        entry.schedule_now(Instant::now());
    }
    removal::process_removal(&fx.state, &identity("HP LJ @ alpha"), Instant::now()).await;

    // The queue is disabled and the entry rescheduled instead of deleted.
    let queue = fx.spooler.queue("HP_LJ__alpha").await.unwrap();
    assert_eq!(
        queue.state,
        spoolbridge::core::spooler::PrinterState::Stopped
    );
    let registry = fx.state.registry.read().await;
    let entry = registry.get(&identity("HP LJ @ alpha")).unwrap();
    assert_eq!(entry.status, PrinterStatus::Disappeared);
    assert!(entry.timeout_at.unwrap() > Instant::now());
}

#[tokio::test]
async fn released_queue_is_left_in_place() {
    let fx = fixture().await;
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

    {
        let mut registry = fx.state.registry.write().await;
        let entry = registry.get_mut(&identity("HP LJ @ alpha")).unwrap();
        entry.status = PrinterStatus::ToBeReleased;
        entry.schedule_now(Instant::now());
    }
    removal::process_removal(&fx.state, &identity("HP LJ @ alpha"), Instant::now()).await;

    assert!(fx.spooler.queue("HP_LJ__alpha").await.is_some());
    assert!(fx.state.registry.read().await.is_empty());
}
