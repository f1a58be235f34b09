// tests/unit_persist_test.rs

mod common;

use common::{fixture, office_caps, resolved_event};
use spoolbridge::core::persist::StateDir;
use spoolbridge::core::reconciler::{creation, removal};
use spoolbridge::core::registry::{Identity, PrinterStatus, intake};
use spoolbridge::core::spooler::SpoolerRpc;
use std::collections::BTreeMap;
use std::time::Instant;

fn identity(name: &str) -> Identity {
    Identity::Service {
        name: name.to_string(),
        domain: "local".to_string(),
    }
}

const QUEUE: &str = "HP_LJ__alpha";

#[tokio::test]
async fn options_written_before_removal_and_restored_on_creation() {
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

    // The user sets a default on the queue after creation.
    fx.spooler
        .set_queue_option(QUEUE, "sides", "two-sided-long-edge")
        .await
        .unwrap();

    // The endpoint disappears and the queue is retired.
    {
        let mut registry = fx.state.registry.write().await;
        let entry = registry.get_mut(&identity("HP LJ @ alpha")).unwrap();
        entry.status = PrinterStatus::Disappeared;
        entry.schedule_now(Instant::now());
    }
    removal::process_removal(&fx.state, &identity("HP LJ @ alpha"), Instant::now()).await;
    assert!(fx.spooler.queue(QUEUE).await.is_none());

    // Everything the daemon wrote is on file, minus its own bookkeeping.
    let recorded = fx.state.state_dir.read_options(QUEUE).await;
    assert_eq!(
        recorded.get("sides").map(|s| s.as_str()),
        Some("two-sided-long-edge")
    );
    assert!(!recorded.contains_key("spoolbridge"));

    // The printer reappears; the new queue carries the recorded defaults.
    intake::handle_discovery_event(
        &fx.state,
        resolved_event("HP LJ @ alpha", "alpha.local", false),
    )
    .await;
    creation::create_or_update(fx.state.clone(), identity("HP LJ @ alpha")).await;

    let queue = fx.spooler.queue(QUEUE).await.unwrap();
    assert_eq!(
        queue.options.get("sides").map(|s| s.as_str()),
        Some("two-sided-long-edge")
    );
    // The restored defaults also land in the descriptor.
    assert!(
        queue
            .descriptor
            .unwrap()
            .contains("*DefaultDuplex: DuplexNoTumble")
    );
}

#[tokio::test]
async fn state_dir_files_survive_restarts() {
    let dir = tempfile::tempdir().unwrap();
    {
        let state = StateDir::new(dir.path());
        state.write_local_default("Workhorse").await.unwrap();
        state.write_remote_default(QUEUE).await.unwrap();
        let mut options = BTreeMap::new();
        options.insert("media".to_string(), "iso_a4_210x297mm".to_string());
        state.write_options(QUEUE, &options).await.unwrap();
    }
    {
        let state = StateDir::new(dir.path());
        assert_eq!(
            state.read_local_default().await.as_deref(),
            Some("Workhorse")
        );
        assert_eq!(state.read_remote_default().await.as_deref(), Some(QUEUE));
        assert_eq!(
            state
                .read_options(QUEUE)
                .await
                .get("media")
                .map(|s| s.as_str()),
            Some("iso_a4_210x297mm")
        );
    }
}

#[tokio::test]
async fn malformed_option_lines_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(
        dir.path().join(format!("options-{QUEUE}")),
        "media=iso_a4_210x297mm\nbroken line\n=nokey\n# comment\n",
    )
    .await
    .unwrap();

    let state = StateDir::new(dir.path());
    let options = state.read_options(QUEUE).await;
    assert_eq!(options.len(), 1);
    assert!(options.contains_key("media"));
}
