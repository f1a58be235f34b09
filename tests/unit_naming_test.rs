// tests/unit_naming_test.rs

use spoolbridge::config::{ManualCluster, NamingConfig, NamingPolicy};
use spoolbridge::core::events::ServiceMeta;
use spoolbridge::core::naming::{host_qualified, resolve_queue_name, sanitize_queue_name};
use spoolbridge::core::spooler::{LocalQueueCache, LocalQueueInfo};

fn meta(service_name: &str, host: &str, resource: &str) -> ServiceMeta {
    ServiceMeta {
        service_name: service_name.to_string(),
        service_type: "_ipp._tcp".to_string(),
        domain: "local".to_string(),
        host: host.to_string(),
        port: 631,
        resource: resource.to_string(),
        make_model: Some("HP LaserJet 600".to_string()),
        ..Default::default()
    }
}

fn foreign_queue(name: &str) -> LocalQueueInfo {
    LocalQueueInfo {
        name: name.to_string(),
        device_uri: None,
        uuid: None,
        daemon_controlled: false,
        shared: false,
        temporary: false,
        is_default: false,
    }
}

#[test]
fn service_name_policy_sanitises_like_the_spooler() {
    let resolution = resolve_queue_name(
        &meta("HP LJ @ alpha", "alpha.local", "/printers/lj"),
        &NamingConfig::default(),
        &LocalQueueCache::default(),
    )
    .unwrap();
    assert_eq!(resolution.queue_name, "HP_LJ__alpha");
    assert!(!resolution.manual_cluster);
}

#[test]
fn make_model_policy_uses_dashes() {
    let naming = NamingConfig {
        remote_spooler: NamingPolicy::MakeModel,
        ..Default::default()
    };
    let resolution = resolve_queue_name(
        &meta("whatever", "alpha.local", "/printers/lj"),
        &naming,
        &LocalQueueCache::default(),
    )
    .unwrap();
    assert_eq!(resolution.queue_name, "HP-LaserJet-600");
}

#[test]
fn resource_tail_policy() {
    let naming = NamingConfig {
        remote_spooler: NamingPolicy::ResourceTail,
        ..Default::default()
    };
    let resolution = resolve_queue_name(
        &meta("whatever", "alpha.local", "/printers/lj"),
        &naming,
        &LocalQueueCache::default(),
    )
    .unwrap();
    assert_eq!(resolution.queue_name, "lj");
}

#[test]
fn foreign_collision_falls_back_to_host_qualified_name() {
    let mut cache = LocalQueueCache::default();
    cache.upsert(foreign_queue("Office"));

    let resolution = resolve_queue_name(
        &meta("Office", "beta.local", "/printers/office"),
        &NamingConfig::default(),
        &cache,
    )
    .unwrap();
    assert_eq!(resolution.queue_name, "Office@beta.local");
}

#[test]
fn both_names_taken_is_a_refusal() {
    let mut cache = LocalQueueCache::default();
    cache.upsert(foreign_queue("Office"));
    cache.upsert(foreign_queue("Office@beta.local"));

    let result = resolve_queue_name(
        &meta("Office", "beta.local", "/printers/office"),
        &NamingConfig::default(),
        &cache,
    );
    assert!(result.is_err());
}

#[test]
fn manual_cluster_wins_over_policy() {
    let naming = NamingConfig {
        cluster: vec![ManualCluster {
            name: "lab".to_string(),
            members: vec!["HP *".to_string()],
        }],
        ..Default::default()
    };
    let resolution = resolve_queue_name(
        &meta("HP LJ @ alpha", "alpha.local", "/printers/lj"),
        &naming,
        &LocalQueueCache::default(),
    )
    .unwrap();
    assert_eq!(resolution.queue_name, "lab");
    assert!(resolution.manual_cluster);
}

#[test]
fn cluster_name_collision_without_auto_clustering_is_a_refusal() {
    let naming = NamingConfig {
        auto_clustering: false,
        cluster: vec![ManualCluster {
            name: "lab".to_string(),
            members: vec!["Epson *".to_string()],
        }],
        ..Default::default()
    };
    // The service name resolves to exactly the manual cluster's name, but
    // the printer matches none of the member patterns.
    let result = resolve_queue_name(
        &meta("lab", "alpha.local", "/printers/lab"),
        &naming,
        &LocalQueueCache::default(),
    );
    assert!(result.is_err());
}

#[test]
fn resolver_is_deterministic() {
    let naming = NamingConfig::default();
    let cache = LocalQueueCache::default();
    let m = meta("HP LJ @ alpha", "alpha.local", "/printers/lj");
    let first = resolve_queue_name(&m, &naming, &cache).unwrap();
    for _ in 0..10 {
        assert_eq!(resolve_queue_name(&m, &naming, &cache).unwrap(), first);
    }
}

#[test]
fn sanitisation_drops_what_the_spooler_refuses() {
    assert_eq!(sanitize_queue_name("a/b#c d"), "a_b_c_d");
    assert_eq!(sanitize_queue_name("«фабрика»"), "");
    assert_eq!(host_qualified("Office", "beta.local"), "Office@beta.local");
}
