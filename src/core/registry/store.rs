// src/core/registry/store.rs

//! The in-memory remote-printer registry: an insertion-ordered map of
//! endpoint records with the cluster bookkeeping built on top of it.
//!
//! Slaves refer to their master by identity; the registry resolves the link
//! on lookup, so record ownership stays flat and acyclic.

use super::entry::{Identity, PrinterStatus, RemotePrinter, SlaveLink};
use indexmap::IndexMap;
use std::time::Instant;

#[derive(Debug, Default)]
pub struct Registry {
    entries: IndexMap<Identity, RemotePrinter>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, identity: &Identity) -> Option<&RemotePrinter> {
        self.entries.get(identity)
    }

    pub fn get_mut(&mut self, identity: &Identity) -> Option<&mut RemotePrinter> {
        self.entries.get_mut(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Inserts a new record. Insertion order is the reconciler's walk order.
    pub fn insert(&mut self, entry: RemotePrinter) {
        self.entries.insert(entry.identity.clone(), entry);
    }

    /// Removes a record outright. Callers are responsible for having
    /// re-pointed any slaves first (see [`Registry::detach_master`]).
    pub fn remove(&mut self, identity: &Identity) -> Option<RemotePrinter> {
        self.entries.shift_remove(identity)
    }

    /// Iterates records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &RemotePrinter> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RemotePrinter> {
        self.entries.values_mut()
    }

    /// Identities in insertion order; the reconciler snapshots these so it
    /// can mutate records while walking.
    pub fn identities(&self) -> Vec<Identity> {
        self.entries.keys().cloned().collect()
    }

    /// The master entry for a queue name: the single non-slave record with
    /// that name whose status still allows mastership.
    pub fn master_of(&self, queue_name: &str) -> Option<&RemotePrinter> {
        self.entries.values().find(|e| {
            e.queue_name == queue_name && e.is_master() && !e.status.is_terminal()
        })
    }

    pub fn master_identity(&self, queue_name: &str) -> Option<Identity> {
        self.master_of(queue_name).map(|e| e.identity.clone())
    }

    /// All records sharing a queue name, in insertion order.
    pub fn cluster_members(&self, queue_name: &str) -> Vec<&RemotePrinter> {
        self.entries
            .values()
            .filter(|e| e.queue_name == queue_name)
            .collect()
    }

    /// Cluster members eligible for capability merging and job dispatch.
    pub fn active_members(&self, queue_name: &str) -> Vec<&RemotePrinter> {
        self.entries
            .values()
            .filter(|e| {
                e.queue_name == queue_name
                    && matches!(
                        e.status,
                        PrinterStatus::Confirmed | PrinterStatus::ToBeCreated
                    )
            })
            .collect()
    }

    /// The identities of live slaves of the given master, in insertion order.
    pub fn live_slaves(&self, master: &Identity) -> Vec<Identity> {
        self.entries
            .values()
            .filter(|e| {
                matches!(&e.slave_of, Some(SlaveLink::Master(m)) if m == master)
                    && !e.status.is_terminal()
            })
            .map(|e| e.identity.clone())
            .collect()
    }

    /// Re-points every slave of `master` at the deleted-master sentinel, so
    /// the master record can be mutated or removed safely.
    pub fn detach_master(&mut self, master: &Identity) {
        for entry in self.entries.values_mut() {
            if matches!(&entry.slave_of, Some(SlaveLink::Master(m)) if m == master) {
                entry.slave_of = Some(SlaveLink::DeletedMaster);
            }
        }
    }

    /// Re-points every sentinel-linked slave with the given queue name at a
    /// freshly promoted master.
    pub fn adopt_orphans(&mut self, queue_name: &str, new_master: &Identity) {
        for entry in self.entries.values_mut() {
            if entry.queue_name == queue_name
                && entry.identity != *new_master
                && matches!(entry.slave_of, Some(SlaveLink::DeletedMaster))
            {
                entry.slave_of = Some(SlaveLink::Master(new_master.clone()));
            }
        }
    }

    /// The earliest pending deadline across all records, for timer
    /// rescheduling.
    pub fn earliest_timeout(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.timeout_at).min()
    }

    /// Counts records per status, for metrics and the auto-shutdown policy.
    pub fn status_counts(&self) -> [(PrinterStatus, usize); 5] {
        let mut counts = [
            (PrinterStatus::Unconfirmed, 0),
            (PrinterStatus::Confirmed, 0),
            (PrinterStatus::ToBeCreated, 0),
            (PrinterStatus::ToBeReleased, 0),
            (PrinterStatus::Disappeared, 0),
        ];
        for entry in self.entries.values() {
            for slot in counts.iter_mut() {
                if slot.0 == entry.status {
                    slot.1 += 1;
                }
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn entry(name: &str, queue: &str) -> RemotePrinter {
        RemotePrinter::new(
            Identity::Service {
                name: name.to_string(),
                domain: "local".to_string(),
            },
            queue.to_string(),
            Url::parse("ipp://host.local:631/ipp/print").unwrap(),
        )
    }

    #[test]
    fn master_lookup_skips_terminal_entries() {
        let mut registry = Registry::new();
        let mut old = entry("old", "queue");
        old.status = PrinterStatus::Disappeared;
        registry.insert(old);
        registry.insert(entry("new", "queue"));

        let master = registry.master_of("queue").unwrap();
        assert_eq!(
            master.identity,
            Identity::Service {
                name: "new".into(),
                domain: "local".into()
            }
        );
    }

    #[test]
    fn detach_and_adopt_re_point_slaves() {
        let mut registry = Registry::new();
        let master = entry("master", "queue");
        let master_id = master.identity.clone();
        registry.insert(master);

        for name in ["slave1", "slave2"] {
            let mut slave = entry(name, "queue");
            slave.slave_of = Some(SlaveLink::Master(master_id.clone()));
            registry.insert(slave);
        }
        let slave1_id = Identity::Service {
            name: "slave1".into(),
            domain: "local".into(),
        };
        let slave2_id = Identity::Service {
            name: "slave2".into(),
            domain: "local".into(),
        };

        registry.detach_master(&master_id);
        assert_eq!(
            registry.get(&slave1_id).unwrap().slave_of,
            Some(SlaveLink::DeletedMaster)
        );

        // Promote slave1, then hand it the remaining orphans.
        registry.get_mut(&slave1_id).unwrap().slave_of = None;
        registry.adopt_orphans("queue", &slave1_id);
        assert!(registry.get(&slave1_id).unwrap().is_master());
        assert_eq!(
            registry.get(&slave2_id).unwrap().slave_of,
            Some(SlaveLink::Master(slave1_id))
        );
    }
}
