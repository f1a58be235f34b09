// src/core/state/stats.rs

//! Job-activity accounting, consumed by the auto-shutdown policy and the
//! metrics endpoint.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct StatsState {
    /// Active jobs on daemon-controlled queues, keyed by job id.
    active_jobs: DashMap<i32, String>,
    /// Last time a job or registry change was observed.
    last_activity: Mutex<Instant>,
    pub jobs_seen: AtomicU64,
    pub queues_created: AtomicU64,
    pub queues_deleted: AtomicU64,
}

impl StatsState {
    pub fn new() -> Self {
        Self {
            active_jobs: DashMap::new(),
            last_activity: Mutex::new(Instant::now()),
            jobs_seen: AtomicU64::new(0),
            queues_created: AtomicU64::new(0),
            queues_deleted: AtomicU64::new(0),
        }
    }

    /// Records a job-state observation and returns whether the job is newly
    /// known.
    pub fn record_job(&self, job_id: i32, queue: &str, active: bool) -> bool {
        self.touch();
        if active {
            let new = self.active_jobs.insert(job_id, queue.to_string()).is_none();
            if new {
                self.jobs_seen.fetch_add(1, Ordering::Relaxed);
            }
            new
        } else {
            self.active_jobs.remove(&job_id);
            false
        }
    }

    /// Drops the accounting for every job on a queue, when the queue goes
    /// away.
    pub fn forget_queue(&self, queue: &str) {
        self.active_jobs.retain(|_, q| q != queue);
    }

    pub fn active_job_count(&self) -> usize {
        self.active_jobs.len()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }
}

impl Default for StatsState {
    fn default() -> Self {
        Self::new()
    }
}
