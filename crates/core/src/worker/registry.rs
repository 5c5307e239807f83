//! Registry of encoding workers.
//!
//! Load counters are owned by whoever owns the registry (the orchestrator
//! event loop). Liveness lives in a shared [`LivenessCell`] per worker so
//! heartbeat probes running on other tasks can update it without going
//! through the loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::selection::select_candidate;
use super::types::{HardwareAccel, Liveness, WorkerPreference, WorkerRecord, WorkerSpec};

/// Default number of consecutive missed heartbeats before a worker is
/// considered offline.
pub const DEFAULT_MISS_THRESHOLD: u32 = 3;

/// A change in liveness caused by a heartbeat result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessTransition {
    pub from: Liveness,
    pub to: Liveness,
}

/// Atomically updated liveness state of a single worker.
#[derive(Debug)]
pub struct LivenessCell {
    state: AtomicU8,
    misses: AtomicU32,
    threshold: u32,
}

impl LivenessCell {
    pub fn new(initial: Liveness, threshold: u32) -> Self {
        Self {
            state: AtomicU8::new(initial.to_u8()),
            misses: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    pub fn get(&self) -> Liveness {
        Liveness::from_u8(self.state.load(Ordering::Acquire))
    }

    /// A single successful heartbeat brings the worker back online.
    pub fn record_success(&self) -> Option<LivenessTransition> {
        self.misses.store(0, Ordering::Release);
        let prev = Liveness::from_u8(self.state.swap(Liveness::Online.to_u8(), Ordering::AcqRel));
        (prev != Liveness::Online).then_some(LivenessTransition {
            from: prev,
            to: Liveness::Online,
        })
    }

    /// Count a missed heartbeat; flips to offline once the threshold is hit.
    pub fn record_miss(&self) -> Option<LivenessTransition> {
        let missed = self.misses.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        if missed < self.threshold {
            return None;
        }
        let prev = Liveness::from_u8(self.state.swap(Liveness::Offline.to_u8(), Ordering::AcqRel));
        (prev != Liveness::Offline).then_some(LivenessTransition {
            from: prev,
            to: Liveness::Offline,
        })
    }

    pub fn record(&self, reachable: bool) -> Option<LivenessTransition> {
        if reachable {
            self.record_success()
        } else {
            self.record_miss()
        }
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.misses.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct WorkerEntry {
    spec: WorkerSpec,
    liveness: Arc<LivenessCell>,
    current_load: u32,
    total_jobs: u64,
    succeeded_jobs: u64,
    failed_jobs: u64,
}

impl WorkerEntry {
    fn record(&self) -> WorkerRecord {
        WorkerRecord {
            id: self.spec.id.clone(),
            class: self.spec.class,
            capabilities: self.spec.capabilities.clone(),
            liveness: self.liveness.get(),
            current_load: self.current_load,
            max_concurrent_jobs: self.spec.max_concurrent_jobs,
            total_jobs: self.total_jobs,
            succeeded_jobs: self.succeeded_jobs,
            failed_jobs: self.failed_jobs,
        }
    }
}

/// Known workers, their liveness and load.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, WorkerEntry>,
    miss_threshold: u32,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MISS_THRESHOLD)
    }
}

impl WorkerRegistry {
    pub fn new(miss_threshold: u32) -> Self {
        Self {
            workers: BTreeMap::new(),
            miss_threshold,
        }
    }

    /// Add or replace a worker. Local workers start online; remote workers
    /// stay unknown until their first heartbeat.
    ///
    /// Re-registering an id keeps its load and statistics.
    pub fn register(&mut self, spec: WorkerSpec) -> WorkerRecord {
        let initial = match spec.class {
            super::WorkerClass::Local => Liveness::Online,
            super::WorkerClass::Remote => Liveness::Unknown,
        };

        let entry = match self.workers.remove(&spec.id) {
            Some(mut existing) => {
                existing.spec = spec;
                existing
            }
            None => WorkerEntry {
                liveness: Arc::new(LivenessCell::new(initial, self.miss_threshold)),
                spec,
                current_load: 0,
                total_jobs: 0,
                succeeded_jobs: 0,
                failed_jobs: 0,
            },
        };

        info!(
            worker_id = %entry.spec.id,
            class = %entry.spec.class,
            max_jobs = entry.spec.max_concurrent_jobs,
            "Registered encoding worker"
        );
        let record = entry.record();
        self.workers.insert(record.id.clone(), entry);
        record
    }

    /// Remove a worker. Returns the last snapshot if it was known.
    pub fn deregister(&mut self, id: &str) -> Option<WorkerRecord> {
        let removed = self.workers.remove(id).map(|e| e.record());
        if removed.is_some() {
            info!(worker_id = %id, "Deregistered encoding worker");
        }
        removed
    }

    /// Apply a heartbeat result to a worker.
    pub fn heartbeat(&self, id: &str, reachable: bool) -> Option<LivenessTransition> {
        let entry = self.workers.get(id)?;
        let transition = entry.liveness.record(reachable);
        if let Some(t) = transition {
            info!(worker_id = %id, from = %t.from, to = %t.to, "Worker liveness changed");
        }
        transition
    }

    /// Shared liveness handle used by heartbeat probes.
    pub fn liveness_handle(&self, id: &str) -> Option<Arc<LivenessCell>> {
        self.workers.get(id).map(|e| Arc::clone(&e.liveness))
    }

    /// Select a worker and reserve a slot on it.
    pub fn select(
        &mut self,
        preference: WorkerPreference,
        required: Option<HardwareAccel>,
    ) -> Option<WorkerRecord> {
        let snapshot = self.snapshot();
        let id = select_candidate(&snapshot, preference, required)?.id.clone();
        let entry = self.workers.get_mut(&id)?;
        entry.current_load += 1;
        debug!(
            worker_id = %id,
            load = entry.current_load,
            preference = %preference,
            "Reserved worker slot"
        );
        Some(entry.record())
    }

    /// Release a slot reserved by [`select`](Self::select).
    ///
    /// `succeeded` is `None` when the dispatch was abandoned without a
    /// result (cancellation), which does not count towards statistics.
    pub fn release(&mut self, id: &str, succeeded: Option<bool>) {
        let Some(entry) = self.workers.get_mut(id) else {
            return;
        };
        entry.current_load = entry.current_load.saturating_sub(1);
        if let Some(ok) = succeeded {
            entry.total_jobs += 1;
            if ok {
                entry.succeeded_jobs += 1;
            } else {
                entry.failed_jobs += 1;
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<WorkerRecord> {
        self.workers.get(id).map(|e| e.record())
    }

    /// Snapshot of all workers ordered by id.
    pub fn snapshot(&self) -> Vec<WorkerRecord> {
        self.workers.values().map(|e| e.record()).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
