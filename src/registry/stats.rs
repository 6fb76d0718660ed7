use crate::index::BatchReport;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide sync counters
#[derive(Default)]
pub struct SyncStats {
    events: AtomicU64,
    upserted: AtomicU64,
    deleted: AtomicU64,
    failed: AtomicU64,
    queued: AtomicU64,
    remote_calls: AtomicU64,
    watcher_errors: AtomicU64,
    reindex_runs: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events: u64,
    pub upserted: u64,
    pub deleted: u64,
    pub failed: u64,
    pub queued: u64,
    pub remote_calls: u64,
    pub watcher_errors: u64,
    pub reindex_runs: u64,
}

impl SyncStats {
    pub fn record_events(&self, count: usize) {
        self.events.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_batch(&self, report: &BatchReport) {
        self.upserted
            .fetch_add(report.upserted.len() as u64, Ordering::Relaxed);
        self.deleted
            .fetch_add(report.deleted.len() as u64, Ordering::Relaxed);
        self.failed
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        self.queued.fetch_add(report.queued as u64, Ordering::Relaxed);
        self.remote_calls
            .fetch_add(report.remote_calls as u64, Ordering::Relaxed);
    }

    pub fn record_watcher_error(&self) {
        self.watcher_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reindex(&self, upserted: usize, deleted: usize, failed: usize, remote_calls: usize) {
        self.reindex_runs.fetch_add(1, Ordering::Relaxed);
        self.upserted.fetch_add(upserted as u64, Ordering::Relaxed);
        self.deleted.fetch_add(deleted as u64, Ordering::Relaxed);
        self.failed.fetch_add(failed as u64, Ordering::Relaxed);
        self.remote_calls
            .fetch_add(remote_calls as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            upserted: self.upserted.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            remote_calls: self.remote_calls.load(Ordering::Relaxed),
            watcher_errors: self.watcher_errors.load(Ordering::Relaxed),
            reindex_runs: self.reindex_runs.load(Ordering::Relaxed),
        }
    }
}
