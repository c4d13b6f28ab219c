use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::info;

/// Outcome of one analyzed source file.
#[derive(Debug, Clone, Default)]
pub struct FileReport {
    pub records: u64,
    pub invalid: u64,
    /// Matches per policy, in policy order.
    pub matched: Vec<(Arc<str>, u64)>,
    pub elapsed: Duration,
}

impl FileReport {
    pub fn total_matched(&self) -> u64 {
        self.matched.iter().map(|(_, n)| n).sum()
    }

    pub fn qps(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            self.records
        } else {
            (self.records as f64 / secs) as u64
        }
    }
}

/// Process-wide counters shared by all workers.
#[derive(Debug)]
pub struct PipelineStats {
    files: AtomicU64,
    records: AtomicU64,
    invalid: AtomicU64,
    matched: AtomicU64,
    uploads_failed: AtomicU64,
    per_policy: DashMap<Arc<str>, u64>,
    started: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub files: u64,
    pub records: u64,
    pub invalid: u64,
    pub matched: u64,
    pub uploads_failed: u64,
    pub per_policy: Vec<(String, u64)>,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            files: AtomicU64::new(0),
            records: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            matched: AtomicU64::new(0),
            uploads_failed: AtomicU64::new(0),
            per_policy: DashMap::new(),
            started: Instant::now(),
        }
    }

    /// Adds one file; returns the running count of processed files.
    pub fn record_file(&self, report: &FileReport) -> u64 {
        self.records.fetch_add(report.records, Ordering::Relaxed);
        self.invalid.fetch_add(report.invalid, Ordering::Relaxed);
        self.matched
            .fetch_add(report.total_matched(), Ordering::Relaxed);
        for (policy, n) in &report.matched {
            *self.per_policy.entry(policy.clone()).or_insert(0) += n;
        }
        self.files.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_upload_failure(&self) {
        self.uploads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut per_policy: Vec<(String, u64)> = self
            .per_policy
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect();
        per_policy.sort();
        StatsSnapshot {
            files: self.files.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
            per_policy,
        }
    }

    pub fn log_status(&self) {
        let snap = self.snapshot();
        let per_policy = snap
            .per_policy
            .iter()
            .map(|(name, n)| format!("{name}={n}"))
            .collect::<Vec<_>>()
            .join(",");
        info!(
            target = "stats",
            uptime_secs = self.started.elapsed().as_secs(),
            files = snap.files,
            records = snap.records,
            invalid = snap.invalid,
            matched = snap.matched,
            uploads_failed = snap.uploads_failed,
            per_policy = %per_policy,
            "pipeline status"
        );
    }
}
