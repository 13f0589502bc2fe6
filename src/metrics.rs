use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lock manager counters. Clones share the same counters.
#[derive(Debug, Clone)]
pub struct LockdMetrics {
    // Dispatch
    pub calls_dispatched: Arc<AtomicU64>,
    pub calls_dropped: Arc<AtomicU64>,
    pub retransmits: Arc<AtomicU64>,
    pub partial_overlaps: Arc<AtomicU64>,

    // Blocking path
    pub blocks_registered: Arc<AtomicU64>,
    pub blocks_waited: Arc<AtomicU64>,
    pub blocks_failed: Arc<AtomicU64>,

    // Granted callbacks
    pub grants_sent: Arc<AtomicU64>,
    pub grants_retried: Arc<AtomicU64>,
    pub grants_acknowledged: Arc<AtomicU64>,
    pub grants_suppressed: Arc<AtomicU64>,
    pub grants_abandoned: Arc<AtomicU64>,

    // File table
    pub files_reclaimed: Arc<AtomicU64>,
}

impl LockdMetrics {
    pub fn new() -> Self {
        LockdMetrics {
            calls_dispatched: Arc::new(AtomicU64::new(0)),
            calls_dropped: Arc::new(AtomicU64::new(0)),
            retransmits: Arc::new(AtomicU64::new(0)),
            partial_overlaps: Arc::new(AtomicU64::new(0)),

            blocks_registered: Arc::new(AtomicU64::new(0)),
            blocks_waited: Arc::new(AtomicU64::new(0)),
            blocks_failed: Arc::new(AtomicU64::new(0)),

            grants_sent: Arc::new(AtomicU64::new(0)),
            grants_retried: Arc::new(AtomicU64::new(0)),
            grants_acknowledged: Arc::new(AtomicU64::new(0)),
            grants_suppressed: Arc::new(AtomicU64::new(0)),
            grants_abandoned: Arc::new(AtomicU64::new(0)),

            files_reclaimed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_dispatch(&self) {
        self.calls_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.calls_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial_overlap(&self) {
        self.partial_overlaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_registered(&self) {
        self.blocks_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_waited(&self) {
        self.blocks_waited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_failed(&self) {
        self.blocks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grant_sent(&self, attempt: u32) {
        self.grants_sent.fetch_add(1, Ordering::Relaxed);
        if attempt > 0 {
            self.grants_retried.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_grant_acknowledged(&self) {
        self.grants_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grant_suppressed(&self) {
        self.grants_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grant_abandoned(&self) {
        self.grants_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_reclaimed(&self) {
        self.files_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            calls_dispatched: self.calls_dispatched.load(Ordering::Relaxed),
            calls_dropped: self.calls_dropped.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            partial_overlaps: self.partial_overlaps.load(Ordering::Relaxed),
            blocks_registered: self.blocks_registered.load(Ordering::Relaxed),
            blocks_waited: self.blocks_waited.load(Ordering::Relaxed),
            blocks_failed: self.blocks_failed.load(Ordering::Relaxed),
            grants_sent: self.grants_sent.load(Ordering::Relaxed),
            grants_retried: self.grants_retried.load(Ordering::Relaxed),
            grants_acknowledged: self.grants_acknowledged.load(Ordering::Relaxed),
            grants_suppressed: self.grants_suppressed.load(Ordering::Relaxed),
            grants_abandoned: self.grants_abandoned.load(Ordering::Relaxed),
            files_reclaimed: self.files_reclaimed.load(Ordering::Relaxed),
        }
    }
}

impl Default for LockdMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub calls_dispatched: u64,
    pub calls_dropped: u64,
    pub retransmits: u64,
    pub partial_overlaps: u64,
    pub blocks_registered: u64,
    pub blocks_waited: u64,
    pub blocks_failed: u64,
    pub grants_sent: u64,
    pub grants_retried: u64,
    pub grants_acknowledged: u64,
    pub grants_suppressed: u64,
    pub grants_abandoned: u64,
    pub files_reclaimed: u64,
}

impl MetricsSnapshot {
    /// Share of callbacks that needed more than one attempt.
    pub fn grant_retry_rate(&self) -> f64 {
        if self.grants_sent == 0 {
            0.0
        } else {
            100.0 * self.grants_retried as f64 / self.grants_sent as f64
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            r#"Metrics Snapshot:
  Calls:
    Dispatched: {}
    Dropped:    {}
    Retransmits: {}
    Partial overlaps: {}
  Blocking locks:
    Registered: {}
    Waited:     {}
    Failed:     {}
  Granted callbacks:
    Sent:         {} (retry rate: {:.1}%)
    Acknowledged: {}
    Suppressed:   {}
    Abandoned:    {}
  Files reclaimed: {}
"#,
            self.calls_dispatched,
            self.calls_dropped,
            self.retransmits,
            self.partial_overlaps,
            self.blocks_registered,
            self.blocks_waited,
            self.blocks_failed,
            self.grants_sent,
            self.grant_retry_rate(),
            self.grants_acknowledged,
            self.grants_suppressed,
            self.grants_abandoned,
            self.files_reclaimed,
        )
    }
}
