//! Metrics and observability for marketsync.

use std::sync::atomic::{AtomicU64, Ordering};

use std::time::Instant;

/// Metrics collector for sync runs.
///
/// Counters also feed the `metrics` facade, so an exporter installed by the
/// embedding application picks them up without extra wiring.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Entity runs attempted
    pub entity_runs_total: AtomicU64,
    /// Entity runs that finished without a fatal error
    pub entity_runs_success: AtomicU64,
    /// Entity runs aborted by a fatal error
    pub entity_runs_failed: AtomicU64,
    /// Pages fetched
    pub pages_fetched: AtomicU64,
    /// Pages that failed and were not retried
    pub page_failures: AtomicU64,
    /// Waits taken on 429 responses
    pub rate_limit_waits: AtomicU64,
    /// Raw documents that passed validation
    pub documents_validated: AtomicU64,
    /// Raw documents rejected by validation or normalization
    pub documents_rejected: AtomicU64,
    /// Warehouse rows created
    pub records_created: AtomicU64,
    /// Warehouse rows updated
    pub records_updated: AtomicU64,
    /// Records whose uniqueness predicate matched multiple rows
    pub duplicates_detected: AtomicU64,
    /// Records skipped because the write failed
    pub records_skipped: AtomicU64,
    /// Warehouse connection retries
    pub retries: AtomicU64,
    /// Total entity run duration in milliseconds
    pub run_duration_ms: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished entity run.
    pub fn record_entity_run(&self, success: bool, duration_ms: u64) {
        self.entity_runs_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.entity_runs_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.entity_runs_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.run_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        metrics::counter!("marketsync_entity_runs_total").increment(1);
    }

    /// Record a fetched page.
    pub fn record_page(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("marketsync_pages_fetched_total").increment(1);
    }

    /// Record a failed page.
    pub fn record_page_failure(&self) {
        self.page_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("marketsync_page_failures_total").increment(1);
    }

    /// Record rate-limit waits.
    pub fn record_rate_limit_waits(&self, waits: u64) {
        self.rate_limit_waits.fetch_add(waits, Ordering::Relaxed);
        metrics::counter!("marketsync_rate_limit_waits_total").increment(waits);
    }

    /// Record a document validation outcome.
    pub fn record_document(&self, accepted: bool) {
        if accepted {
            self.documents_validated.fetch_add(1, Ordering::Relaxed);
        } else {
            self.documents_rejected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("marketsync_documents_rejected_total").increment(1);
        }
    }

    /// Record a created row.
    pub fn record_created(&self) {
        self.records_created.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("marketsync_records_created_total").increment(1);
    }

    /// Record an updated row.
    pub fn record_updated(&self) {
        self.records_updated.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("marketsync_records_updated_total").increment(1);
    }

    /// Record a duplicate-key write.
    pub fn record_duplicate(&self) {
        self.duplicates_detected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("marketsync_duplicates_detected_total").increment(1);
    }

    /// Record a skipped record.
    pub fn record_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("marketsync_records_skipped_total").increment(1);
    }

    /// Record a retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entity_runs_total: self.entity_runs_total.load(Ordering::Relaxed),
            entity_runs_success: self.entity_runs_success.load(Ordering::Relaxed),
            entity_runs_failed: self.entity_runs_failed.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            page_failures: self.page_failures.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            documents_validated: self.documents_validated.load(Ordering::Relaxed),
            documents_rejected: self.documents_rejected.load(Ordering::Relaxed),
            records_created: self.records_created.load(Ordering::Relaxed),
            records_updated: self.records_updated.load(Ordering::Relaxed),
            duplicates_detected: self.duplicates_detected.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            run_duration_ms: self.run_duration_ms.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        self.entity_runs_total.store(0, Ordering::Relaxed);
        self.entity_runs_success.store(0, Ordering::Relaxed);
        self.entity_runs_failed.store(0, Ordering::Relaxed);
        self.pages_fetched.store(0, Ordering::Relaxed);
        self.page_failures.store(0, Ordering::Relaxed);
        self.rate_limit_waits.store(0, Ordering::Relaxed);
        self.documents_validated.store(0, Ordering::Relaxed);
        self.documents_rejected.store(0, Ordering::Relaxed);
        self.records_created.store(0, Ordering::Relaxed);
        self.records_updated.store(0, Ordering::Relaxed);
        self.duplicates_detected.store(0, Ordering::Relaxed);
        self.records_skipped.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.run_duration_ms.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Entity runs attempted
    pub entity_runs_total: u64,
    /// Entity runs that finished without a fatal error
    pub entity_runs_success: u64,
    /// Entity runs aborted by a fatal error
    pub entity_runs_failed: u64,
    /// Pages fetched
    pub pages_fetched: u64,
    /// Pages that failed and were not retried
    pub page_failures: u64,
    /// Waits taken on 429 responses
    pub rate_limit_waits: u64,
    /// Raw documents that passed validation
    pub documents_validated: u64,
    /// Raw documents rejected
    pub documents_rejected: u64,
    /// Warehouse rows created
    pub records_created: u64,
    /// Warehouse rows updated
    pub records_updated: u64,
    /// Records whose uniqueness predicate matched multiple rows
    pub duplicates_detected: u64,
    /// Records skipped
    pub records_skipped: u64,
    /// Warehouse connection retries
    pub retries: u64,
    /// Total entity run duration in milliseconds
    pub run_duration_ms: u64,
}

impl MetricsSnapshot {
    /// Rows written (created + updated, duplicates included).
    pub fn records_written(&self) -> u64 {
        self.records_created + self.records_updated + self.duplicates_detected
    }

    /// Fraction of fetched documents that were rejected.
    pub fn rejection_rate(&self) -> f64 {
        let total = self.documents_validated + self.documents_rejected;
        if total == 0 {
            0.0
        } else {
            self.documents_rejected as f64 / total as f64
        }
    }

    /// Calculate records per second.
    pub fn records_per_second(&self) -> f64 {
        if self.run_duration_ms == 0 {
            0.0
        } else {
            (self.records_written() as f64 * 1000.0) / self.run_duration_ms as f64
        }
    }
}

/// Timer for measuring operation duration.
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    /// Start a new timer.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop timer and log duration.
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
        elapsed
    }
}
