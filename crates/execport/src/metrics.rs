//! Process-wide export counters.
//!
//! Lock-free atomics, read via [`Metrics::snapshot`] or rendered in the
//! Prometheus text format.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // Job lifecycle
    pub jobs_claimed: AtomicU64,
    pub jobs_ready: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_retried: AtomicU64,
    pub jobs_expired: AtomicU64,
    pub jobs_skipped: AtomicU64,

    // Throughput
    pub batches_processed: AtomicU64,
    pub executions_exported: AtomicU64,

    // Degradation
    pub stage_failures: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub uploads_rolled_back: AtomicU64,
    pub claim_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counters {
    ($($inc:ident => $field:ident),* $(,)?) => {
        impl Metrics {
            $(
                #[inline]
                pub fn $inc(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counters! {
    inc_jobs_claimed => jobs_claimed,
    inc_jobs_ready => jobs_ready,
    inc_jobs_failed => jobs_failed,
    inc_jobs_retried => jobs_retried,
    inc_jobs_expired => jobs_expired,
    inc_jobs_skipped => jobs_skipped,
    inc_batches_processed => batches_processed,
    inc_stage_failures => stage_failures,
    inc_notifications_sent => notifications_sent,
    inc_notifications_failed => notifications_failed,
    inc_uploads_rolled_back => uploads_rolled_back,
    inc_claim_errors => claim_errors,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_claimed: AtomicU64::new(0),
            jobs_ready: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_expired: AtomicU64::new(0),
            jobs_skipped: AtomicU64::new(0),
            batches_processed: AtomicU64::new(0),
            executions_exported: AtomicU64::new(0),
            stage_failures: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            uploads_rolled_back: AtomicU64::new(0),
            claim_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn add_executions_exported(&self, count: u64) {
        self.executions_exported.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_claimed: self.jobs_claimed.load(Ordering::Relaxed),
            jobs_ready: self.jobs_ready.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_expired: self.jobs_expired.load(Ordering::Relaxed),
            jobs_skipped: self.jobs_skipped.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            executions_exported: self.executions_exported.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            uploads_rolled_back: self.uploads_rolled_back.load(Ordering::Relaxed),
            claim_errors: self.claim_errors.load(Ordering::Relaxed),
        }
    }

    /// Format as Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        let counters: [(&str, &str, u64); 13] = [
            ("jobs_claimed", "Export and cleanup jobs claimed", s.jobs_claimed),
            ("jobs_ready", "Exports completed and uploaded", s.jobs_ready),
            ("jobs_failed", "Exports marked FAILED", s.jobs_failed),
            ("jobs_retried", "Exports released for a later attempt", s.jobs_retried),
            ("jobs_expired", "Archives purged after their TTL", s.jobs_expired),
            ("jobs_skipped", "Claims released because the account is inactive", s.jobs_skipped),
            ("batches_processed", "Execution pages written to archives", s.batches_processed),
            ("executions_exported", "Top-level executions written to archives", s.executions_exported),
            ("stage_failures", "Processor stage errors (output degraded)", s.stage_failures),
            ("notifications_sent", "Notifications dispatched", s.notifications_sent),
            ("notifications_failed", "Notifications that could not be dispatched", s.notifications_failed),
            ("uploads_rolled_back", "Uploads deleted after the READY update failed", s.uploads_rolled_back),
            ("claim_errors", "Claim queries that failed", s.claim_errors),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP execport_{name}_total {help}\n# TYPE execport_{name}_total counter\nexecport_{name}_total {value}\n\n"
            ));
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_claimed: u64,
    pub jobs_ready: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_expired: u64,
    pub jobs_skipped: u64,
    pub batches_processed: u64,
    pub executions_exported: u64,
    pub stage_failures: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub uploads_rolled_back: u64,
    pub claim_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let metrics = Metrics::new();
        metrics.inc_jobs_claimed();
        metrics.inc_jobs_claimed();
        metrics.inc_uploads_rolled_back();
        metrics.add_executions_exported(25);

        let snap = metrics.snapshot();
        assert_eq!(snap.jobs_claimed, 2);
        assert_eq!(snap.uploads_rolled_back, 1);
        assert_eq!(snap.executions_exported, 25);
        assert_eq!(snap.jobs_failed, 0);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.inc_jobs_ready();

        let output = metrics.prometheus_format();
        assert!(output.contains("# TYPE execport_jobs_ready_total counter"));
        assert!(output.contains("execport_jobs_ready_total 1\n"));
        assert!(output.contains("execport_claim_errors_total 0\n"));
    }
}
