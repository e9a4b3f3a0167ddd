//! Audit path metrics
//!
//! Counters describing what the producers, the ring buffer and the readers
//! did. Everything here is a relaxed atomic; the numbers are diagnostics, not
//! part of the audit trail.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::events::RecordKind;

/// Metrics collector shared by the log, the probes and the CLI
#[derive(Debug)]
pub struct AuditMetrics {
    start_time: Instant,
    started_at: DateTime<Utc>,
    /// Ring buffer metrics
    pub log: LogMetrics,
    /// Interception metrics
    pub probes: ProbeMetrics,
}

impl Default for AuditMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            started_at: Utc::now(),
            log: LogMetrics::default(),
            probes: ProbeMetrics::default(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Count one stored record of `kind` occupying `bytes` bytes
    pub fn record_written(&self, kind: RecordKind, bytes: usize) {
        match kind {
            RecordKind::Network => self.log.network_records.fetch_add(1, Ordering::Relaxed),
            RecordKind::Execution => self.log.exec_records.fetch_add(1, Ordering::Relaxed),
        };
        self.log
            .bytes_written
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_evicted(&self) {
        self.log.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn field_truncated(&self) {
        self.log.truncated_fields.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reader_lost_data(&self) {
        self.log.reader_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_whitelisted(&self) {
        self.probes.whitelisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_unresolved(&self) {
        self.probes.unresolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn thread_uncorrelated(&self) {
        self.probes.uncorrelated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hook_fault(&self) {
        self.probes.hook_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Total records stored since start
    pub fn records_written(&self) -> u64 {
        self.log.network_records.load(Ordering::Relaxed)
            + self.log.exec_records.load(Ordering::Relaxed)
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP netaudit_uptime_seconds Time since sensor started\n");
        output.push_str("# TYPE netaudit_uptime_seconds gauge\n");
        output.push_str(&format!(
            "netaudit_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        output.push_str("# HELP netaudit_records_total Records stored in the audit log\n");
        output.push_str("# TYPE netaudit_records_total counter\n");
        output.push_str(&format!(
            "netaudit_records_total{{kind=\"{}\"}} {}\n",
            RecordKind::Network.tag(),
            self.log.network_records.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "netaudit_records_total{{kind=\"{}\"}} {}\n\n",
            RecordKind::Execution.tag(),
            self.log.exec_records.load(Ordering::Relaxed)
        ));

        let counters: [(&str, &str, &AtomicU64); 8] = [
            (
                "netaudit_bytes_written_total",
                "Bytes of record slots written",
                &self.log.bytes_written,
            ),
            (
                "netaudit_records_evicted_total",
                "Records evicted to make room",
                &self.log.evicted,
            ),
            (
                "netaudit_truncated_fields_total",
                "Variable length fields cut to fit",
                &self.log.truncated_fields,
            ),
            (
                "netaudit_reader_losses_total",
                "Reads that found their record evicted",
                &self.log.reader_losses,
            ),
            (
                "netaudit_whitelisted_total",
                "Events suppressed by the whitelist",
                &self.probes.whitelisted,
            ),
            (
                "netaudit_unresolved_total",
                "Events dropped for an unresolvable subject",
                &self.probes.unresolved,
            ),
            (
                "netaudit_uncorrelated_total",
                "Entry hooks on threads beyond the correlation table",
                &self.probes.uncorrelated,
            ),
            (
                "netaudit_hook_faults_total",
                "Faults caught inside interception hooks",
                &self.probes.hook_faults,
            ),
        ];

        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n\n", name, value.load(Ordering::Relaxed)));
        }

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "started_at": self.started_at.to_rfc3339(),
            "uptime_seconds": self.uptime_seconds(),
            "log": {
                "network_records": self.log.network_records.load(Ordering::Relaxed),
                "exec_records": self.log.exec_records.load(Ordering::Relaxed),
                "bytes_written": self.log.bytes_written.load(Ordering::Relaxed),
                "evicted": self.log.evicted.load(Ordering::Relaxed),
                "truncated_fields": self.log.truncated_fields.load(Ordering::Relaxed),
                "reader_losses": self.log.reader_losses.load(Ordering::Relaxed),
            },
            "probes": {
                "whitelisted": self.probes.whitelisted.load(Ordering::Relaxed),
                "unresolved": self.probes.unresolved.load(Ordering::Relaxed),
                "uncorrelated": self.probes.uncorrelated.load(Ordering::Relaxed),
                "hook_faults": self.probes.hook_faults.load(Ordering::Relaxed),
            },
        })
    }
}

/// Ring buffer metrics
#[derive(Debug, Default)]
pub struct LogMetrics {
    pub network_records: AtomicU64,
    pub exec_records: AtomicU64,
    pub bytes_written: AtomicU64,
    pub evicted: AtomicU64,
    pub truncated_fields: AtomicU64,
    pub reader_losses: AtomicU64,
}

/// Interception metrics
#[derive(Debug, Default)]
pub struct ProbeMetrics {
    pub whitelisted: AtomicU64,
    pub unresolved: AtomicU64,
    pub uncorrelated: AtomicU64,
    pub hook_faults: AtomicU64,
}

/// Shared metrics instance
pub type SharedMetrics = Arc<AuditMetrics>;

/// Create a new shared metrics collector
pub fn create_metrics() -> SharedMetrics {
    Arc::new(AuditMetrics::new())
}
