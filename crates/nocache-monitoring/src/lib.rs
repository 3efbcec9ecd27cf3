//! Monitoring for NoCache: log setup, the debug memory report and the
//! memory reclamation worker.

use serde::{Deserialize, Serialize};

pub mod logging;
pub mod reclaim;
pub mod report;

pub use logging::{init_logging, LogExt};
pub use reclaim::{MemoryReclaimer, NoopReclaimer, ReclaimSchedule, ReclaimStats, ReclaimWorker};
pub use report::{format_bytes, MemoryReport, ReportRow, REPORT_THRESHOLD_BYTES};

/// Configuration for initializing logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "nocache".to_string(),
            log_filter: "info".to_string(),
            json_logs: false,
        }
    }
}
