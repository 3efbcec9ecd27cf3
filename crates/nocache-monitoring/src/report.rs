//! Debug memory report over live cache entries
//!
//! Logical size counts every tensor an entry references. Physical size counts
//! a shared tensor only for the first row that references it, so the physical
//! column sums to what the report's rows actually hold.

use nocache_core::{CacheEntrySnapshot, NodeId};
use std::collections::HashSet;
use std::fmt;

/// Entries below this logical size are left out of the report
pub const REPORT_THRESHOLD_BYTES: u64 = 1024 * 1024;

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Render a byte count with binary units
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// One reported entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    /// Owning node, or the cache key when the node is unknown
    pub node: String,
    /// Class tag of the node, if known
    pub class_type: Option<String>,
    /// Bytes referenced by the entry
    pub logical_bytes: u64,
    /// Bytes not already attributed to an earlier row
    pub physical_bytes: u64,
}

/// Largest live cache entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryReport {
    /// Rows, largest first
    pub rows: Vec<ReportRow>,
    /// Number of entries inspected
    pub inspected: usize,
    /// Entries under the threshold
    pub skipped: usize,
}

impl MemoryReport {
    /// Build the report for `entries`, keeping those of at least `threshold` bytes
    pub fn analyze(entries: &[CacheEntrySnapshot], threshold: u64) -> Self {
        let mut sized: Vec<_> = entries
            .iter()
            .map(|entry| (entry, entry.value.footprint()))
            .filter(|(_, footprint)| footprint.logical_size() >= threshold)
            .collect();

        sized.sort_by(|(a, fa), (b, fb)| {
            fb.logical_size()
                .cmp(&fa.logical_size())
                .then_with(|| row_name(a).cmp(&row_name(b)))
        });

        let mut seen = HashSet::new();
        let rows: Vec<ReportRow> = sized
            .into_iter()
            .map(|(entry, footprint)| {
                let shared: u64 = footprint
                    .buffers
                    .iter()
                    .filter(|(identity, _)| seen.insert(**identity))
                    .map(|(_, bytes)| *bytes)
                    .sum();
                ReportRow {
                    node: row_name(entry),
                    class_type: entry.class_type.clone(),
                    logical_bytes: footprint.logical_size(),
                    physical_bytes: shared + footprint.inline_bytes,
                }
            })
            .collect();

        Self {
            inspected: entries.len(),
            skipped: entries.len() - rows.len(),
            rows,
        }
    }

    /// Sum of the logical column
    pub fn total_logical(&self) -> u64 {
        self.rows.iter().map(|row| row.logical_bytes).sum()
    }

    /// Sum of the physical column
    pub fn total_physical(&self) -> u64 {
        self.rows.iter().map(|row| row.physical_bytes).sum()
    }

    /// Row for a node
    pub fn row(&self, node_id: &NodeId) -> Option<&ReportRow> {
        self.rows.iter().find(|row| row.node == node_id.as_str())
    }

    /// Whether no entry reached the threshold
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn row_name(entry: &CacheEntrySnapshot) -> String {
    entry
        .node_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| entry.key.to_string())
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<16} {:<24} {:>12} {:>12}",
            "node", "class", "logical", "physical"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<16} {:<24} {:>12} {:>12}",
                row.node,
                row.class_type.as_deref().unwrap_or("-"),
                format_bytes(row.logical_bytes),
                format_bytes(row.physical_bytes)
            )?;
        }
        write!(
            f,
            "{:<16} {:<24} {:>12} {:>12}\n{} entries inspected, {} below threshold",
            "total",
            "",
            format_bytes(self.total_logical()),
            format_bytes(self.total_physical()),
            self.inspected,
            self.skipped
        )
    }
}
