//! Aggregate statistics over recorded events

use serde::{Deserialize, Serialize};

/// Point-in-time aggregate statistics for the active store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbStats {
    /// Size of the store on disk, `None` when the backend cannot report it
    pub size_on_disk: Option<u64>,
    /// Largest single request seen, in bytes
    pub biggest_request_size: u64,
    /// Cumulative request bytes
    pub total_requests_size: u64,
    /// Number of persisted events
    pub total_record_count: u64,
    /// Peak number of events captured within one second
    pub max_hits_by_second: u64,
}

impl DbStats {
    /// Human-readable summary of the statistics
    pub fn report(&self) -> String {
        let size_on_disk = self
            .size_on_disk
            .map(format_size)
            .unwrap_or_else(|| "unavailable".to_string());
        format!(
            "Size of the database file on the disk: {}.\n\
             Amount of data sent by the biggest HTTP request: {}.\n\
             Total amount of data sent via HTTP requests: {}.\n\
             Total number of records in the database: {} HTTP requests.\n\
             Maximum number of hits sent in a second: {} Hits.",
            size_on_disk,
            format_size(self.biggest_request_size),
            format_size(self.total_requests_size),
            self.total_record_count,
            self.max_hits_by_second,
        )
    }
}

/// Format a byte count in Kb, Mb or Gb
pub fn format_size(bytes: u64) -> String {
    const ONE_KB: f64 = 1024.0;
    const ONE_MB: f64 = 1_048_576.0;
    const ONE_GB: f64 = 1_073_741_824.0;

    let value = bytes as f64;
    let (unit, label) = if value >= ONE_GB {
        (ONE_GB, "Gb")
    } else if value >= ONE_MB {
        (ONE_MB, "Mb")
    } else {
        (ONE_KB, "Kb")
    };
    format!("{:.2} {}", value / unit, label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_size_picks_unit() {
        assert_eq!(format_size(0), "0.00 Kb");
        assert_eq!(format_size(512), "0.50 Kb");
        assert_eq!(format_size(3 * 1_048_576 / 2), "1.50 Mb");
        assert_eq!(format_size(2 * 1_073_741_824), "2.00 Gb");
    }

    #[test]
    fn report_marks_missing_disk_size() {
        let stats = DbStats {
            size_on_disk: None,
            biggest_request_size: 2048,
            total_requests_size: 4096,
            total_record_count: 7,
            max_hits_by_second: 3,
        };
        let report = stats.report();
        assert!(report.contains("disk: unavailable."));
        assert!(report.contains("7 HTTP requests"));
        assert!(report.contains("3 Hits"));
        assert!(report.contains("2.00 Kb"));
    }
}
