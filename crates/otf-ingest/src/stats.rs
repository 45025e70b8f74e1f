//! Run statistics

use crate::pipeline::{CycleReport, FileOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Totals collected over one ingestion run
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RunStats {
    /// Scan cycles completed
    pub cycles: u64,
    /// Frames seen for the first time
    pub discovered: u64,
    /// Frames integrated and published
    pub integrated: u64,
    /// Frames recognised as already published
    pub skipped: u64,
    /// Failed attempts (a frame retried twice counts twice)
    pub failed: u64,
    /// Data rows written across all outputs
    pub rows_written: u64,
    /// Duration in seconds
    pub duration_secs: f64,
    /// Start time
    pub started_at: Option<DateTime<Utc>>,
    /// End time
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunStats {
    /// Create new empty stats
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Mark stats as completed
    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
        if let (Some(start), Some(end)) = (self.started_at, self.completed_at) {
            self.duration_secs = (end - start).num_milliseconds() as f64 / 1000.0;
        }
    }

    /// Fold one cycle into the totals
    pub fn record_cycle(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.discovered += report.discovered as u64;
        self.skipped += report.skipped as u64;
        for outcome in &report.outcomes {
            match outcome {
                FileOutcome::Integrated { rows, .. } => {
                    self.integrated += 1;
                    self.rows_written += *rows as u64;
                },
                FileOutcome::Failed { .. } => self.failed += 1,
            }
        }
    }

    /// Percentage of attempts that produced an output
    pub fn success_rate(&self) -> f64 {
        let attempts = self.integrated + self.failed;
        if attempts > 0 {
            (self.integrated as f64 / attempts as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Calculate frames integrated per minute
    pub fn frames_per_minute(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.integrated as f64 * 60.0 / self.duration_secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_new_stats_have_start_time() {
        let stats = RunStats::new();
        assert_eq!(stats.cycles, 0);
        assert!(stats.started_at.is_some());
        assert!(stats.completed_at.is_none());
    }

    #[test]
    fn test_record_cycle_accumulates() {
        let mut stats = RunStats::new();
        let mut report = CycleReport::new(1);
        report.discovered = 3;
        report.skipped = 1;
        report.outcomes = vec![
            FileOutcome::Integrated {
                name: "a.tif".to_string(),
                output: PathBuf::from("a.xy"),
                rows: 100,
            },
            FileOutcome::Failed {
                name: "b.tif".to_string(),
                attempts: 1,
                error: "truncated".to_string(),
            },
        ];

        stats.record_cycle(&report);
        stats.record_cycle(&CycleReport::new(2));

        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.discovered, 3);
        assert_eq!(stats.integrated, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.rows_written, 100);
        assert!((stats.success_rate() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_complete_sets_duration() {
        let mut stats = RunStats::new();
        stats.complete();
        assert!(stats.completed_at.is_some());
        assert!(stats.duration_secs >= 0.0);
    }
}
