//! The ingestion loop
//!
//! Each cycle scans the input directory, waits a settle delay when there is
//! anything new, then integrates every pending frame and publishes it as a
//! cleaned `.xy` profile. The loop ends when its cancellation token fires or
//! after a configured number of cycles.
//!
//! Per-frame state: `unseen -> known -> processed`, with `known -> failed(n)
//! -> known` retries until `max_attempts`, after which the frame is left
//! alone for the rest of the run. Frames whose published output already
//! validates go straight from `known` to `processed`.
//!
//! Each output path belongs to the first frame that publishes it. Input
//! names that differ only in extension case map to the same output, and the
//! later one is failed with [`IngestError::OutputConflict`].

use crate::checkpoint::Manifest;
use crate::cleanup::{rewrite_raw, validate_output};
use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::processor::{ImageReader, Integrator, Scanner};
use crate::session::IngestSession;
use crate::stats::RunStats;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything the loop needs besides its collaborators
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub output_extension: String,
    pub manifest_path: PathBuf,
    pub header_lines: usize,
    pub settle_delay: Duration,
    pub cycle_interval: Duration,
    pub max_cycles: Option<u64>,
    pub max_attempts: u32,
    pub fail_fast: bool,
    pub skip_existing: bool,
}

impl From<&Config> for LoopSettings {
    fn from(config: &Config) -> Self {
        Self {
            input_dir: config.paths.input_dir.clone(),
            output_dir: config.paths.output_dir(),
            output_extension: config.paths.output_extension.trim_start_matches('.').to_string(),
            manifest_path: config.paths.manifest_path(),
            header_lines: config.integration.header_lines,
            settle_delay: config.schedule.settle_delay(),
            cycle_interval: config.schedule.cycle_interval(),
            max_cycles: config.schedule.max_cycles,
            max_attempts: config.schedule.max_attempts,
            fail_fast: config.schedule.fail_fast,
            skip_existing: config.schedule.skip_existing,
        }
    }
}

/// Result of one processing attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Integrated {
        name: String,
        output: PathBuf,
        rows: usize,
    },
    Failed {
        name: String,
        attempts: u32,
        error: String,
    },
}

impl FileOutcome {
    pub fn name(&self) -> &str {
        match self {
            FileOutcome::Integrated { name, .. } | FileOutcome::Failed { name, .. } => name,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FileOutcome::Integrated { .. })
    }
}

/// What happened during one scan cycle
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CycleReport {
    pub cycle: u64,
    /// Names seen for the first time this cycle
    pub discovered: usize,
    /// Newly seen names whose output was already published
    pub skipped: usize,
    /// Queue length after the scan
    pub pending: usize,
    /// Whether the settle delay was waited
    pub settled: bool,
    pub outcomes: Vec<FileOutcome>,
}

impl CycleReport {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            ..Default::default()
        }
    }

    pub fn integrated(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_success()).count()
    }
}

/// Watches a directory and integrates every new frame exactly once
pub struct IngestionLoop<S, R, I> {
    scanner: S,
    reader: R,
    integrator: I,
    settings: LoopSettings,
    session: IngestSession,
    manifest: Manifest,
    /// Output path -> frame that published it
    claims: HashMap<PathBuf, String>,
    stats: RunStats,
    cycle: u64,
}

impl<S, R, I> IngestionLoop<S, R, I>
where
    S: Scanner,
    R: ImageReader,
    I: Integrator,
{
    /// Create the output directory and load the checkpoint
    pub fn new(scanner: S, reader: R, integrator: I, settings: LoopSettings) -> Result<Self> {
        std::fs::create_dir_all(&settings.output_dir).map_err(|e| {
            IngestError::config(format!(
                "cannot create output directory {}: {}",
                settings.output_dir.display(),
                e
            ))
        })?;

        let manifest = Manifest::load_or_default(&settings.manifest_path)?;
        if !manifest.processed.is_empty() {
            info!(
                checkpointed = manifest.processed.len(),
                manifest = %settings.manifest_path.display(),
                "Resuming from checkpoint"
            );
        }

        let claims = manifest
            .processed
            .iter()
            .map(|(name, entry)| (settings.output_dir.join(&entry.output), name.clone()))
            .collect();

        Ok(Self {
            scanner,
            reader,
            integrator,
            session: IngestSession::new(settings.max_attempts),
            settings,
            manifest,
            claims,
            stats: RunStats::new(),
            cycle: 0,
        })
    }

    pub fn session(&self) -> &IngestSession {
        &self.session
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Published path for an input frame name
    pub fn output_path(&self, name: &str) -> PathBuf {
        self.settings
            .output_dir
            .join(Path::new(name).with_extension(&self.settings.output_extension))
    }

    /// Frame other than `name` that already owns `output`
    fn claimed_by_other(&self, name: &str, output: &Path) -> Option<&str> {
        self.claims
            .get(output)
            .map(String::as_str)
            .filter(|owner| *owner != name)
    }

    /// Run cycles until cancelled or until `max_cycles` is reached
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunStats> {
        info!(
            input_dir = %self.settings.input_dir.display(),
            output_dir = %self.settings.output_dir.display(),
            max_cycles = ?self.settings.max_cycles,
            "Starting ingestion loop"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.run_cycle(&cancel).await?;

            if self
                .settings
                .max_cycles
                .is_some_and(|max| self.cycle >= max)
            {
                debug!(cycles = self.cycle, "Reached cycle limit");
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.cycle_interval) => {},
            }
        }

        self.stats.complete();
        info!(
            cycles = self.stats.cycles,
            integrated = self.stats.integrated,
            skipped = self.stats.skipped,
            failed = self.stats.failed,
            duration_secs = self.stats.duration_secs,
            "Ingestion loop stopped"
        );
        Ok(self.stats.clone())
    }

    /// One scan-and-process pass
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<CycleReport> {
        self.cycle += 1;
        let started = Instant::now();
        let mut report = CycleReport::new(self.cycle);

        let fresh = self.session.observe(self.scanner.scan()?);
        report.discovered = fresh.len();

        let mut adopted = false;
        for name in &fresh {
            if self.adopt_existing(name)? {
                report.skipped += 1;
                adopted = true;
            }
        }
        if adopted {
            self.manifest.save(&self.settings.manifest_path)?;
        }

        let pending = self.session.pending();
        report.pending = pending.len();

        if !pending.is_empty() {
            debug!(
                cycle = self.cycle,
                pending = pending.len(),
                delay_ms = self.settings.settle_delay.as_millis() as u64,
                "Waiting for writes to settle"
            );
            report.settled = tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(self.settings.settle_delay) => true,
            };

            if report.settled {
                for name in pending {
                    if cancel.is_cancelled() {
                        info!(cycle = self.cycle, "Cancellation requested, stopping before next file");
                        break;
                    }
                    let outcome = self.process_file(&name)?;
                    report.outcomes.push(outcome);
                }
            }
        }

        self.stats.record_cycle(&report);
        info!(
            cycle = report.cycle,
            new = report.discovered,
            integrated = report.integrated(),
            failed = report.failed(),
            skipped = report.skipped,
            total_known = self.session.known_count(),
            total_processed = self.session.processed_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cycle complete"
        );

        Ok(report)
    }

    /// Mark a newly seen frame processed when its output is already published
    fn adopt_existing(&mut self, name: &str) -> Result<bool> {
        let checkpointed = self.manifest.is_processed(name);
        if !checkpointed && !self.settings.skip_existing {
            return Ok(false);
        }

        let output = self.output_path(name);
        if self.claimed_by_other(name, &output).is_some() {
            return Ok(false);
        }
        if !validate_output(&output) {
            if checkpointed {
                warn!(file = %name, output = %output.display(), "Checkpointed output is missing or invalid, re-integrating");
            }
            return Ok(false);
        }

        self.session.mark_processed(name)?;
        if !checkpointed {
            let output_name = output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.manifest.record_adopted(name, &output_name);
        }
        self.claims.insert(output, name.to_string());
        debug!(file = %name, "Output already published, skipping");
        Ok(true)
    }

    /// Integrate one frame, recording success or failure
    ///
    /// Per-file errors become [`FileOutcome::Failed`] unless `fail_fast` is
    /// set. Only checkpoint and session errors are returned.
    fn process_file(&mut self, name: &str) -> Result<FileOutcome> {
        let started = Instant::now();
        let output = self.output_path(name);

        let result = match self.claimed_by_other(name, &output) {
            Some(owner) => Err(IngestError::OutputConflict {
                output: output.clone(),
                owner: owner.to_string(),
            }),
            None => self.integrate_file(name, &output),
        };

        match result {
            Ok(rows) => {
                self.session.mark_processed(name)?;
                let output_name = output
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.manifest.record_processed(name, &output_name, rows);
                self.manifest.save(&self.settings.manifest_path)?;
                self.claims.insert(output.clone(), name.to_string());

                info!(
                    file = %name,
                    rows,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Integrated"
                );
                Ok(FileOutcome::Integrated {
                    name: name.to_string(),
                    output,
                    rows,
                })
            },
            Err(err) => {
                let message = err.to_string();
                let attempts = self.session.mark_failed(name, &message)?;
                self.manifest.record_failed(name, attempts, &message);
                self.manifest.save(&self.settings.manifest_path)?;

                if self.settings.fail_fast {
                    return Err(IngestError::FileFailed {
                        name: name.to_string(),
                        source: Box::new(err),
                    });
                }

                let exhausted = self.session.is_exhausted(name);
                warn!(
                    file = %name,
                    attempts,
                    max_attempts = self.settings.max_attempts,
                    exhausted,
                    error = %message,
                    "Failed to integrate"
                );
                Ok(FileOutcome::Failed {
                    name: name.to_string(),
                    attempts,
                    error: message,
                })
            },
        }
    }

    fn integrate_file(&self, name: &str, output: &Path) -> Result<usize> {
        let input = self.settings.input_dir.join(name);
        let image = self.reader.read(&input)?;

        // Removed on drop, whatever happens below
        let raw = tempfile::Builder::new()
            .prefix(".otf-")
            .suffix(".raw")
            .tempfile_in(&self.settings.output_dir)?;

        let summary = self.integrator.integrate(&image, raw.path())?;
        debug!(file = %name, bins = summary.bins, valid_pixels = summary.valid_pixels, "Raw profile written");

        rewrite_raw(raw.path(), output, self.settings.header_lines)
    }
}
