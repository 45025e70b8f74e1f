//! Integration tests for the ingestion loop
//!
//! Frames are real files in a temporary directory, while decoding and
//! integration are replaced by counting fakes. Tokio time is paused so settle
//! delays and cycle intervals elapse instantly.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use ndarray::Array2;
use otf_ingest::cleanup::validate_output;
use otf_ingest::config::IntegrationConfig;
use otf_ingest::processor::{
    CalibratedIntegrator, DirectoryScanner, ImageReader, IntegrationSummary, Integrator,
    Scanner, TiffImageReader,
};
use otf_ingest::{FileOutcome, IngestError, IngestionLoop, LoopSettings, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SETTLE: Duration = Duration::from_secs(3);
const INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct FakeReader {
    reads: Arc<Mutex<Vec<String>>>,
}

impl FakeReader {
    fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }

    fn reads_of(&self, name: &str) -> usize {
        self.reads().iter().filter(|n| n.as_str() == name).count()
    }
}

impl ImageReader for FakeReader {
    fn read(&self, path: &Path) -> Result<Array2<f32>> {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        self.reads.lock().unwrap().push(name);

        let bytes = std::fs::read(path)?;
        if bytes.starts_with(b"corrupt") {
            return Err(IngestError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "truncated frame",
            )));
        }
        Ok(Array2::from_elem((4, 4), 1.0))
    }
}

#[derive(Clone, Default)]
struct FakeIntegrator {
    calls: Arc<AtomicUsize>,
}

impl FakeIntegrator {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Integrator for FakeIntegrator {
    fn integrate(&self, _image: &Array2<f32>, raw_output: &Path) -> Result<IntegrationSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut text = String::new();
        for i in 0..23 {
            text.push_str(&format!("# header line {}\n", i));
        }
        for k in 0..5 {
            text.push_str(&format!("{:>18.10e} {:>18.10e}\n", k as f64 * 0.5, 100.0 + k as f64));
        }
        std::fs::write(raw_output, text)?;

        Ok(IntegrationSummary {
            bins: 5,
            valid_pixels: 16,
            masked_pixels: 0,
        })
    }
}

struct FailingScanner;

impl Scanner for FailingScanner {
    fn scan(&self) -> Result<Vec<String>> {
        Err(IngestError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "share unmounted",
        )))
    }
}

struct Fixture {
    _root: TempDir,
    input: PathBuf,
    output: PathBuf,
    reader: FakeReader,
    integrator: FakeIntegrator,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().to_path_buf();
        let output = input.join("XY");
        Self {
            _root: root,
            input,
            output,
            reader: FakeReader::default(),
            integrator: FakeIntegrator::default(),
        }
    }

    fn frame(&self, name: &str) {
        std::fs::write(self.input.join(name), b"frame").unwrap();
    }

    fn corrupt_frame(&self, name: &str) {
        std::fs::write(self.input.join(name), b"corrupt").unwrap();
    }

    fn settings(&self) -> LoopSettings {
        LoopSettings {
            input_dir: self.input.clone(),
            output_dir: self.output.clone(),
            output_extension: "xy".to_string(),
            manifest_path: self.output.join(".otf-manifest.json"),
            header_lines: 23,
            settle_delay: SETTLE,
            cycle_interval: INTERVAL,
            max_cycles: None,
            max_attempts: 3,
            fail_fast: false,
            skip_existing: true,
        }
    }

    fn ingestion(
        &self,
        settings: LoopSettings,
    ) -> IngestionLoop<DirectoryScanner, FakeReader, FakeIntegrator> {
        IngestionLoop::new(
            DirectoryScanner::new(&self.input, "tif"),
            self.reader.clone(),
            self.integrator.clone(),
            settings,
        )
        .unwrap()
    }

    fn output(&self, stem: &str) -> PathBuf {
        self.output.join(format!("{}.xy", stem))
    }

    fn published(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.output)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".xy"))
            .collect();
        names.sort();
        names
    }
}

#[tokio::test(start_paused = true)]
async fn test_each_frame_is_integrated_once_across_cycles() {
    let fx = Fixture::new();
    fx.frame("a.tif");
    fx.frame("b.tif");

    let mut ingestion = fx.ingestion(LoopSettings {
        max_cycles: Some(3),
        ..fx.settings()
    });
    let stats = ingestion.run(CancellationToken::new()).await.unwrap();

    assert_eq!(stats.cycles, 3);
    assert_eq!(fx.integrator.calls(), 2);
    assert_eq!(fx.reader.reads(), vec!["a.tif", "b.tif"]);
    assert_eq!(stats.integrated, 2);
    assert_eq!(stats.rows_written, 10);
}

#[tokio::test(start_paused = true)]
async fn test_single_pass_publishes_every_frame() {
    let fx = Fixture::new();
    for i in 0..5 {
        fx.frame(&format!("frame_{:04}.tif", i));
    }
    fx.frame("notes.txt");

    let mut ingestion = fx.ingestion(fx.settings());
    let report = ingestion.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.discovered, 5);
    assert_eq!(report.integrated(), 5);
    assert_eq!(ingestion.session().processed_count(), 5);
    assert_eq!(fx.published().len(), 5);
    for i in 0..5 {
        assert!(validate_output(&fx.output(&format!("frame_{:04}", i))));
    }

    // No raw or temporary files remain next to the outputs
    let leftovers: Vec<_> = std::fs::read_dir(&fx.output)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".raw") || n.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "leftover files: {:?}", leftovers);
}

#[tokio::test(start_paused = true)]
async fn test_published_file_format() {
    let fx = Fixture::new();
    fx.frame("scan_0001.tif");

    let mut ingestion = fx.ingestion(fx.settings());
    ingestion.run_cycle(&CancellationToken::new()).await.unwrap();

    let text = std::fs::read_to_string(fx.output("scan_0001")).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0], "X\tY");
    assert_eq!(lines[1], "0.00000000\t100.00000000");
    assert_eq!(lines[5], "2.00000000\t104.00000000");
}

#[tokio::test(start_paused = true)]
async fn test_empty_cycle_skips_settle_delay_and_integrator() {
    let fx = Fixture::new();
    let mut ingestion = fx.ingestion(fx.settings());

    let before = tokio::time::Instant::now();
    let report = ingestion.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.pending, 0);
    assert!(!report.settled);
    assert!(report.outcomes.is_empty());
    assert_eq!(fx.integrator.calls(), 0);
    assert!(before.elapsed() < SETTLE);
}

#[tokio::test(start_paused = true)]
async fn test_settle_delay_precedes_processing() {
    let fx = Fixture::new();
    fx.frame("a.tif");
    let mut ingestion = fx.ingestion(fx.settings());

    let before = tokio::time::Instant::now();
    let report = ingestion.run_cycle(&CancellationToken::new()).await.unwrap();

    assert!(report.settled);
    assert!(before.elapsed() >= SETTLE);
    assert_eq!(fx.integrator.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_arrivals_are_picked_up_in_later_cycles() {
    let fx = Fixture::new();
    fx.frame("a.tif");
    let mut ingestion = fx.ingestion(fx.settings());
    let cancel = CancellationToken::new();

    let first = ingestion.run_cycle(&cancel).await.unwrap();
    assert_eq!(first.discovered, 1);

    fx.frame("b.tif");
    let second = ingestion.run_cycle(&cancel).await.unwrap();
    assert_eq!(second.discovered, 1);
    assert_eq!(second.integrated(), 1);

    let third = ingestion.run_cycle(&cancel).await.unwrap();
    assert_eq!(third.discovered, 0);
    assert_eq!(fx.integrator.calls(), 2);
    assert_eq!(fx.published(), vec!["a.xy", "b.xy"]);
}

#[tokio::test(start_paused = true)]
async fn test_decode_failure_is_isolated() {
    let fx = Fixture::new();
    fx.frame("a.tif");
    fx.corrupt_frame("b.tif");
    fx.frame("c.tif");

    let mut ingestion = fx.ingestion(fx.settings());
    let report = ingestion.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.integrated(), 2);
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        &report.outcomes[1],
        FileOutcome::Failed { name, attempts: 1, .. } if name == "b.tif"
    ));

    assert!(!ingestion.session().is_processed("b.tif"));
    assert!(!fx.output("b").exists());
    assert!(fx.output("c").exists());
    assert_eq!(ingestion.manifest().get_failed("b.tif").unwrap().attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_frame_is_retried_until_exhausted() {
    let fx = Fixture::new();
    fx.corrupt_frame("b.tif");

    let mut ingestion = fx.ingestion(LoopSettings {
        max_attempts: 2,
        max_cycles: Some(4),
        ..fx.settings()
    });
    let stats = ingestion.run(CancellationToken::new()).await.unwrap();

    assert_eq!(fx.reader.reads_of("b.tif"), 2);
    assert_eq!(stats.failed, 2);
    assert!(ingestion.session().is_exhausted("b.tif"));
    assert_eq!(ingestion.session().exhausted_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_frame_recovers_after_producer_finishes_writing() {
    let fx = Fixture::new();
    fx.corrupt_frame("slow.tif");

    let mut ingestion = fx.ingestion(fx.settings());
    let cancel = CancellationToken::new();

    let first = ingestion.run_cycle(&cancel).await.unwrap();
    assert_eq!(first.failed(), 1);

    fx.frame("slow.tif");
    let second = ingestion.run_cycle(&cancel).await.unwrap();
    assert_eq!(second.integrated(), 1);
    assert!(ingestion.manifest().get_failed("slow.tif").is_none());
    assert!(ingestion.manifest().is_processed("slow.tif"));
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_aborts_the_run() {
    let fx = Fixture::new();
    fx.frame("a.tif");
    fx.corrupt_frame("b.tif");
    fx.frame("c.tif");

    let mut ingestion = fx.ingestion(LoopSettings {
        fail_fast: true,
        ..fx.settings()
    });
    let err = ingestion.run(CancellationToken::new()).await.unwrap_err();

    match err {
        IngestError::FileFailed { name, .. } => assert_eq!(name, "b.tif"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fx.integrator.calls(), 1);
    assert!(!fx.output("c").exists());
}

#[tokio::test(start_paused = true)]
async fn test_restart_skips_checkpointed_outputs() {
    let fx = Fixture::new();
    fx.frame("a.tif");
    fx.frame("b.tif");
    let cancel = CancellationToken::new();

    {
        let mut first = fx.ingestion(fx.settings());
        first.run_cycle(&cancel).await.unwrap();
    }
    assert_eq!(fx.integrator.calls(), 2);

    fx.frame("c.tif");
    let mut second = fx.ingestion(LoopSettings {
        skip_existing: false,
        ..fx.settings()
    });
    let report = second.run_cycle(&cancel).await.unwrap();

    assert_eq!(report.skipped, 2);
    assert_eq!(report.integrated(), 1);
    assert_eq!(fx.integrator.calls(), 3);
    assert!(second.session().is_processed("a.tif"));
}

#[tokio::test(start_paused = true)]
async fn test_checkpointed_but_damaged_output_is_redone() {
    let fx = Fixture::new();
    fx.frame("a.tif");
    let cancel = CancellationToken::new();

    {
        let mut first = fx.ingestion(fx.settings());
        first.run_cycle(&cancel).await.unwrap();
    }
    std::fs::write(fx.output("a"), "X\tY\n").unwrap();

    let mut second = fx.ingestion(fx.settings());
    let report = second.run_cycle(&cancel).await.unwrap();

    assert_eq!(report.skipped, 0);
    assert_eq!(report.integrated(), 1);
    assert!(validate_output(&fx.output("a")));
}

#[tokio::test(start_paused = true)]
async fn test_existing_outputs_without_manifest() {
    let fx = Fixture::new();
    fx.frame("a.tif");
    std::fs::create_dir_all(&fx.output).unwrap();
    std::fs::write(fx.output("a"), "X\tY\n1.00000000\t2.00000000\n").unwrap();
    let cancel = CancellationToken::new();

    let mut adopting = fx.ingestion(fx.settings());
    let report = adopting.run_cycle(&cancel).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(fx.integrator.calls(), 0);
    assert!(adopting.manifest().get_processed("a.tif").unwrap().adopted);

    std::fs::remove_file(fx.output.join(".otf-manifest.json")).unwrap();
    let mut strict = fx.ingestion(LoopSettings {
        skip_existing: false,
        ..fx.settings()
    });
    let report = strict.run_cycle(&cancel).await.unwrap();
    assert_eq!(report.skipped, 0);
    assert_eq!(fx.integrator.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_names_differing_in_extension_case_keep_one_output() {
    let fx = Fixture::new();
    fx.frame("a.TIF");
    fx.frame("a.tif");
    fx.frame("b.tif");
    let cancel = CancellationToken::new();

    let mut ingestion = fx.ingestion(fx.settings());
    let report = ingestion.run_cycle(&cancel).await.unwrap();

    assert_eq!(report.discovered, 3);
    assert_eq!(report.integrated(), 2);
    assert_eq!(report.failed(), 1);
    match &report.outcomes[1] {
        FileOutcome::Failed { name, error, .. } => {
            assert_eq!(name, "a.tif");
            assert!(error.contains("a.TIF"), "{}", error);
        },
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(fx.integrator.calls(), 2);
    assert_eq!(fx.reader.reads_of("a.tif"), 0);
    assert_eq!(fx.published(), vec!["a.xy", "b.xy"]);

    let manifest = ingestion.manifest();
    assert_eq!(manifest.processed.len(), 2);
    assert!(manifest.is_processed("a.TIF"));
    assert!(!manifest.is_processed("a.tif"));
    assert_eq!(manifest.get_failed("a.tif").unwrap().attempts, 1);

    // A restart does not hand the output to the other name either
    drop(ingestion);
    let mut restarted = fx.ingestion(fx.settings());
    let report = restarted.run_cycle(&cancel).await.unwrap();
    assert_eq!(report.skipped, 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.outcomes[0].name(), "a.tif");
    assert_eq!(fx.integrator.calls(), 2);
    assert_eq!(
        restarted.manifest().get_processed("a.TIF").unwrap().output,
        "a.xy"
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_unbounded_loop() {
    let fx = Fixture::new();
    let mut ingestion = fx.ingestion(fx.settings());
    let cancel = CancellationToken::new();

    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { ingestion.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(23)).await;
    cancel.cancel();

    let stats = handle.await.unwrap().unwrap();
    assert!(stats.cycles >= 4);
    assert!(stats.completed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_settle_processes_nothing() {
    let fx = Fixture::new();
    fx.frame("a.tif");
    let mut ingestion = fx.ingestion(fx.settings());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = ingestion.run_cycle(&cancel).await.unwrap();
    assert_eq!(report.pending, 1);
    assert!(!report.settled);
    assert_eq!(fx.integrator.calls(), 0);

    let stats = ingestion.run(cancel).await.unwrap();
    assert_eq!(stats.cycles, 1);
}

#[tokio::test(start_paused = true)]
async fn test_scan_failure_is_fatal() {
    let fx = Fixture::new();
    let mut ingestion = IngestionLoop::new(
        FailingScanner,
        fx.reader.clone(),
        fx.integrator.clone(),
        fx.settings(),
    )
    .unwrap();

    assert!(ingestion.run(CancellationToken::new()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_with_calibrated_integrator() {
    let root = tempfile::tempdir().unwrap();
    let input = root.path().to_path_buf();
    let output = input.join("XY");

    let poni: otf_geometry::PoniFile = "poni_version: 2\n\
                Detector: Detector\n\
                Detector_config: {\"pixel1\": 0.0001, \"pixel2\": 0.0001}\n\
                Distance: 0.1\n\
                Poni1: 0.0008\n\
                Poni2: 0.0008\n\
                Rot1: 0\nRot2: 0\nRot3: 0\n"
        .parse()
        .unwrap();
    let frame = Array2::<f32>::from_shape_fn((16, 16), |(i, j)| (i + j) as f32);
    otf_geometry::image::write_tiff(input.join("frame_0001.tif"), &frame).unwrap();

    let settings = LoopSettings {
        input_dir: input.clone(),
        output_dir: output.clone(),
        output_extension: "xy".to_string(),
        manifest_path: output.join(".otf-manifest.json"),
        header_lines: 23,
        settle_delay: SETTLE,
        cycle_interval: INTERVAL,
        max_cycles: Some(1),
        max_attempts: 3,
        fail_fast: true,
        skip_existing: true,
    };
    let integration = IntegrationConfig {
        radial_points: 40,
        ..IntegrationConfig::default()
    };

    let mut ingestion = IngestionLoop::new(
        DirectoryScanner::new(&input, "tif"),
        TiffImageReader,
        CalibratedIntegrator::new(poni, None, integration),
        settings,
    )
    .unwrap();
    let stats = ingestion.run(CancellationToken::new()).await.unwrap();

    assert_eq!(stats.integrated, 1);
    let published = output.join("frame_0001.xy");
    assert!(validate_output(&published));
    let text = std::fs::read_to_string(&published).unwrap();
    assert_eq!(text.lines().count(), 41);
    assert_eq!(ingestion.manifest().get_processed("frame_0001.tif").unwrap().rows, 40);
}
