//! OTF Ingest - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use otf_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use otf_ingest::processor::{CalibratedIntegrator, DirectoryScanner, TiffImageReader};
use otf_ingest::{Cli, Commands, Config, IngestionLoop, LoopSettings};
use std::process;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("otf-ingest")
        .build();

    // Environment variables take precedence
    let log_config = match log_config.clone().merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: ignoring OTF_LOG_* settings: {:#}", e);
            log_config
        },
    };

    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    if let Err(e) = execute(&cli).await {
        error!(error = %format!("{:#}", e), "Run failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute(cli: &Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.paths.apply(&mut config);

    match &cli.command {
        Commands::Watch { cycles } => {
            if let Some(cycles) = cycles {
                config.schedule.max_cycles = Some(*cycles);
            }
            run(config).await
        },
        Commands::Once => {
            config.schedule.max_cycles = Some(1);
            run(config).await
        },
        Commands::Check => check(config),
    }
}

async fn run(config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    let integrator =
        CalibratedIntegrator::from_config(&config).context("Failed to load calibration")?;
    let mut ingestion = IngestionLoop::new(
        DirectoryScanner::from_config(&config),
        TiffImageReader,
        integrator,
        LoopSettings::from(&config),
    )
    .context("Failed to prepare output directory")?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let stats = ingestion.run(cancel).await.context("Ingestion loop failed")?;

    info!(
        integrated = stats.integrated,
        skipped = stats.skipped,
        failed = stats.failed,
        rows_written = stats.rows_written,
        success_rate = stats.success_rate(),
        frames_per_minute = stats.frames_per_minute(),
        "Run summary"
    );
    if ingestion.session().exhausted_count() > 0 {
        info!(
            exhausted = ingestion.session().exhausted_count(),
            "Some frames were given up after repeated failures, see the manifest"
        );
    }
    Ok(())
}

fn check(config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    let integrator =
        CalibratedIntegrator::from_config(&config).context("Failed to load calibration")?;
    let poni = integrator.poni();

    println!("Input directory:  {}", config.paths.input_dir.display());
    println!("Output directory: {}", config.paths.output_dir().display());
    println!("Calibration:      {}", config.paths.poni_path().display());
    println!("  detector:       {}", poni.detector);
    println!("  pixel size:     {:e} x {:e} m", poni.pixel1, poni.pixel2);
    println!("  distance:       {} m", poni.distance);
    println!("  poni:           {:e}, {:e} m", poni.poni1, poni.poni2);
    println!("  rotations:      {} {} {} rad", poni.rot1, poni.rot2, poni.rot3);
    match poni.wavelength {
        Some(w) => println!("  wavelength:     {:e} m", w),
        None => println!("  wavelength:     unset"),
    }
    match integrator.mask_shape() {
        Some((rows, cols)) => println!("Mask:             {} x {}", rows, cols),
        None => println!("Mask:             none"),
    }
    let settings = integrator.settings();
    println!(
        "Integration:      {} points, unit {}, method {}, error model {}",
        settings.radial_points, settings.unit, settings.method, settings.error_model
    );

    if !config.paths.input_dir.is_dir() {
        anyhow::bail!("Input directory {} does not exist", config.paths.input_dir.display());
    }

    println!("Configuration OK");
    Ok(())
}

/// Cancel the loop on Ctrl+C or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing current file and stopping");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing current file and stopping");
        },
    }

    cancel.cancel();
}
