//! OTF Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Watches the directory an area detector writes into and turns every new
//! frame into a one-dimensional diffraction profile while the experiment is
//! still running.
//!
//! # Overview
//!
//! - **Loop**: [`pipeline::IngestionLoop`] scans, waits for writes to settle,
//!   integrates and publishes each frame exactly once
//! - **Collaborators**: [`processor`] holds the scanner, image reader and
//!   integrator seams with their filesystem-backed implementations
//! - **Cleanup**: [`cleanup`] turns raw integrator text into tab-delimited
//!   `.xy` files
//! - **Checkpoint**: [`checkpoint::Manifest`] lets a restarted run skip frames
//!   it already published
//! - **Configuration**: [`config::Config`] layers defaults, TOML and `OTF_*`
//!   environment variables

pub mod checkpoint;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod processor;
pub mod session;
pub mod stats;

// Re-export commonly used types
pub use config::Config;
pub use error::{IngestError, Result};
pub use pipeline::{CycleReport, FileOutcome, IngestionLoop, LoopSettings};
pub use session::IngestSession;
pub use stats::RunStats;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// On-the-fly azimuthal integration of detector frames
#[derive(Parser, Debug)]
#[command(name = "otf-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// TOML configuration file
    #[arg(short, long, env = "OTF_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub paths: PathOverrides,
}

/// Directory overrides, applied after the config file and environment
#[derive(Args, Debug, Default, Clone)]
pub struct PathOverrides {
    /// Directory the detector writes frames into
    #[arg(long, global = true)]
    pub input_dir: Option<PathBuf>,

    /// Directory for published profiles (default: <input-dir>/XY)
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Directory holding the PONI file and mask (default: <input-dir>/calib)
    #[arg(long, global = true)]
    pub calib_dir: Option<PathBuf>,
}

impl PathOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.input_dir {
            config.paths.input_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.paths.output_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.calib_dir {
            config.paths.calibration_dir = Some(dir.clone());
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the input directory until Ctrl-C or SIGTERM
    Watch {
        /// Stop after this many scan cycles
        #[arg(long)]
        cycles: Option<u64>,
    },

    /// Run a single scan-and-process cycle, then exit
    Once,

    /// Validate the configuration and load the calibration
    Check,
}
