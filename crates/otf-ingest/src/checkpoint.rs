//! Checkpoint manifest (`.otf-manifest.json`)
//!
//! Records which frames have been published and which failed, so a restarted
//! run does not integrate the same frames again.

use crate::cleanup::persist_atomically;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tracing::debug;

pub const MANIFEST_VERSION: u32 = 1;

/// Run checkpoint stored next to the published profiles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// Manifest format version
    pub manifest_version: u32,

    /// Timestamp of the last update
    pub generated: DateTime<Utc>,

    /// Published frames, keyed by input file name
    #[serde(default)]
    pub processed: BTreeMap<String, ProcessedEntry>,

    /// Frames that failed at least once and have not been published since
    #[serde(default)]
    pub failed: BTreeMap<String, FailedEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedEntry {
    /// Output file name inside the output directory
    pub output: String,

    /// Number of data rows in the output
    pub rows: usize,

    pub completed_at: DateTime<Utc>,

    /// Recognised from an existing output rather than integrated
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub adopted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedEntry {
    pub attempts: u32,

    pub last_error: String,

    pub last_attempt: DateTime<Utc>,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            manifest_version: MANIFEST_VERSION,
            generated: Utc::now(),
            processed: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }

    /// Load manifest from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let manifest: Manifest = serde_json::from_str(&content)?;
        Ok(manifest)
    }

    /// Load the manifest, or start a fresh one when the file does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "No checkpoint manifest, starting fresh");
            return Ok(Self::new());
        }
        Self::load(path)
    }

    /// Save manifest, replacing the previous file atomically
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        persist_atomically(path.as_ref(), |file| {
            file.write_all(content.as_bytes())?;
            file.write_all(b"\n")?;
            Ok(())
        })
    }

    pub fn record_processed(&mut self, name: &str, output: &str, rows: usize) {
        self.insert_processed(name, output, rows, false);
    }

    /// Record a frame whose output was found already published
    pub fn record_adopted(&mut self, name: &str, output: &str) {
        if self.processed.contains_key(name) {
            return;
        }
        self.insert_processed(name, output, 0, true);
    }

    fn insert_processed(&mut self, name: &str, output: &str, rows: usize, adopted: bool) {
        self.failed.remove(name);
        self.processed.insert(
            name.to_string(),
            ProcessedEntry {
                output: output.to_string(),
                rows,
                completed_at: Utc::now(),
                adopted,
            },
        );
        self.generated = Utc::now();
    }

    pub fn record_failed(&mut self, name: &str, attempts: u32, error: &str) {
        self.failed.insert(
            name.to_string(),
            FailedEntry {
                attempts,
                last_error: error.to_string(),
                last_attempt: Utc::now(),
            },
        );
        self.generated = Utc::now();
    }

    pub fn is_processed(&self, name: &str) -> bool {
        self.processed.contains_key(name)
    }

    pub fn get_processed(&self, name: &str) -> Option<&ProcessedEntry> {
        self.processed.get(name)
    }

    pub fn get_failed(&self, name: &str) -> Option<&FailedEntry> {
        self.failed.get(name)
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}
