//! In-memory bookkeeping for one ingestion run
//!
//! Tracks which frames have been seen, which are done and which keep failing.
//! Nothing here touches the filesystem.

use crate::error::{IngestError, Result};
use std::collections::{HashMap, HashSet};

/// Failure record for a single frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub attempts: u32,
    pub last_error: String,
}

/// Known, processed and failed frames of the current run
#[derive(Debug, Clone)]
pub struct IngestSession {
    /// Discovery order
    known: Vec<String>,
    known_set: HashSet<String>,
    processed: HashSet<String>,
    failures: HashMap<String, FailureRecord>,
    max_attempts: u32,
}

impl IngestSession {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            known: Vec::new(),
            known_set: HashSet::new(),
            processed: HashSet::new(),
            failures: HashMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Add names from a scan and return the ones seen for the first time
    pub fn observe<I, S>(&mut self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fresh = Vec::new();
        for name in names {
            let name = name.into();
            if self.known_set.insert(name.clone()) {
                self.known.push(name.clone());
                fresh.push(name);
            }
        }
        fresh
    }

    /// Known names that are neither processed nor exhausted, in discovery order
    pub fn pending(&self) -> Vec<String> {
        self.known
            .iter()
            .filter(|name| !self.processed.contains(*name) && !self.is_exhausted(name))
            .cloned()
            .collect()
    }

    pub fn mark_processed(&mut self, name: &str) -> Result<()> {
        if !self.known_set.contains(name) {
            return Err(IngestError::UnknownFile(name.to_string()));
        }
        self.failures.remove(name);
        self.processed.insert(name.to_string());
        Ok(())
    }

    /// Record a failed attempt and return the attempt count so far
    pub fn mark_failed(&mut self, name: &str, error: impl Into<String>) -> Result<u32> {
        if !self.known_set.contains(name) {
            return Err(IngestError::UnknownFile(name.to_string()));
        }
        let record = self
            .failures
            .entry(name.to_string())
            .or_insert(FailureRecord {
                attempts: 0,
                last_error: String::new(),
            });
        record.attempts += 1;
        record.last_error = error.into();
        Ok(record.attempts)
    }

    pub fn is_exhausted(&self, name: &str) -> bool {
        self.failures
            .get(name)
            .is_some_and(|record| record.attempts >= self.max_attempts)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.known_set.contains(name)
    }

    pub fn is_processed(&self, name: &str) -> bool {
        self.processed.contains(name)
    }

    pub fn failure(&self, name: &str) -> Option<&FailureRecord> {
        self.failures.get(name)
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Frames with at least one failed attempt and no success yet
    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }

    pub fn exhausted_count(&self) -> usize {
        self.failures
            .values()
            .filter(|record| record.attempts >= self.max_attempts)
            .count()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
