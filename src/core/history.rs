// src/core/history.rs

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::core::error::{Result, ScanError};
use crate::core::models::HistoricalSample;

/// Append-only severity trend log (`historical_results.json`).
///
/// This is a dumb log: `append` pushes one sample and rewrites the file,
/// `load` returns whatever is on disk in file order. Consumers that plot the
/// series sort by timestamp themselves; the store never reorders, mutates or
/// deletes samples.
pub struct HistoricalTrendStore {
    path: PathBuf,
}

impl HistoricalTrendStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full series. A missing file is an empty series; a corrupt file is
    /// logged and treated as empty — trend history is best-effort and never
    /// blocks a campaign.
    pub fn load(&self) -> Vec<HistoricalSample> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(series) => series,
                Err(err) => {
                    error!(path = %self.path.display(), %err, "trend log is corrupt, treating as empty");
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                error!(path = %self.path.display(), %err, "trend log is unreadable, treating as empty");
                Vec::new()
            }
        }
    }

    /// Append one sample (timestamp defaults to now) and persist the whole
    /// series. Returns the updated series.
    pub fn append(
        &self,
        high_count: u32,
        medium_count: u32,
        low_count: u32,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoricalSample>> {
        let mut series = self.load();
        series.push(HistoricalSample {
            timestamp: timestamp.unwrap_or_else(Utc::now),
            high_count,
            medium_count,
            low_count,
        });
        let raw = serde_json::to_string_pretty(&series).map_err(|err| ScanError::Persistence {
            path: self.path.clone(),
            source: std::io::Error::other(err),
        })?;
        fs::write(&self.path, raw).map_err(|source| ScanError::Persistence {
            path: self.path.clone(),
            source,
        })?;
        debug!(samples = series.len(), "appended trend sample");
        Ok(series)
    }
}
