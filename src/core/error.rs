// src/core/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for the campaign pipeline.
///
/// Only `Configuration`, `Authentication`, the transport variants and
/// `Cancelled` abort a campaign; everything else is caught close to where it
/// happens and degrades that unit of work.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication rejected by the scan service: {0}")]
    Authentication(String),

    #[error("transport failure during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("transport timeout during {operation} after {seconds}s")]
    TransportTimeout {
        operation: &'static str,
        seconds: u64,
    },

    #[error("malformed {command} response: {message}")]
    Protocol {
        command: &'static str,
        message: String,
    },

    #[error("failed to retrieve {artifact} report: {message}")]
    ArtifactRetrieval {
        artifact: &'static str,
        message: String,
    },

    #[error("failed to persist {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("campaign cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ScanError>;
