// src/logging.rs

use color_eyre::eyre::Result;
use directories::ProjectDirs;
use lazy_static::lazy_static;
use std::path::PathBuf;
use tracing_error::ErrorLayer;
use tracing_subscriber::{self, EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

lazy_static! {
    pub static ref LOG_ENV: String =
        format!("{}_LOGLEVEL", env!("CARGO_CRATE_NAME").to_uppercase());
    pub static ref LOG_FILE: String = format!("{}.log", env!("CARGO_PKG_NAME"));
}

/// Platform data directory for the log file, with a cwd fallback for
/// environments without a resolvable home.
pub fn log_directory() -> PathBuf {
    match ProjectDirs::from("io", "aegiscan", env!("CARGO_PKG_NAME")) {
        Some(dirs) => dirs.data_local_dir().join("logs"),
        None => PathBuf::from(".").join("logs"),
    }
}

/// File-based tracing setup. The level comes from `RUST_LOG`, then the
/// crate-specific `AEGISCAN_LOGLEVEL`, then defaults to info for this crate.
/// Returns the log file path so the CLI can tell the user where to look.
pub fn initialize_logging() -> Result<PathBuf> {
    let directory = log_directory();
    std::fs::create_dir_all(&directory)?;
    let log_path = directory.join(LOG_FILE.clone());
    let log_file = std::fs::File::create(&log_path)?;

    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var(LOG_ENV.clone()))
        .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_target(false)
        .with_ansi(false)
        .with_filter(EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(ErrorLayer::default())
        .init();

    Ok(log_path)
}
