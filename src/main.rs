// src/main.rs

use clap::Parser;
use color_eyre::eyre::Result;
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};

use aegiscan::config::{FileConfig, Overrides};
use aegiscan::core::campaign::CampaignAggregator;
use aegiscan::core::models::{AuxScanResult, CampaignEvent, SourceTool};
use aegiscan::logging;

/// Thin front end: parse flags, layer them over the config file, hand the
/// validated parameters to the campaign worker and print its progress.
#[derive(Debug, Parser)]
#[command(
    name = "aegiscan",
    version,
    about = "Coordinates vulnerability scan campaigns against a GVM-style scan service"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "aegiscan.toml")]
    config: PathBuf,

    /// Unix socket of the scan management service.
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Username for the scan service.
    #[arg(long)]
    username: Option<String>,

    /// Password for the scan service.
    #[arg(long)]
    password: Option<String>,

    /// Name of the target on the scan service (reused across runs).
    #[arg(long)]
    target_name: Option<String>,

    /// File with one target address per line.
    #[arg(long)]
    hosts_file: Option<PathBuf>,

    /// Port list reference for target creation.
    #[arg(long)]
    port_list_id: Option<String>,

    /// Name of the task to create and run.
    #[arg(long)]
    task_name: Option<String>,

    /// Scan configuration reference.
    #[arg(long)]
    scan_config_id: Option<String>,

    /// Scanner reference.
    #[arg(long)]
    scanner_id: Option<String>,

    /// Already-produced Nikto CSV files to fold into the finding set.
    #[arg(long = "nikto-csv")]
    nikto_csv: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let log_path = logging::initialize_logging()?;

    let mut config = FileConfig::load(&cli.config)?;
    config.apply_overrides(&Overrides {
        socket_path: cli.socket_path,
        username: cli.username,
        password: cli.password,
        target_name: cli.target_name,
        hosts_file: cli.hosts_file,
        port_list_id: cli.port_list_id,
        task_name: cli.task_name,
        scan_config_id: cli.scan_config_id,
        scanner_id: cli.scanner_id,
    });
    let resolved = config.validate()?;

    println!("aegiscan starting (log: {})", log_path.display());

    let aux: Vec<AuxScanResult> = cli
        .nikto_csv
        .into_iter()
        .map(|csv_path| AuxScanResult {
            tool: SourceTool::Nikto,
            csv_path,
        })
        .collect();
    let aggregator = CampaignAggregator::new(resolved.scan, resolved.state_dir);

    let (event_tx, mut event_rx) = mpsc::channel(64);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let worker = tokio::spawn(async move {
        let mut cancel = cancel_rx;
        aggregator
            .run_campaign(&aux, None, &mut cancel, &event_tx)
            .await
    });

    while let Some(event) = event_rx.recv().await {
        match event {
            CampaignEvent::Stage(stage) => println!(">>> {stage}"),
            CampaignEvent::Status(line) => println!("[INFO] {line}"),
            CampaignEvent::Completed(summary) => {
                println!();
                println!("- Hosts Scanned              : {}", summary.hosts_count);
                println!("- Applications Scanned       : {}", summary.apps_count);
                println!("- Operating Systems Scanned  : {}", summary.os_count);
                println!("- High Vulnerabilities       : {}", summary.high_count);
                println!("- Medium Vulnerabilities     : {}", summary.medium_count);
                println!("- Low Vulnerabilities        : {}", summary.low_count);
                if let (Some(exploited), Some(incompatible)) =
                    (summary.exploitedcves, summary.incompatiblecves)
                {
                    println!("- Exploited CVEs             : {exploited}");
                    println!("- CVEs Without Exploits      : {incompatible}");
                }
            }
        }
    }

    worker.await??;
    Ok(())
}
