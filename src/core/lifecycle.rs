// src/core/lifecycle.rs

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::core::error::{Result, ScanError};
use crate::core::gmp::{self, GmpClient};
use crate::core::models::{CampaignEvent, ScanOutcome, TaskStatus};

/// Everything one scan run needs: service endpoint, credentials, target and
/// task references. Validated by the config layer before it gets here.
#[derive(Debug, Clone)]
pub struct ScanParams {
    pub socket_path: PathBuf,
    pub username: String,
    pub password: String,
    pub target_name: String,
    pub hosts_file: PathBuf,
    pub port_list_id: String,
    pub task_name: String,
    pub scan_config_id: String,
    pub scanner_id: String,
    pub reports_dir: PathBuf,
}

/// Drives the remote scan protocol for one campaign:
/// resolve-or-create target, create task, start, poll to a terminal state,
/// retrieve the summary/PDF/CSV renditions.
///
/// Within a campaign the stages are strictly sequential. The only suspension
/// points are the poll sleep and the socket exchanges, and every sleep races
/// a cancellation signal so a caller can abandon the wait without killing the
/// process (the remote task keeps running server-side either way).
pub struct ScanLifecycleController {
    poll_interval: Duration,
    settle_delay: Duration,
}

impl Default for ScanLifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanLifecycleController {
    pub fn new() -> Self {
        Self {
            // 30s balances responsiveness against load on the service
            poll_interval: Duration::from_secs(30),
            settle_delay: Duration::from_secs(5),
        }
    }

    /// Intervals scaled down for tests and impatient callers.
    pub fn with_intervals(poll_interval: Duration, settle_delay: Duration) -> Self {
        Self {
            poll_interval,
            settle_delay,
        }
    }

    pub async fn run_scan(
        &self,
        params: &ScanParams,
        cancel: &mut watch::Receiver<bool>,
        events: &mpsc::Sender<CampaignEvent>,
    ) -> Result<ScanOutcome> {
        let hosts = read_hosts_file(&params.hosts_file)?;
        // The transport timeout scales with campaign size; it bounds each
        // exchange, never the scan itself.
        let timeout = Duration::from_secs(hosts.len().max(1) as u64 * 3600);
        info!(hosts = hosts.len(), timeout_s = timeout.as_secs(), "starting scan lifecycle");

        let mut client = GmpClient::connect(&params.socket_path, timeout).await?;
        client
            .authenticate(&params.username, &params.password)
            .await?;
        let _ = events
            .send(CampaignEvent::Status(
                "authenticated with the scan service".to_string(),
            ))
            .await;

        if cancellation_requested(cancel) {
            return Err(ScanError::Cancelled);
        }

        let target_id = self
            .resolve_target(&mut client, params, &hosts, events)
            .await?;

        // Tasks are never reused: a fresh one per campaign keeps the remote
        // scan history usable for trend tracking.
        let task_id = client
            .create_task(
                &params.task_name,
                &params.scan_config_id,
                &target_id,
                &params.scanner_id,
            )
            .await?;
        info!(task = %params.task_name, id = %task_id, "task created");
        let _ = events
            .send(CampaignEvent::Status(format!(
                "task created with id {task_id}"
            )))
            .await;

        // The service needs a beat to register the task before it will start.
        self.wait(cancel, self.settle_delay).await?;
        let report_id = client.start_task(&task_id).await?;
        info!(id = %task_id, report = %report_id, "task started");
        let _ = events
            .send(CampaignEvent::Status("scanning...".to_string()))
            .await;

        let status = self.poll_until_terminal(&mut client, &task_id, cancel).await?;
        info!(%status, "scan reached terminal state");
        let _ = events
            .send(CampaignEvent::Status(format!(
                "scan completed, status: {status}"
            )))
            .await;

        if status != TaskStatus::Done {
            warn!(%status, "task ended without a report, skipping retrieval");
            return Ok(ScanOutcome::without_report(&params.task_name, status));
        }

        self.retrieve_artifacts(&mut client, &report_id, params, status, cancel, events)
            .await
    }

    /// Idempotent target resolution: reuse the remote target whose name
    /// matches exactly, create one otherwise. Never creates a duplicate for
    /// the same name within a run.
    async fn resolve_target(
        &self,
        client: &mut GmpClient,
        params: &ScanParams,
        hosts: &[String],
        events: &mpsc::Sender<CampaignEvent>,
    ) -> Result<String> {
        let existing = client
            .get_targets()
            .await?
            .into_iter()
            .find(|t| t.name == params.target_name);
        match existing {
            Some(target) => {
                info!(target = %params.target_name, id = %target.id, "target already exists, reusing");
                let _ = events
                    .send(CampaignEvent::Status(format!(
                        "target {} already exists with id {}",
                        params.target_name, target.id
                    )))
                    .await;
                Ok(target.id)
            }
            None => {
                let id = client
                    .create_target(&params.target_name, &hosts.join(","), &params.port_list_id)
                    .await?;
                info!(target = %params.target_name, id = %id, "target created");
                let _ = events
                    .send(CampaignEvent::Status(format!(
                        "target {} created with id {id}",
                        params.target_name
                    )))
                    .await;
                Ok(id)
            }
        }
    }

    /// Sleep-then-check until the status is one of Done/Stopped/Failed. Any
    /// other status, known or not, keeps the loop going.
    async fn poll_until_terminal(
        &self,
        client: &mut GmpClient,
        task_id: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<TaskStatus> {
        let mut status = TaskStatus::Other(String::new());
        while !status.is_terminal() {
            self.wait(cancel, self.poll_interval).await?;
            status = client.task_status(task_id).await?;
            debug!(%status, "polled task status");
        }
        Ok(status)
    }

    /// Fetch the three report renditions. Each retrieval is independent:
    /// losing one artifact degrades the outcome, it never ends the campaign.
    async fn retrieve_artifacts(
        &self,
        client: &mut GmpClient,
        report_id: &str,
        params: &ScanParams,
        status: TaskStatus,
        cancel: &mut watch::Receiver<bool>,
        events: &mpsc::Sender<CampaignEvent>,
    ) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::without_report(&params.task_name, status);
        fs::create_dir_all(&params.reports_dir).map_err(|source| ScanError::Persistence {
            path: params.reports_dir.clone(),
            source,
        })?;
        let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");

        match self.fetch_summary(client, report_id).await {
            Ok(counts) => {
                outcome.hosts_count = counts.hosts;
                outcome.os_count = counts.os;
                outcome.apps_count = counts.apps;
                outcome.high_count = counts.high;
                outcome.medium_count = counts.medium;
                outcome.low_count = counts.low;
                let _ = events
                    .send(CampaignEvent::Status(format!(
                        "summary: {} hosts, {} high / {} medium / {} low",
                        counts.hosts, counts.high, counts.medium, counts.low
                    )))
                    .await;
            }
            Err(err) => error!(%err, "summary retrieval failed"),
        }

        match self
            .fetch_payload(client, report_id, gmp::PDF_REPORT_FORMAT_ID, "PDF")
            .await
        {
            Ok(bytes) => {
                let path = params
                    .reports_dir
                    .join(format!("openvas_{}_report_{stamp}.pdf", params.task_name));
                match fs::write(&path, bytes) {
                    Ok(()) => {
                        info!(path = %path.display(), "PDF report downloaded");
                        let _ = events
                            .send(CampaignEvent::Status(format!(
                                "PDF report downloaded as {}",
                                path.display()
                            )))
                            .await;
                        outcome.pdf_path = Some(path);
                    }
                    Err(err) => error!(%err, "failed to write PDF report"),
                }
            }
            Err(err) => error!(%err, "PDF retrieval failed"),
        }

        // The CSV rendition can lag behind the Done status while the service
        // renders it.
        self.wait(cancel, self.settle_delay).await?;
        match self
            .fetch_payload(client, report_id, gmp::CSV_REPORT_FORMAT_ID, "CSV")
            .await
        {
            Ok(bytes) => {
                let path = params
                    .reports_dir
                    .join(format!("{}_report_{stamp}.csv", params.task_name));
                match fs::write(&path, bytes) {
                    Ok(()) => {
                        info!(path = %path.display(), "CSV report downloaded");
                        let _ = events
                            .send(CampaignEvent::Status(format!(
                                "CSV report downloaded as {}",
                                path.display()
                            )))
                            .await;
                        outcome.csv_path = Some(path);
                    }
                    Err(err) => error!(%err, "failed to write CSV report"),
                }
            }
            Err(err) => error!(%err, "CSV retrieval failed"),
        }

        Ok(outcome)
    }

    async fn fetch_summary(
        &self,
        client: &mut GmpClient,
        report_id: &str,
    ) -> Result<gmp::ReportCounts> {
        let raw = client
            .get_report(report_id, gmp::XML_REPORT_FORMAT_ID)
            .await
            .map_err(|err| ScanError::ArtifactRetrieval {
                artifact: "summary",
                message: err.to_string(),
            })?;
        gmp::summary_counts(&raw).map_err(|err| ScanError::ArtifactRetrieval {
            artifact: "summary",
            message: err.to_string(),
        })
    }

    async fn fetch_payload(
        &self,
        client: &mut GmpClient,
        report_id: &str,
        format_id: &str,
        artifact: &'static str,
    ) -> Result<Vec<u8>> {
        let raw = client
            .get_report(report_id, format_id)
            .await
            .map_err(|err| ScanError::ArtifactRetrieval {
                artifact,
                message: err.to_string(),
            })?;
        gmp::report_payload(&raw).map_err(|err| ScanError::ArtifactRetrieval {
            artifact,
            message: err.to_string(),
        })
    }

    /// Cancellable sleep: a fixed-interval wait that a cancellation signal
    /// can cut short.
    async fn wait(&self, cancel: &mut watch::Receiver<bool>, duration: Duration) -> Result<()> {
        if cancellation_requested(cancel) {
            return Err(ScanError::Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancelled(cancel) => Err(ScanError::Cancelled),
        }
    }
}

/// Checked between stages so a cancel request lands at the next boundary
/// even when no sleep is pending.
pub fn cancellation_requested(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    // If the cancel handle is gone nobody can cancel us anymore; park the
    // future instead of resolving.
    if cancel.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Newline-delimited host list: trimmed, empty lines dropped. An empty list
/// is a configuration error surfaced before any connection is attempted.
pub fn read_hosts_file(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path).map_err(|err| {
        ScanError::Configuration(format!("cannot read hosts file {}: {err}", path.display()))
    })?;
    let hosts: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect();
    if hosts.is_empty() {
        return Err(ScanError::Configuration(format!(
            "no hosts found in file: {}",
            path.display()
        )));
    }
    Ok(hosts)
}
