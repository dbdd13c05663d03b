// src/core/campaign.rs

use std::fs;
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::core::error::{Result, ScanError};
use crate::core::history::HistoricalTrendStore;
use crate::core::identity::IdentityAllocator;
use crate::core::lifecycle::{ScanLifecycleController, ScanParams, cancellation_requested};
use crate::core::models::{
    AuxScanResult, CampaignEvent, CampaignSummary, ExploitOutcome, ScanOutcome, SourceTool,
};
use crate::core::normalizer::FindingNormalizer;

/// Locations of the campaign's persistent state, all under one directory.
#[derive(Debug, Clone)]
pub struct CampaignPaths {
    state_dir: PathBuf,
}

impl CampaignPaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn vuln_mapping(&self) -> PathBuf {
        self.state_dir.join("vuln_mapping.json")
    }

    pub fn finding_mapping(&self) -> PathBuf {
        self.state_dir.join("finding_mapping.json")
    }

    pub fn historical_log(&self) -> PathBuf {
        self.state_dir.join("historical_results.json")
    }

    pub fn counts_file(&self) -> PathBuf {
        self.state_dir.join("counts.json")
    }
}

/// Composition root for one campaign: scan, normalize, aggregate, persist.
///
/// Only configuration, transport and cancellation abort a run; everything
/// downstream of a successful scan degrades per unit of work, because a
/// partial result set is worth more than none.
pub struct CampaignAggregator {
    controller: ScanLifecycleController,
    params: ScanParams,
    paths: CampaignPaths,
}

impl CampaignAggregator {
    pub fn new(params: ScanParams, state_dir: impl Into<PathBuf>) -> Self {
        Self::with_controller(ScanLifecycleController::new(), params, state_dir)
    }

    pub fn with_controller(
        controller: ScanLifecycleController,
        params: ScanParams,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            controller,
            params,
            paths: CampaignPaths::new(state_dir),
        }
    }

    pub fn paths(&self) -> &CampaignPaths {
        &self.paths
    }

    /// Run the whole campaign. `aux_results` are CSV files already produced
    /// by auxiliary scanners; `exploit` is the opaque outcome of the exploit
    /// stage, passed through into the counts unchanged.
    pub async fn run_campaign(
        &self,
        aux_results: &[AuxScanResult],
        exploit: Option<ExploitOutcome>,
        cancel: &mut watch::Receiver<bool>,
        events: &mpsc::Sender<CampaignEvent>,
    ) -> Result<CampaignSummary> {
        let _ = events.send(CampaignEvent::Stage("scan engine")).await;
        let outcome = self.controller.run_scan(&self.params, cancel, events).await?;

        if cancellation_requested(cancel) {
            return Err(ScanError::Cancelled);
        }

        let summary = build_summary(&outcome, exploit.as_ref());

        let Some(csv_path) = outcome.csv_path.as_deref() else {
            // No findings available: record what the run did produce and
            // skip normalization and the trend append entirely.
            warn!(status = %outcome.status, "no CSV report available, skipping normalization");
            self.write_counts(&summary);
            let _ = events.send(CampaignEvent::Completed(summary.clone())).await;
            return Ok(summary);
        };

        let _ = events.send(CampaignEvent::Stage("normalize")).await;
        let mut allocator =
            IdentityAllocator::load(self.paths.vuln_mapping(), self.paths.finding_mapping());
        let mut normalizer = FindingNormalizer::new(&mut allocator);
        match normalizer.normalize(SourceTool::OpenVas, csv_path) {
            Ok(batch) => info!(
                findings = batch.findings.len(),
                skipped = batch.skipped,
                "primary report normalized"
            ),
            Err(err) => error!(%err, "primary report normalization failed"),
        }
        for aux in aux_results {
            if cancellation_requested(cancel) {
                return Err(ScanError::Cancelled);
            }
            match normalizer.normalize(aux.tool, &aux.csv_path) {
                Ok(batch) => info!(
                    tool = %aux.tool,
                    findings = batch.findings.len(),
                    skipped = batch.skipped,
                    "auxiliary report normalized"
                ),
                Err(err) => error!(tool = %aux.tool, %err, "auxiliary report normalization failed"),
            }
        }

        let _ = events.send(CampaignEvent::Stage("aggregate")).await;
        self.write_counts(&summary);
        let history = HistoricalTrendStore::new(self.paths.historical_log());
        match history.append(
            summary.high_count,
            summary.medium_count,
            summary.low_count,
            None,
        ) {
            Ok(series) => info!(samples = series.len(), "trend sample appended"),
            Err(err) => error!(%err, "failed to append trend sample"),
        }

        let _ = events.send(CampaignEvent::Completed(summary.clone())).await;
        Ok(summary)
    }

    /// Persist `counts.json`. Best-effort: a write failure is logged, never
    /// fatal to the campaign.
    fn write_counts(&self, summary: &CampaignSummary) {
        let path = self.paths.counts_file();
        let raw = match serde_json::to_string_pretty(summary) {
            Ok(raw) => raw,
            Err(err) => {
                error!(%err, "failed to encode counts file");
                return;
            }
        };
        if let Err(err) = fs::write(&path, raw) {
            error!(path = %path.display(), %err, "failed to write counts file");
        }
    }
}

/// Severity counts come from the scan engine's own tally, never recomputed
/// from normalized findings — tools disagree on severity vocabularies and
/// recounting across them would double-count. Exploit counts pass through
/// unchanged.
pub fn build_summary(outcome: &ScanOutcome, exploit: Option<&ExploitOutcome>) -> CampaignSummary {
    CampaignSummary {
        hosts_count: outcome.hosts_count,
        apps_count: outcome.apps_count,
        os_count: outcome.os_count,
        high_count: outcome.high_count,
        medium_count: outcome.medium_count,
        low_count: outcome.low_count,
        exploitedcves: exploit.map(|e| e.exploited),
        incompatiblecves: exploit.map(|e| e.incompatible),
    }
}
