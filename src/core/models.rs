// src/core/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// --- Wire-level enums ---

/// Task status string reported by the scan service.
///
/// Anything outside the known set is carried verbatim in `Other` so that a
/// service speaking a newer protocol revision cannot wedge the poll loop into
/// a parse error.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum TaskStatus {
    New,
    Requested,
    Queued,
    Running,
    Done,
    Stopped,
    Failed,
    #[strum(default, to_string = "{0}")]
    Other(String),
}

impl TaskStatus {
    /// A terminal status is one from which the task never transitions again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Stopped | TaskStatus::Failed)
    }
}

/// Threat label a source tool attached to one result row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
pub enum ThreatLevel {
    High,
    Medium,
    Low,
    Log,
    #[strum(default, to_string = "{0}")]
    Other(String),
}

impl ThreatLevel {
    /// Only High/Medium/Low participate in severity tallies; informational
    /// labels stay on the finding but never count.
    pub fn counts_toward_summary(&self) -> bool {
        matches!(self, ThreatLevel::High | ThreatLevel::Medium | ThreatLevel::Low)
    }
}

/// Identifies which scanner produced a raw result file.
///
/// The string form is the namespace prefix of every MID/DID key, which is
/// what keeps two tools with colliding native id conventions apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SourceTool {
    #[strum(to_string = "OpenVAS")]
    OpenVas,
    #[strum(to_string = "Nikto")]
    Nikto,
}

impl SourceTool {
    pub fn key_prefix(&self) -> &'static str {
        match self {
            SourceTool::OpenVas => "OpenVAS",
            SourceTool::Nikto => "Nikto",
        }
    }
}

// --- Raw rows ---

/// One row of an OpenVAS CSV report, fields already trimmed and emptied to
/// `None`. Column fallbacks (`NVT OID`/`OID`, `IP`/`Host`) are resolved
/// before the row is built.
#[derive(Debug, Clone, Default)]
pub struct OpenVasRow {
    pub nvt_oid: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub severity: Option<String>,
    pub cvss: Option<String>,
    pub summary: Option<String>,
    pub solution: Option<String>,
}

/// One row of a Nikto CSV report (headerless, fixed column order).
#[derive(Debug, Clone, Default)]
pub struct NiktoRow {
    pub host: Option<String>,
    pub port: Option<String>,
    pub reference: Option<String>,
    pub method: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
}

/// Tagged raw row, one variant per source tool. Converted into the canonical
/// `Finding` at the normalizer boundary.
#[derive(Debug, Clone)]
pub enum RawRow {
    OpenVas(OpenVasRow),
    Nikto(NiktoRow),
}

/// Why a raw row produced no finding. These are data-quality outcomes, not
/// errors; batches count them and the pipeline moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingVulnerabilityId,
    MissingHost,
}

// --- Canonical finding ---

/// A normalized finding: one vulnerability occurrence observed by one tool,
/// carrying its stable cross-run identifiers. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub tool: String,
    pub native_id: String,
    pub host: String,
    pub port: String,
    /// Label as the tool reported it; `None` for tools with no severity
    /// vocabulary of their own.
    pub severity: Option<ThreatLevel>,
    pub score: Option<f64>,
    pub summary: String,
    pub remediation: String,
    pub mid: String,
    pub did: String,
}

/// Result of normalizing one raw report file: findings in input order plus an
/// explicit count of rows that could not be keyed.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub findings: Vec<Finding>,
    pub skipped: usize,
}

// --- Scan / campaign outcomes ---

/// What one run of the scan lifecycle produced. `csv_path == None` means
/// "no findings available" and downstream consumers skip normalization for
/// the primary tool rather than failing.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub task_name: String,
    pub status: TaskStatus,
    pub csv_path: Option<PathBuf>,
    pub pdf_path: Option<PathBuf>,
    pub hosts_count: u32,
    pub apps_count: u32,
    pub os_count: u32,
    pub high_count: u32,
    pub medium_count: u32,
    pub low_count: u32,
}

impl ScanOutcome {
    /// Outcome for a task that ended without a usable report.
    pub fn without_report(task_name: &str, status: TaskStatus) -> Self {
        Self {
            task_name: task_name.to_string(),
            status,
            csv_path: None,
            pdf_path: None,
            hosts_count: 0,
            apps_count: 0,
            os_count: 0,
            high_count: 0,
            medium_count: 0,
            low_count: 0,
        }
    }
}

/// Counts handed back by the exploit stage, passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExploitOutcome {
    pub exploited: u32,
    pub incompatible: u32,
    pub report_file: Option<PathBuf>,
}

/// An auxiliary scanner's contribution: its tool tag plus the CSV it wrote.
#[derive(Debug, Clone)]
pub struct AuxScanResult {
    pub tool: SourceTool,
    pub csv_path: PathBuf,
}

/// The per-campaign counts file (`counts.json`). Field names are the wire
/// format consumed by dashboards; do not rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub hosts_count: u32,
    pub apps_count: u32,
    pub os_count: u32,
    pub high_count: u32,
    pub medium_count: u32,
    pub low_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exploitedcves: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incompatiblecves: Option<u32>,
}

/// One sample of the severity trend log, append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalSample {
    pub timestamp: DateTime<Utc>,
    pub high_count: u32,
    pub medium_count: u32,
    pub low_count: u32,
}

/// Progress events shipped from the campaign worker to whoever is watching
/// (CLI printer, a GUI, a log sink). Replaces the line queue the worker used
/// to share with its host process.
#[derive(Debug, Clone)]
pub enum CampaignEvent {
    Stage(&'static str),
    Status(String),
    Completed(CampaignSummary),
}
