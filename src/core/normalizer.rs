// src/core/normalizer.rs

use csv::StringRecord;
use std::path::Path;
use tracing::{info, warn};

use crate::core::error::{Result, ScanError};
use crate::core::identity::IdentityAllocator;
use crate::core::models::{
    Finding, NiktoRow, NormalizedBatch, OpenVasRow, RawRow, SkipReason, SourceTool, ThreatLevel,
};

const MID_COLUMN: &str = "MID";
const DID_COLUMN: &str = "DID";

/// Nikto emits no header row; this is its fixed column order.
const NIKTO_FIELDS: [&str; 7] = [
    "Host IP",
    "Hostname",
    "Port",
    "Reference",
    "Method",
    "URL",
    "Description",
];

/// Turns tool-specific CSV rows into canonical `Finding`s and rewrites the
/// source file in place with appended `MID`/`DID` columns so that downstream
/// report consumers can show stable identifiers.
///
/// The rewrite happens exactly once per file: a file whose header already
/// carries both columns is recognized as normalized and is left untouched
/// (the findings are still produced — the allocator hands back the same IDs).
/// Rows that cannot be keyed are dropped from the rewritten file and counted
/// in the batch, matching the degraded-but-useful output policy.
pub struct FindingNormalizer<'a> {
    allocator: &'a mut IdentityAllocator,
}

impl<'a> FindingNormalizer<'a> {
    pub fn new(allocator: &'a mut IdentityAllocator) -> Self {
        Self { allocator }
    }

    pub fn normalize(&mut self, tool: SourceTool, csv_path: &Path) -> Result<NormalizedBatch> {
        match tool {
            SourceTool::OpenVas => self.normalize_openvas(csv_path),
            SourceTool::Nikto => self.normalize_nikto(csv_path),
        }
    }

    fn normalize_openvas(&mut self, csv_path: &Path) -> Result<NormalizedBatch> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(csv_path)
            .map_err(|source| csv_error(csv_path, source))?;
        let headers = reader
            .headers()
            .map_err(|source| csv_error(csv_path, source))?
            .clone();
        let records: Vec<StringRecord> = reader
            .records()
            .collect::<std::result::Result<_, _>>()
            .map_err(|source| csv_error(csv_path, source))?;

        let already_normalized =
            has_column(&headers, MID_COLUMN) && has_column(&headers, DID_COLUMN);
        let column_count = headers.len();

        let mut batch = NormalizedBatch::default();
        let mut kept: Vec<(StringRecord, String, String)> = Vec::new();
        for record in records {
            let row = OpenVasRow {
                nvt_oid: field(&headers, &record, "NVT OID")
                    .or_else(|| field(&headers, &record, "OID")),
                host: field(&headers, &record, "IP").or_else(|| field(&headers, &record, "Host")),
                port: field(&headers, &record, "Port"),
                severity: field(&headers, &record, "Severity"),
                cvss: field(&headers, &record, "CVSS"),
                summary: field(&headers, &record, "Summary")
                    .or_else(|| field(&headers, &record, "NVT Name")),
                solution: field(&headers, &record, "Solution"),
            };
            match self.convert(RawRow::OpenVas(row)) {
                Ok(finding) => {
                    kept.push((record, finding.mid.clone(), finding.did.clone()));
                    batch.findings.push(finding);
                }
                Err(reason) => {
                    warn!(?reason, row = ?record, "skipping unkeyable result row");
                    batch.skipped += 1;
                }
            }
        }

        if batch.findings.is_empty() {
            warn!(path = %csv_path.display(), "no rows were normalized");
            return Ok(batch);
        }
        if !already_normalized {
            let mut out_headers = headers.clone();
            out_headers.push_field(MID_COLUMN);
            out_headers.push_field(DID_COLUMN);
            rewrite_csv(csv_path, &out_headers, &kept, column_count)?;
        }
        self.allocator.persist()?;
        info!(
            path = %csv_path.display(),
            findings = batch.findings.len(),
            skipped = batch.skipped,
            "report augmented with MIDs and DIDs"
        );
        Ok(batch)
    }

    fn normalize_nikto(&mut self, csv_path: &Path) -> Result<NormalizedBatch> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(csv_path)
            .map_err(|source| csv_error(csv_path, source))?;
        let records: Vec<StringRecord> = reader
            .records()
            .collect::<std::result::Result<_, _>>()
            .map_err(|source| csv_error(csv_path, source))?;

        // A previous normalization pass wrote a header row; raw tool output
        // has none.
        let has_header = records
            .first()
            .is_some_and(|r| r.get(0).map(str::trim) == Some(NIKTO_FIELDS[0]));
        let already_normalized = has_header
            && records[0].iter().any(|f| f.trim() == MID_COLUMN)
            && records[0].iter().any(|f| f.trim() == DID_COLUMN);
        let data_rows = if has_header { &records[1..] } else { &records[..] };

        let mut batch = NormalizedBatch::default();
        let mut kept: Vec<(StringRecord, String, String)> = Vec::new();
        for record in data_rows {
            // The tool interleaves banner lines with result rows.
            if record.iter().any(|f| f.trim_start().starts_with("Nikto")) {
                continue;
            }
            let row = NiktoRow {
                host: index_field(record, 0).or_else(|| index_field(record, 1)),
                port: index_field(record, 2),
                reference: index_field(record, 3),
                method: index_field(record, 4),
                url: index_field(record, 5),
                description: index_field(record, 6),
            };
            match self.convert(RawRow::Nikto(row)) {
                Ok(finding) => {
                    kept.push((record.clone(), finding.mid.clone(), finding.did.clone()));
                    batch.findings.push(finding);
                }
                Err(reason) => {
                    warn!(?reason, row = ?record, "skipping unkeyable result row");
                    batch.skipped += 1;
                }
            }
        }

        if batch.findings.is_empty() {
            warn!(path = %csv_path.display(), "no rows were normalized");
            return Ok(batch);
        }
        if !already_normalized {
            let mut out_headers = StringRecord::from(NIKTO_FIELDS.to_vec());
            out_headers.push_field(MID_COLUMN);
            out_headers.push_field(DID_COLUMN);
            rewrite_csv(csv_path, &out_headers, &kept, NIKTO_FIELDS.len())?;
        }
        self.allocator.persist()?;
        info!(
            path = %csv_path.display(),
            findings = batch.findings.len(),
            skipped = batch.skipped,
            "report augmented with MIDs and DIDs"
        );
        Ok(batch)
    }

    /// Boundary conversion from a tagged raw row to the canonical finding.
    fn convert(&mut self, row: RawRow) -> std::result::Result<Finding, SkipReason> {
        match row {
            RawRow::OpenVas(row) => {
                let native_id = row.nvt_oid.ok_or(SkipReason::MissingVulnerabilityId)?;
                let host = row.host.ok_or(SkipReason::MissingHost)?;
                let port = row.port.unwrap_or_else(|| "unknown_port".to_string());
                let tool = SourceTool::OpenVas.key_prefix();
                let mid = self.allocator.allocate_mid(tool, &native_id);
                let did = self
                    .allocator
                    .allocate_did(tool, &native_id, &host, &port, None);
                Ok(Finding {
                    tool: tool.to_string(),
                    native_id,
                    host,
                    port,
                    severity: row.severity.map(|s| parse_threat(&s)),
                    score: row.cvss.and_then(|c| c.parse().ok()),
                    summary: row.summary.unwrap_or_default(),
                    remediation: row.solution.unwrap_or_default(),
                    mid,
                    did,
                })
            }
            RawRow::Nikto(row) => {
                let native_id = row
                    .reference
                    .clone()
                    .or_else(|| row.description.clone())
                    .ok_or(SkipReason::MissingVulnerabilityId)?;
                let host = row.host.ok_or(SkipReason::MissingHost)?;
                let port = row.port.unwrap_or_else(|| "unknown_port".to_string());
                let method = row.method.unwrap_or_else(|| "unknown_method".to_string());
                let url = row.url.unwrap_or_else(|| "unknown_url".to_string());
                let tool = SourceTool::Nikto.key_prefix();
                let mid = self.allocator.allocate_mid(tool, &native_id);
                let extra = format!("{method}_{url}");
                let did =
                    self.allocator
                        .allocate_did(tool, &native_id, &host, &port, Some(&extra));
                Ok(Finding {
                    tool: tool.to_string(),
                    native_id,
                    host,
                    port,
                    severity: None,
                    score: None,
                    summary: row.description.unwrap_or_default(),
                    remediation: String::new(),
                    mid,
                    did,
                })
            }
        }
    }
}

fn parse_threat(label: &str) -> ThreatLevel {
    label
        .parse()
        .unwrap_or_else(|_| ThreatLevel::Other(label.to_string()))
}

fn has_column(headers: &StringRecord, name: &str) -> bool {
    headers.iter().any(|h| h.trim() == name)
}

fn field(headers: &StringRecord, record: &StringRecord, name: &str) -> Option<String> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .and_then(|idx| record.get(idx))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

fn index_field(record: &StringRecord, idx: usize) -> Option<String> {
    record
        .get(idx)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

fn csv_error(path: &Path, source: csv::Error) -> ScanError {
    ScanError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// Rewrite the file with the given header and each kept row padded to the
/// original column count before `MID`/`DID` are appended.
fn rewrite_csv(
    path: &Path,
    headers: &StringRecord,
    rows: &[(StringRecord, String, String)],
    pad_to: usize,
) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).map_err(|source| csv_error(path, source))?;
    writer
        .write_record(headers)
        .map_err(|source| csv_error(path, source))?;
    for (record, mid, did) in rows {
        let mut out = StringRecord::new();
        for value in record.iter() {
            out.push_field(value);
        }
        while out.len() < pad_to {
            out.push_field("");
        }
        out.push_field(mid);
        out.push_field(did);
        writer
            .write_record(&out)
            .map_err(|source| csv_error(path, source))?;
    }
    writer.flush().map_err(|source| ScanError::Persistence {
        path: path.to_path_buf(),
        source,
    })
}
