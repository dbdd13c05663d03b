// src/core/identity.rs

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::core::error::{Result, ScanError};

const MID_PREFIX: &str = "MID";
const DID_PREFIX: &str = "DID";

/// Owner of the two persistent key→ID maps.
///
/// `allocate_mid` keys a vulnerability *type* (`{tool}:{native_id}`),
/// `allocate_did` keys one concrete *occurrence*
/// (`{tool}:{native_id}_{host}_{port}` plus an optional method/url suffix).
/// Both are get-or-create: a key seen before always yields the ID it was
/// first given, and new IDs continue from the highest numeric suffix present
/// in the map as loaded from disk, so independent process runs stay
/// monotonic without any carried-over counter.
///
/// The maps are whole files, read fully at construction and rewritten fully
/// on `persist`. Single-writer per map file for the duration of one campaign;
/// concurrent campaigns sharing a state directory are not supported.
pub struct IdentityAllocator {
    vuln_path: PathBuf,
    finding_path: PathBuf,
    vuln_mapping: BTreeMap<String, String>,
    finding_mapping: BTreeMap<String, String>,
}

impl IdentityAllocator {
    /// Load both maps. A missing file is an empty map; a corrupt or
    /// unreadable file is logged and treated as empty rather than propagated.
    pub fn load(vuln_path: impl Into<PathBuf>, finding_path: impl Into<PathBuf>) -> Self {
        let vuln_path = vuln_path.into();
        let finding_path = finding_path.into();
        let vuln_mapping = load_map(&vuln_path);
        let finding_mapping = load_map(&finding_path);
        debug!(
            vulns = vuln_mapping.len(),
            findings = finding_mapping.len(),
            "loaded identity maps"
        );
        Self {
            vuln_path,
            finding_path,
            vuln_mapping,
            finding_mapping,
        }
    }

    /// Stable ID for a vulnerability type.
    pub fn allocate_mid(&mut self, tool: &str, native_id: &str) -> String {
        let key = format!("{tool}:{native_id}");
        if let Some(existing) = self.vuln_mapping.get(&key) {
            return existing.clone();
        }
        let next = next_suffix(&self.vuln_mapping, MID_PREFIX);
        let mid = format!("{MID_PREFIX}{next:06}");
        self.vuln_mapping.insert(key, mid.clone());
        mid
    }

    /// Stable ID for one finding occurrence. `extra` carries tool-specific
    /// key material (e.g. `method_url` for web scanners) and extends the key
    /// verbatim.
    pub fn allocate_did(
        &mut self,
        tool: &str,
        native_id: &str,
        host: &str,
        port: &str,
        extra: Option<&str>,
    ) -> String {
        let mut key = format!("{tool}:{native_id}_{host}_{port}");
        if let Some(extra) = extra {
            key.push('_');
            key.push_str(extra);
        }
        if let Some(existing) = self.finding_mapping.get(&key) {
            return existing.clone();
        }
        let next = next_suffix(&self.finding_mapping, DID_PREFIX);
        let did = format!("{DID_PREFIX}{next:08}");
        self.finding_mapping.insert(key, did.clone());
        did
    }

    /// Rewrite both map files in full.
    pub fn persist(&self) -> Result<()> {
        write_map(&self.vuln_path, &self.vuln_mapping)?;
        write_map(&self.finding_path, &self.finding_mapping)
    }

    pub fn vuln_mapping(&self) -> &BTreeMap<String, String> {
        &self.vuln_mapping
    }

    pub fn finding_mapping(&self) -> &BTreeMap<String, String> {
        &self.finding_mapping
    }
}

/// Highest numeric suffix currently in the map, plus one. Always derived from
/// the map contents so that IDs are never reused, even across interleaved
/// process runs against the same file.
fn next_suffix(map: &BTreeMap<String, String>, prefix: &str) -> u64 {
    map.values()
        .filter_map(|id| id.strip_prefix(prefix))
        .filter_map(|digits| digits.parse::<u64>().ok())
        .max()
        .unwrap_or(0)
        + 1
}

fn load_map(path: &Path) -> BTreeMap<String, String> {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(err) => {
                error!(path = %path.display(), %err, "identity map is corrupt, starting empty");
                BTreeMap::new()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
        Err(err) => {
            error!(path = %path.display(), %err, "identity map is unreadable, starting empty");
            BTreeMap::new()
        }
    }
}

fn write_map(path: &Path, map: &BTreeMap<String, String>) -> Result<()> {
    let raw = serde_json::to_string_pretty(map).map_err(|err| ScanError::Persistence {
        path: path.to_path_buf(),
        source: std::io::Error::other(err),
    })?;
    fs::write(path, raw).map_err(|source| ScanError::Persistence {
        path: path.to_path_buf(),
        source,
    })
}
