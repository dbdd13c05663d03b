// src/config.rs

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::{Result, ScanError};
use crate::core::lifecycle::ScanParams;

/// On-disk configuration (`aegiscan.toml`), mirroring the three concerns the
/// campaign needs: how to reach the service, what to scan, how to scan it.
/// Every field is optional here — flags fill the gaps and `validate` decides
/// what is actually required.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub target: TargetSection,
    #[serde(default)]
    pub task: TaskSection,
    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectionSection {
    pub socket_path: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TargetSection {
    pub target_name: Option<String>,
    pub hosts_file: Option<PathBuf>,
    pub port_list_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskSection {
    pub task_name: Option<String>,
    pub scan_config_id: Option<String>,
    pub scanner_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StorageSection {
    pub state_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
}

/// Command-line values layered over the file. `None` leaves the file value
/// untouched.
#[derive(Debug, Default)]
pub struct Overrides {
    pub socket_path: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub target_name: Option<String>,
    pub hosts_file: Option<PathBuf>,
    pub port_list_id: Option<String>,
    pub task_name: Option<String>,
    pub scan_config_id: Option<String>,
    pub scanner_id: Option<String>,
}

/// Fully validated campaign configuration.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub scan: ScanParams,
    pub state_dir: PathBuf,
}

impl FileConfig {
    /// A missing file is an empty config (everything may come from flags);
    /// a file that exists but does not parse is a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw).map_err(|err| {
                ScanError::Configuration(format!("cannot parse {}: {err}", path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ScanError::Configuration(format!(
                "cannot read {}: {err}",
                path.display()
            ))),
        }
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(v) = &overrides.socket_path {
            self.connection.socket_path = Some(v.clone());
        }
        if let Some(v) = &overrides.username {
            self.connection.username = Some(v.clone());
        }
        if let Some(v) = &overrides.password {
            self.connection.password = Some(v.clone());
        }
        if let Some(v) = &overrides.target_name {
            self.target.target_name = Some(v.clone());
        }
        if let Some(v) = &overrides.hosts_file {
            self.target.hosts_file = Some(v.clone());
        }
        if let Some(v) = &overrides.port_list_id {
            self.target.port_list_id = Some(v.clone());
        }
        if let Some(v) = &overrides.task_name {
            self.task.task_name = Some(v.clone());
        }
        if let Some(v) = &overrides.scan_config_id {
            self.task.scan_config_id = Some(v.clone());
        }
        if let Some(v) = &overrides.scanner_id {
            self.task.scanner_id = Some(v.clone());
        }
    }

    /// Check that every required setting is present and non-empty, and fill
    /// in storage defaults.
    pub fn validate(self) -> Result<ResolvedConfig> {
        let scan = ScanParams {
            socket_path: require(self.connection.socket_path, "[connection] socket_path")?,
            username: require_text(self.connection.username, "[connection] username")?,
            password: require_text(self.connection.password, "[connection] password")?,
            target_name: require_text(self.target.target_name, "[target] target_name")?,
            hosts_file: require(self.target.hosts_file, "[target] hosts_file")?,
            port_list_id: require_text(self.target.port_list_id, "[target] port_list_id")?,
            task_name: require_text(self.task.task_name, "[task] task_name")?,
            scan_config_id: require_text(self.task.scan_config_id, "[task] scan_config_id")?,
            scanner_id: require_text(self.task.scanner_id, "[task] scanner_id")?,
            reports_dir: self
                .storage
                .reports_dir
                .unwrap_or_else(|| PathBuf::from("openvas_reports")),
        };
        let state_dir = self.storage.state_dir.unwrap_or_else(|| PathBuf::from("."));
        Ok(ResolvedConfig { scan, state_dir })
    }
}

fn require<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| ScanError::Configuration(format!("missing required setting {name}")))
}

fn require_text(value: Option<String>, name: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ScanError::Configuration(format!(
            "missing required setting {name}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FULL_CONFIG: &str = r#"
[connection]
socket_path = "/run/gvmd/gvmd.sock"
username = "admin"
password = "secret"

[target]
target_name = "lab"
hosts_file = "targets.txt"
port_list_id = "pl-1"

[task]
task_name = "weekly"
scan_config_id = "cfg-1"
scanner_id = "sc-1"
"#;

    #[test]
    fn full_file_validates_with_storage_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aegiscan.toml");
        std::fs::write(&path, FULL_CONFIG).unwrap();

        let resolved = FileConfig::load(&path).unwrap().validate().unwrap();
        assert_eq!(resolved.scan.username, "admin");
        assert_eq!(resolved.scan.reports_dir, PathBuf::from("openvas_reports"));
        assert_eq!(resolved.state_dir, PathBuf::from("."));
    }

    #[test]
    fn missing_file_is_an_empty_config() {
        let dir = TempDir::new().unwrap();
        let config = FileConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(config.connection.username.is_none());
    }

    #[test]
    fn unparsable_file_is_a_configuration_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aegiscan.toml");
        std::fs::write(&path, "[connection\nbroken").unwrap();
        assert!(matches!(
            FileConfig::load(&path),
            Err(ScanError::Configuration(_))
        ));
    }

    #[test]
    fn overrides_replace_only_provided_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aegiscan.toml");
        std::fs::write(&path, FULL_CONFIG).unwrap();

        let mut config = FileConfig::load(&path).unwrap();
        config.apply_overrides(&Overrides {
            username: Some("auditor".to_string()),
            ..Overrides::default()
        });
        let resolved = config.validate().unwrap();
        assert_eq!(resolved.scan.username, "auditor");
        assert_eq!(resolved.scan.password, "secret");
    }

    #[test]
    fn validation_names_the_missing_setting() {
        let mut config = FileConfig::default();
        config.connection.socket_path = Some(PathBuf::from("/tmp/s.sock"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("[connection] username"));
    }

    #[test]
    fn blank_strings_do_not_satisfy_required_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aegiscan.toml");
        std::fs::write(&path, FULL_CONFIG.replace("\"admin\"", "\"  \"")).unwrap();
        let err = FileConfig::load(&path).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("[connection] username"));
    }
}
