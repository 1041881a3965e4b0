use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use coffre_types::{CoffreError, Result};

use crate::storage::{store_config_from_location, StoreConfig};

/// The declarative configuration document: named repositories and the
/// scheduler's task sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Alias -> store config table. Task sets reference entries as
    /// `@alias`; a bare locator is treated as a literal location.
    #[serde(default)]
    pub repositories: BTreeMap<String, StoreConfig>,

    #[serde(default)]
    pub tasks: Vec<TaskSet>,
}

/// One named task set against one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSet {
    pub name: String,
    /// `@alias` or a literal location.
    pub repository: String,

    #[serde(default)]
    pub backup: Option<BackupTaskConfig>,
    #[serde(default)]
    pub check: Option<CheckTaskConfig>,
    #[serde(default)]
    pub restore: Option<RestoreTaskConfig>,
    #[serde(default)]
    pub sync: Option<SyncTaskConfig>,
    #[serde(default)]
    pub maintenance: Option<MaintenanceTaskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupTaskConfig {
    pub interval: String,
    pub path: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ignore_file: Option<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub pre_hook: Option<String>,
    #[serde(default)]
    pub post_hook: Option<String>,
    #[serde(default)]
    pub fail_hook: Option<String>,
    /// Run a full integrity check after each commit.
    #[serde(default)]
    pub check: bool,
    /// Snapshots older than this are removed after each backup.
    #[serde(default)]
    pub retention: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckTaskConfig {
    pub interval: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub latest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreTaskConfig {
    pub interval: String,
    pub target: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTaskConfig {
    pub interval: String,
    pub peer: String,
    /// "to", "from" or "with"; forwarded verbatim to the sync command.
    pub direction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceTaskConfig {
    pub interval: String,
    pub repository: String,
    #[serde(default)]
    pub retention: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CoffreError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&contents)
            .map_err(|e| CoffreError::Config(format!("{}: {e}", path.display())))
    }

    /// Resolve a repository reference: `@alias` is looked up in the
    /// repositories table, anything else is a literal location.
    pub fn resolve_repository(&self, reference: &str) -> Result<StoreConfig> {
        match reference.strip_prefix('@') {
            Some(alias) => self
                .repositories
                .get(alias)
                .cloned()
                .ok_or_else(|| {
                    CoffreError::Config(format!("unknown repository alias '@{alias}'"))
                }),
            None => Ok(store_config_from_location(reference)),
        }
    }
}

/// Parse a human-readable duration: `90s`, `15m`, `2h`, `1d`, or a bare
/// number of seconds.
pub fn parse_human_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CoffreError::Config("empty duration".into()));
    }

    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| CoffreError::Config(format!("invalid duration '{s}'")))?;

    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        "w" => value * 7 * 86_400,
        _ => {
            return Err(CoffreError::Config(format!(
                "invalid duration unit in '{s}' (use s, m, h, d, w)"
            )))
        }
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
repositories:
  nas:
    location: "fs:///backups/repo"
    passphrase: "hunter2"

tasks:
  - name: daily
    repository: "@nas"
    backup:
      interval: 1h
      path: /home/user
      tags: [daily]
      ignore:
        - "*.tmp"
      retention: 24h
      check: true
  - name: verify
    repository: "fs:///backups/other"
    check:
      interval: 1d
      latest: true
"#;

    #[test]
    fn parses_sample_document() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.repositories.len(), 1);
        assert_eq!(config.tasks.len(), 2);

        let backup = config.tasks[0].backup.as_ref().unwrap();
        assert_eq!(backup.interval, "1h");
        assert!(backup.check);
        assert_eq!(backup.retention.as_deref(), Some("24h"));

        let check = config.tasks[1].check.as_ref().unwrap();
        assert!(check.latest);
    }

    #[test]
    fn alias_resolution() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let resolved = config.resolve_repository("@nas").unwrap();
        assert_eq!(
            resolved.get("location").map(String::as_str),
            Some("fs:///backups/repo")
        );
        assert_eq!(
            resolved.get("passphrase").map(String::as_str),
            Some("hunter2")
        );
    }

    #[test]
    fn unknown_alias_is_an_error() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert!(config.resolve_repository("@missing").is_err());
    }

    #[test]
    fn bare_locator_is_literal_location() {
        let config = Config::default();
        let resolved = config.resolve_repository("fs:///tmp/x").unwrap();
        assert_eq!(
            resolved.get("location").map(String::as_str),
            Some("fs:///tmp/x")
        );
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_human_duration("90s").unwrap().as_secs(), 90);
        assert_eq!(parse_human_duration("15m").unwrap().as_secs(), 900);
        assert_eq!(parse_human_duration("2h").unwrap().as_secs(), 7200);
        assert_eq!(parse_human_duration("1d").unwrap().as_secs(), 86_400);
        assert_eq!(parse_human_duration("45").unwrap().as_secs(), 45);
    }

    #[test]
    fn bad_durations_rejected() {
        assert!(parse_human_duration("").is_err());
        assert!(parse_human_duration("h").is_err());
        assert!(parse_human_duration("10x").is_err());
        assert!(parse_human_duration("ten minutes").is_err());
    }
}
