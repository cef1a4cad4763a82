//! Daemon configuration.
//!
//! Loaded from a TOML file; every path and interval has a default derived
//! from the platform data directory so a bare config file works.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::{IntegrityPolicy, ViolationAction};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    /// Base directory for all daemon state.
    pub data_dir: PathBuf,
    /// Deploy root; `{data_dir}/deploy` when unset.
    pub deploy_root: Option<PathBuf>,
    /// Backup root; `{data_dir}/backups` when unset.
    pub backup_dir: Option<PathBuf>,
    /// Quarantine directory for tampered deployments; tampered trees are
    /// deleted instead of moved when unset.
    pub quarantine_dir: Option<PathBuf>,
    /// Wrapper script directory; no wrappers when unset.
    pub bin_dir: Option<PathBuf>,
    /// SQLite path; `{data_dir}/shield.sqlite` when unset.
    pub db_path: Option<PathBuf>,

    pub poll_interval_ms: u64,
    pub debounce_ms: u64,
    pub on_modified: ViolationAction,
    pub on_deleted: ViolationAction,

    pub marketplace_url: Option<url::Url>,
    pub analyzer_url: Option<url::Url>,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agenshield");
        Self {
            data_dir,
            deploy_root: None,
            backup_dir: None,
            quarantine_dir: None,
            bin_dir: None,
            db_path: None,
            poll_interval_ms: 30_000,
            debounce_ms: 500,
            on_modified: ViolationAction::Reinstall,
            on_deleted: ViolationAction::Reinstall,
            marketplace_url: None,
            analyzer_url: None,
        }
    }
}

impl ShieldConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: ShieldConfig = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn deploy_root(&self) -> PathBuf {
        self.deploy_root
            .clone()
            .unwrap_or_else(|| self.data_dir.join("deploy"))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backups"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("shield.sqlite"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn default_policy(&self) -> IntegrityPolicy {
        IntegrityPolicy {
            on_modified: self.on_modified,
            on_deleted: self.on_deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_from_data_dir() {
        let config = ShieldConfig {
            data_dir: PathBuf::from("/tmp/shield-test"),
            ..Default::default()
        };
        assert_eq!(config.deploy_root(), PathBuf::from("/tmp/shield-test/deploy"));
        assert_eq!(config.backup_dir(), PathBuf::from("/tmp/shield-test/backups"));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/shield-test/shield.sqlite"));
        assert_eq!(config.poll_interval(), Duration::from_millis(30_000));
        assert_eq!(config.debounce(), Duration::from_millis(500));
    }

    #[test]
    fn partial_toml_round_trips() {
        let config: ShieldConfig = toml::from_str(
            r#"
            data_dir = "/srv/agenshield"
            poll_interval_ms = 5000
            on_modified = "quarantine"
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/agenshield"));
        assert_eq!(config.poll_interval_ms, 5000);
        assert_eq!(config.on_modified, ViolationAction::Quarantine);
        assert_eq!(config.on_deleted, ViolationAction::Reinstall);
    }
}
