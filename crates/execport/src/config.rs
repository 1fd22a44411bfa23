//! Node configuration, loaded from TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ExportError, Result};

// A century; keeps the TTL arithmetic in range.
const MAX_TTL_HOURS: i64 = 24 * 365 * 100;

/// Timing and pool size for one iterator (export or cleanup).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IteratorConfig {
    /// Seconds between ticks
    pub interval_secs: u64,
    /// How long a claim stays exclusive without renewal
    pub lease_secs: u64,
    /// Maximum jobs processed concurrently on this node
    pub pool_size: usize,
}

impl IteratorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

fn default_export_iterator() -> IteratorConfig {
    IteratorConfig {
        interval_secs: 15,
        lease_secs: 600,
        pool_size: 3,
    }
}

fn default_cleanup_iterator() -> IteratorConfig {
    IteratorConfig {
        interval_secs: 30 * 60,
        lease_secs: 300,
        pool_size: 2,
    }
}

/// Main configuration for an export node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Lease owner name; must be unique across the fleet
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Path to the shared job store
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Where archives are assembled before upload
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Root of the local blob storage
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,

    /// Prefix of the link handed out in READMEs and notifications
    #[serde(default = "default_download_base_url")]
    pub download_base_url: String,

    /// Executions per page
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Hours a READY archive stays downloadable
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Claims before a transient failure becomes terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Parallel single-id log queries when the log store lacks IN support
    #[serde(default = "default_log_fetch_concurrency")]
    pub log_fetch_concurrency: usize,

    /// Lifetime of the credentials behind one log store client
    #[serde(default = "default_log_client_ttl_secs")]
    pub log_client_ttl_secs: u64,

    /// Recreate the log client once it is this close to expiring
    #[serde(default = "default_log_refresh_margin_secs")]
    pub log_refresh_margin_secs: u64,

    #[serde(default = "default_export_iterator")]
    pub export: IteratorConfig,

    #[serde(default = "default_cleanup_iterator")]
    pub cleanup: IteratorConfig,
}

fn home_dir() -> PathBuf {
    execport_logging::execport_home().unwrap_or_else(|_| PathBuf::from(".execport"))
}

fn default_node_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "execport".to_string());
    format!("{}-{}", host, std::process::id())
}

fn default_database_path() -> PathBuf {
    home_dir().join("execport.sqlite3")
}

fn default_staging_dir() -> PathBuf {
    home_dir().join("staging")
}

fn default_blob_dir() -> PathBuf {
    home_dir().join("blobs")
}

fn default_download_base_url() -> String {
    "http://localhost:8080/api/export-executions/download".to_string()
}

fn default_batch_size() -> usize {
    20
}

fn default_ttl_hours() -> u64 {
    72
}

fn default_max_attempts() -> i32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    60
}

fn default_log_fetch_concurrency() -> usize {
    4
}

fn default_log_client_ttl_secs() -> u64 {
    60 * 60
}

fn default_log_refresh_margin_secs() -> u64 {
    5 * 60
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            database_path: default_database_path(),
            staging_dir: default_staging_dir(),
            blob_dir: default_blob_dir(),
            download_base_url: default_download_base_url(),
            batch_size: default_batch_size(),
            ttl_hours: default_ttl_hours(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            log_fetch_concurrency: default_log_fetch_concurrency(),
            log_client_ttl_secs: default_log_client_ttl_secs(),
            log_refresh_margin_secs: default_log_refresh_margin_secs(),
            export: default_export_iterator(),
            cleanup: default_cleanup_iterator(),
        }
    }
}

impl ExportConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ExportConfig =
            toml::from_str(&content).map_err(|e| ExportError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ExportError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(ExportError::Config("node_id must not be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ExportError::Config("batch_size must be positive".to_string()));
        }
        if self.max_attempts < 1 {
            return Err(ExportError::Config("max_attempts must be at least 1".to_string()));
        }
        for (name, it) in [("export", &self.export), ("cleanup", &self.cleanup)] {
            if it.pool_size == 0 || it.interval_secs == 0 || it.lease_secs == 0 {
                return Err(ExportError::Config(format!(
                    "[{}] interval_secs, lease_secs and pool_size must be positive",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn ttl(&self) -> chrono::Duration {
        let hours = i64::try_from(self.ttl_hours).unwrap_or(i64::MAX).min(MAX_TTL_HOURS);
        chrono::Duration::hours(hours)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn log_client_ttl(&self) -> chrono::Duration {
        secs_to_chrono(self.log_client_ttl_secs)
    }

    pub fn log_refresh_margin(&self) -> chrono::Duration {
        secs_to_chrono(self.log_refresh_margin_secs)
    }
}

fn secs_to_chrono(secs: u64) -> chrono::Duration {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(MAX_TTL_HOURS * 3600);
    chrono::Duration::seconds(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ExportConfig::default();
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.ttl_hours, 72);
        assert_eq!(config.export.pool_size, 3);
        assert_eq!(config.cleanup.pool_size, 2);
        assert!(config.cleanup.interval_secs > config.export.interval_secs);
        assert!(config.log_refresh_margin() < config.log_client_ttl());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("execport.toml");
        std::fs::write(
            &path,
            r#"
node_id = "node-a"
batch_size = 50

[export]
interval_secs = 5
lease_secs = 120
pool_size = 1
"#,
        )
        .unwrap();

        let config = ExportConfig::load(&path).unwrap();
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.export.pool_size, 1);
        assert_eq!(config.cleanup.interval_secs, 1800);
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn test_save_load_preserves_values() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("execport.toml");
        let config = ExportConfig {
            node_id: "node-b".to_string(),
            retry_delay_secs: 5,
            ..ExportConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = ExportConfig::load(&path).unwrap();
        assert_eq!(loaded.node_id, "node-b");
        assert_eq!(loaded.retry_delay_secs, 5);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "batch_size = 0\n").unwrap();

        let err = ExportConfig::load(&path).unwrap_err();
        assert!(matches!(err, ExportError::Config(_)));
    }
}
