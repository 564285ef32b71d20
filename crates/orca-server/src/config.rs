//! Server configuration.

use anyhow::Context;
use orca_core::config::OrcaConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One HTTP analysis provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Unique provider name
    pub name: String,
    /// URL the subject snapshot is POSTed to
    pub endpoint: String,
    /// Consent permissions this provider needs
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Per-provider timeout override
    pub timeout_ms: Option<u64>,
    /// Environment variable holding a bearer token for the endpoint
    pub bearer_token_env: Option<String>,
}

/// Background maintenance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Interval between physical evictions of expired entries (0 = disabled)
    pub purge_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            purge_interval_secs: 3_600,
        }
    }
}

impl MaintenanceConfig {
    pub fn purge_interval(&self) -> Option<Duration> {
        (self.purge_interval_secs > 0).then(|| Duration::from_secs(self.purge_interval_secs))
    }
}

/// Contents of config.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    #[serde(flatten)]
    pub core: OrcaConfig,
    pub maintenance: MaintenanceConfig,
    pub providers: Vec<ProviderSpec>,
}

impl ConfigFile {
    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = toml::from_str(contents)?;
        file.core.validate()?;
        Ok(file)
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory ($ORCA_DIR or ~/.orca)
    pub orca_dir: PathBuf,
    /// Path to configuration file
    pub config_path: PathBuf,
    /// Database path
    pub database_path: PathBuf,
    /// Parsed configuration file (defaults when the file is absent)
    pub file: ConfigFile,
}

impl Config {
    /// Load configuration from file or defaults
    ///
    /// Standard directory structure:
    /// ```text
    /// ~/.orca/
    /// ├── config.toml           # Main configuration
    /// └── orca.db               # Session store
    /// ```
    pub fn load(config_path: Option<&Path>, database_path: Option<&Path>) -> anyhow::Result<Self> {
        let orca_dir = orca_dir();
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| orca_dir.join("config.toml"));
        let database_path = database_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| orca_dir.join("orca.db"));

        // Create the database directory if it doesn't exist
        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            ConfigFile::parse(&contents)
                .with_context(|| format!("Invalid config {}", config_path.display()))?
        } else {
            ConfigFile::default()
        };

        Ok(Self {
            orca_dir,
            config_path,
            database_path,
            file,
        })
    }
}

/// Use ORCA_DIR env var if set, otherwise ~/.orca
fn orca_dir() -> PathBuf {
    std::env::var("ORCA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".orca")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    const SAMPLE: &str = r#"
[store]
session_ttl_secs = 3600

[coordinator]
session_timeout_ms = 5000

[drain]
hard_deadline_ms = 8000

[maintenance]
purge_interval_secs = 0

[[providers]]
name = "medical"
endpoint = "http://127.0.0.1:9001/analyze"
permissions = ["medical"]
timeout_ms = 2000
bearer_token_env = "MEDICAL_TOKEN"

[[providers]]
name = "culture"
endpoint = "http://127.0.0.1:9002/analyze"
"#;

    #[test]
    fn test_parse_config_file() {
        let file = ConfigFile::parse(SAMPLE).unwrap();

        assert_eq!(file.core.store.session_ttl_secs, 3600);
        assert_eq!(file.core.store.profile_ttl_secs, 0);
        assert_eq!(file.core.coordinator.session_timeout_ms, 5000);
        assert_eq!(file.core.coordinator.provider_timeout_ms, 10_000);
        assert_eq!(file.core.drain.hard_deadline_ms, 8000);
        assert_eq!(file.maintenance.purge_interval(), None);

        assert_eq!(file.providers.len(), 2);
        assert_eq!(file.providers[0].permissions, vec!["medical"]);
        assert_eq!(file.providers[0].timeout_ms, Some(2000));
        assert!(file.providers[1].permissions.is_empty());
        assert!(file.providers[1].bearer_token_env.is_none());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = ConfigFile::parse("").unwrap();
        assert!(file.providers.is_empty());
        assert_eq!(
            file.maintenance.purge_interval(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(file.core.drain.settle_grace_ms, 3000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ConfigFile::parse("[drain]\nhard_deadline_ms = 1000\nsettle_grace_ms = 5000\n")
            .unwrap_err();
        assert!(err.to_string().contains("settle_grace_ms"));
    }

    #[test]
    fn test_config_load_with_custom_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let custom_path = temp_dir.path().join("orca");

        // Save current value to restore later
        let old_val = env::var("ORCA_DIR").ok();
        // SAFETY: This test runs in isolation and we restore the env var afterward
        unsafe { env::set_var("ORCA_DIR", &custom_path) };

        let config = Config::load(None, None);

        // SAFETY: Restoring environment to previous state
        unsafe {
            if let Some(val) = old_val {
                env::set_var("ORCA_DIR", val);
            } else {
                env::remove_var("ORCA_DIR");
            }
        }

        let config = config.unwrap();
        assert!(custom_path.exists());
        assert_eq!(config.config_path, custom_path.join("config.toml"));
        assert_eq!(config.database_path, custom_path.join("orca.db"));
        assert!(config.file.providers.is_empty());
    }

    #[test]
    fn test_explicit_paths_win() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.toml");
        std::fs::write(&config_path, SAMPLE).unwrap();
        let database_path = temp_dir.path().join("custom.db");

        let config = Config::load(Some(&config_path), Some(&database_path)).unwrap();
        assert_eq!(config.config_path, config_path);
        assert_eq!(config.database_path, database_path);
        assert_eq!(config.file.providers.len(), 2);
    }
}
