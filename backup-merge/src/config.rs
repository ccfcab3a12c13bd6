//! Configuration management for the merge tool.
//!
//! Loads configuration from TOML file with environment variable overrides.

use crate::merge::MergeOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Root of the backup catalog
    pub path: PathBuf,

    /// Instance whose backups are merged
    #[serde(default = "default_instance")]
    pub instance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Number of merge worker threads
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Log every processed file
    #[serde(default)]
    pub progress: bool,

    /// WAL segment size, used to account archived WAL of the merged backup
    #[serde(default = "default_wal_segment_size")]
    pub wal_segment_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output (stdout, stderr)
    #[serde(default = "default_log_output")]
    pub output: String,
}

// Default values
fn default_instance() -> String {
    "main".to_string()
}

fn default_threads() -> usize {
    1
}

fn default_wal_segment_size() -> u64 {
    crate::merge::DEFAULT_WAL_SEGMENT_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stderr".to_string()
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            progress: false,
            wal_segment_size: default_wal_segment_size(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            catalog: CatalogConfig {
                path: PathBuf::from("/var/lib/backup-catalog"),
                instance: default_instance(),
            },
            merge: MergeConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply `BACKUP_PATH`, `BACKUP_INSTANCE`, `MERGE_THREADS` and `LOG_LEVEL`.
    /// A `.env` file in the working directory is read first when present.
    pub fn apply_env_overrides(&mut self) {
        let _ = dotenvy::dotenv();
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("BACKUP_PATH") {
            self.catalog.path = PathBuf::from(path);
        }
        if let Some(instance) = lookup("BACKUP_INSTANCE") {
            self.catalog.instance = instance;
        }
        if let Some(threads) = lookup("MERGE_THREADS").and_then(|v| v.parse().ok()) {
            self.merge.threads = threads;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log.level = level;
        }
    }

    /// Runtime options handed to the merge engine
    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            threads: self.merge.threads.max(1),
            progress: self.merge.progress,
            wal_segment_size: self.merge.wal_segment_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_file_applies_defaults() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[catalog]\npath = \"/srv/backups\"\n\n[merge]\nthreads = 8")?;

        let config = Config::from_file(file.path())?;

        assert_eq!(config.catalog.path, PathBuf::from("/srv/backups"));
        assert_eq!(config.catalog.instance, "main");
        assert_eq!(config.merge.threads, 8);
        assert!(!config.merge.progress);
        assert_eq!(config.merge.wal_segment_size, 16 * 1024 * 1024);
        assert_eq!(config.log.level, "info");
        Ok(())
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BACKUP_PATH", "/mnt/catalog"),
            ("BACKUP_INSTANCE", "replica"),
            ("MERGE_THREADS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.catalog.path, PathBuf::from("/mnt/catalog"));
        assert_eq!(config.catalog.instance, "replica");
        // Unparseable values keep the configured setting
        assert_eq!(config.merge.threads, 1);
    }

    #[test]
    fn test_merge_options_never_zero_threads() {
        let mut config = Config::default();
        config.merge.threads = 0;
        assert_eq!(config.merge_options().threads, 1);
    }
}
