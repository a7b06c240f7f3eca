//! Configuration loading for catalog-search.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at ~/.config/catalog-search/config.toml.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::TypesError;

/// Pipeline sizing, retry and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Maximum identifiers per group.
    #[serde(default = "default_group_size")]
    pub group_size: usize,

    /// Groups processed concurrently (load/translate/add-document).
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Attempts per group for transient collaborator errors.
    #[serde(default = "default_max_group_attempts")]
    pub max_group_attempts: u32,

    /// First retry delay in milliseconds; grows exponentially.
    #[serde(default = "default_retry_initial_interval_ms")]
    pub retry_initial_interval_ms: u64,

    /// Per-group timeout in seconds (0 disables it).
    #[serde(default)]
    pub group_timeout_secs: u64,

    /// Fetch/process/consume iterations per build run.
    #[serde(default = "default_max_build_iterations")]
    pub max_build_iterations: usize,

    /// Page size for full-scan uid enumeration during rebuilds.
    #[serde(default = "default_rebuild_page_size")]
    pub rebuild_page_size: usize,
}

fn default_group_size() -> usize {
    500
}

fn default_worker_count() -> usize {
    4
}

fn default_max_group_attempts() -> u32 {
    3
}

fn default_retry_initial_interval_ms() -> u64 {
    200
}

fn default_max_build_iterations() -> usize {
    5
}

fn default_rebuild_page_size() -> usize {
    5_000
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            group_size: default_group_size(),
            worker_count: default_worker_count(),
            max_group_attempts: default_max_group_attempts(),
            retry_initial_interval_ms: default_retry_initial_interval_ms(),
            group_timeout_secs: 0,
            max_build_iterations: default_max_build_iterations(),
            rebuild_page_size: default_rebuild_page_size(),
        }
    }
}

impl PipelineSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.group_size == 0 {
            return Err("group_size must be > 0".to_string());
        }
        if self.worker_count == 0 {
            return Err("worker_count must be > 0".to_string());
        }
        if self.max_group_attempts == 0 {
            return Err("max_group_attempts must be > 0".to_string());
        }
        if self.max_build_iterations == 0 {
            return Err("max_build_iterations must be > 0".to_string());
        }
        if self.rebuild_page_size == 0 {
            return Err("rebuild_page_size must be > 0".to_string());
        }
        Ok(())
    }
}

/// Thresholds for the default index build policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Uncommitted operations that trigger a commit.
    #[serde(default = "default_commit_threshold")]
    pub commit_threshold: i64,

    /// Buffered documents that trigger an add-documents call.
    #[serde(default = "default_add_documents_threshold")]
    pub add_documents_threshold: i64,

    /// Operations (or deleted-document churn) that trigger an optimize.
    #[serde(default = "default_optimize_threshold")]
    pub optimize_threshold: i64,
}

fn default_commit_threshold() -> i64 {
    5_000
}

fn default_add_documents_threshold() -> i64 {
    100
}

fn default_optimize_threshold() -> i64 {
    50_000
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            commit_threshold: default_commit_threshold(),
            add_documents_threshold: default_add_documents_threshold(),
            optimize_threshold: default_optimize_threshold(),
        }
    }
}

/// Cron schedules for the daemon's background jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    /// Incremental build of every index type (6-field cron).
    #[serde(default = "default_build_cron")]
    pub build_cron: String,

    /// Optimize of every non-excluded index type.
    #[serde(default = "default_optimize_cron")]
    pub optimize_cron: String,
}

fn default_build_cron() -> String {
    "*/30 * * * * *".to_string()
}

fn default_optimize_cron() -> String {
    "0 0 3 * * *".to_string()
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            build_cron: default_build_cron(),
            optimize_cron: default_optimize_cron(),
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the RocksDB notification/entity store
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Root directory holding one search index per index type
    #[serde(default = "default_search_index_path")]
    pub search_index_path: String,

    /// Memory budget of each index writer in MB
    #[serde(default = "default_writer_memory_mb")]
    pub writer_memory_mb: usize,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Index names never optimized by the scheduled optimize job
    #[serde(default)]
    pub optimize_exclusions: Vec<String>,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub policy: PolicySettings,

    #[serde(default)]
    pub schedule: ScheduleSettings,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", "catalog-search")
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_search_index_path() -> String {
    ProjectDirs::from("", "", "catalog-search")
        .map(|p| p.data_local_dir().join("indexes"))
        .unwrap_or_else(|| PathBuf::from("./indexes"))
        .to_string_lossy()
        .to_string()
}

fn default_writer_memory_mb() -> usize {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            search_index_path: default_search_index_path(),
            writer_memory_mb: default_writer_memory_mb(),
            log_level: default_log_level(),
            optimize_exclusions: Vec::new(),
            pipeline: PipelineSettings::default(),
            policy: PolicySettings::default(),
            schedule: ScheduleSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/catalog-search/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (CATALOG_*, nested keys use `__`,
    ///    e.g. CATALOG_PIPELINE__GROUP_SIZE)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, TypesError> {
        let config_dir = ProjectDirs::from("", "", "catalog-search")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("search_index_path", default_search_index_path())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("CATALOG")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| TypesError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| TypesError::Config(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<(), TypesError> {
        self.pipeline.validate().map_err(TypesError::Config)?;
        if self.writer_memory_mb == 0 {
            return Err(TypesError::Config("writer_memory_mb must be > 0".to_string()));
        }
        Ok(())
    }

    /// Expand ~ in db_path to the home directory
    pub fn expanded_db_path(&self) -> PathBuf {
        expand_home(&self.db_path)
    }

    /// Expand ~ in search_index_path to the home directory
    pub fn expanded_search_index_path(&self) -> PathBuf {
        expand_home(&self.search_index_path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.pipeline.group_size, 500);
        assert_eq!(settings.pipeline.worker_count, 4);
        assert_eq!(settings.policy.add_documents_threshold, 100);
        assert!(settings.optimize_exclusions.is_empty());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_pipeline_validation() {
        let mut pipeline = PipelineSettings::default();
        assert!(pipeline.validate().is_ok());

        pipeline.group_size = 0;
        assert!(pipeline.validate().is_err());

        pipeline.group_size = 10;
        pipeline.worker_count = 0;
        assert!(pipeline.validate().is_err());

        pipeline.worker_count = 2;
        pipeline.max_group_attempts = 0;
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\noptimize_exclusions = [\"cmuser\"]\n\n[pipeline]\ngroup_size = 25\n\n[policy]\ncommit_threshold = 10"
        )
        .unwrap();

        let settings = Settings::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.pipeline.group_size, 25);
        assert_eq!(settings.pipeline.worker_count, 4);
        assert_eq!(settings.policy.commit_threshold, 10);
        assert_eq!(settings.optimize_exclusions, vec!["cmuser".to_string()]);
    }

    #[test]
    fn test_load_rejects_zero_group_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[pipeline]\ngroup_size = 0\n").unwrap();

        let result = Settings::load(Some(path.to_str().unwrap()));
        assert!(matches!(result, Err(TypesError::Config(_))));
    }

    #[test]
    fn test_expand_home() {
        let settings = Settings {
            db_path: "/var/lib/catalog/db".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.expanded_db_path(), PathBuf::from("/var/lib/catalog/db"));
    }
}
