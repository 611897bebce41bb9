//! Configuration loading and management.
//!
//! Configuration is loaded from `~/.config/pi-brain/config.toml`. Every
//! optional section has a `Default` impl so a daemon with no config file at
//! all still boots with sane values.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level daemon configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Directory the session watcher recursively scans for files matching
    /// `watcher.globs`.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub embedding: Option<EmbeddingConfig>,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sessions_dir: default_sessions_dir(),
            daemon: DaemonConfig::default(),
            watcher: WatcherConfig::default(),
            analyzer: AnalyzerConfig::default(),
            retry: RetryConfig::default(),
            scheduler: SchedulerConfig::default(),
            discovery: DiscoveryConfig::default(),
            embedding: None,
            prompt: PromptConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_sessions_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".pi-brain").join("sessions")
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_worker_count() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_shutdown_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_globs")]
    pub globs: Vec<String>,
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            globs: default_globs(),
            idle_threshold_ms: default_idle_threshold_ms(),
        }
    }
}

fn default_globs() -> Vec<String> {
    vec!["sessions/**/*.jsonl".to_string()]
}
fn default_idle_threshold_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default = "default_analyzer_binary")]
    pub binary: String,
    #[serde(default = "default_analyzer_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub optional_skills: Vec<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            binary: default_analyzer_binary(),
            timeout_ms: default_analyzer_timeout_ms(),
            required_skills: vec![],
            optional_skills: vec![],
        }
    }
}

fn default_analyzer_binary() -> String {
    "pi-analyzer".to_string()
}
fn default_analyzer_timeout_ms() -> u64 {
    // 10 minutes, per the analyzer invocation's default timeout.
    600_000
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_sec")]
    pub base_delay_sec: f64,
    #[serde(default = "default_max_delay_sec")]
    pub max_delay_sec: f64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base_delay_sec: default_base_delay_sec(),
            max_delay_sec: default_max_delay_sec(),
            jitter_ratio: default_jitter_ratio(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_base_delay_sec() -> f64 {
    5.0
}
fn default_max_delay_sec() -> f64 {
    3600.0
}
fn default_jitter_ratio() -> f64 {
    0.1
}
fn default_max_retries() -> u32 {
    5
}

impl From<RetryConfig> for crate::error::RetryPolicy {
    fn from(c: RetryConfig) -> Self {
        crate::error::RetryPolicy {
            base_delay_sec: c.base_delay_sec,
            max_delay_sec: c.max_delay_sec,
            jitter_ratio: c.jitter_ratio,
            max_retries: c.max_retries,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CronJobConfig {
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_jobs")]
    pub jobs: HashMap<String, CronJobConfig>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_rerun_historical")]
    pub rerun_historical: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            jobs: default_scheduler_jobs(),
            batch_size: default_batch_size(),
            rerun_historical: default_rerun_historical(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}
fn default_rerun_historical() -> bool {
    false
}

fn default_scheduler_jobs() -> HashMap<String, CronJobConfig> {
    let mut jobs = HashMap::new();
    jobs.insert(
        "reanalysis".to_string(),
        CronJobConfig { cron: "0 0 * * * *".to_string(), enabled: true },
    );
    jobs.insert(
        "connection_discovery".to_string(),
        CronJobConfig { cron: "0 */15 * * * *".to_string(), enabled: true },
    );
    jobs.insert(
        "pattern_aggregation".to_string(),
        CronJobConfig { cron: "0 0 */6 * * *".to_string(), enabled: true },
    );
    jobs.insert(
        "clustering".to_string(),
        CronJobConfig { cron: "0 0 0 * * *".to_string(), enabled: true },
    );
    jobs
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct DiscoveryConfig {
    #[serde(default = "default_jaccard_threshold")]
    pub jaccard_threshold: f64,
    #[serde(default = "default_lesson_similarity_threshold")]
    pub lesson_similarity_threshold: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            jaccard_threshold: default_jaccard_threshold(),
            lesson_similarity_threshold: default_lesson_similarity_threshold(),
        }
    }
}

fn default_jaccard_threshold() -> f64 {
    0.3
}
fn default_lesson_similarity_threshold() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    Ollama,
    OpenAiCompatible,
    OpenRouter,
    Mock,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
}

fn default_embedding_dimensions() -> usize {
    256
}

#[derive(Debug, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_prompt_path")]
    pub path: PathBuf,
    #[serde(default = "default_prompt_history_dir")]
    pub history_dir: PathBuf,
}

impl Default for PromptConfig {
    fn default() -> Self {
        PromptConfig {
            path: default_prompt_path(),
            history_dir: default_prompt_history_dir(),
        }
    }
}

fn default_prompt_path() -> PathBuf {
    PathBuf::from("prompt.md")
}
fn default_prompt_history_dir() -> PathBuf {
    PathBuf::from("prompts/history")
}

/// Logging configuration, same shape as the teacher's.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path, falling back to defaults
    /// if no config file exists.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!(?config_path, "no config file found, using defaults");
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {path:?}: {e}")))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;

        Ok(config)
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pi-brain")
            .join("config.toml")
    }

    /// Root directory for the database, node JSON store, prompt archive,
    /// PID file, and log file.
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pi-brain")
    }

    pub fn database_path() -> PathBuf {
        Self::data_dir().join("pi-brain.db")
    }

    pub fn nodes_dir() -> PathBuf {
        Self::data_dir().join("nodes")
    }

    pub fn pid_path() -> PathBuf {
        Self::data_dir().join("pi-brain.pid")
    }

    pub fn log_path() -> PathBuf {
        Self::data_dir().join("pi-brain.log")
    }

    pub fn prompt_history_path(&self, version: &str) -> PathBuf {
        Self::data_dir().join(&self.prompt.history_dir).join(format!("{version}.md"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.embedding.is_none());
        assert_eq!(config.daemon.worker_count, 4);
        assert_eq!(config.retry.max_retries, 5);
        assert!(config.scheduler.jobs.contains_key("reanalysis"));
        assert!(config.sessions_dir.ends_with("sessions"));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[daemon]
worker_count = 8

[watcher]
idle_threshold_ms = 5000

[embedding]
provider = "ollama"
model = "nomic-embed-text"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.daemon.worker_count, 8);
        assert_eq!(config.watcher.idle_threshold_ms, 5000);
        assert_eq!(config.embedding.unwrap().provider, EmbeddingProviderKind::Ollama);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_persisted_state_layout() {
        assert!(Config::database_path().ends_with("pi-brain.db"));
        assert!(Config::pid_path().ends_with("pi-brain.pid"));
        assert!(Config::log_path().ends_with("pi-brain.log"));
    }
}
