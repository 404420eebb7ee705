//! Configuration types, defaults, loading, and validation.
//!
//! Layered the way the teacher's `config/types.rs` layers it: compiled-in
//! defaults, overridden by a system config file, overridden by a local
//! config file, overridden by environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::browser::BrowserConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub compaction: CompactionConfig,

    #[serde(default)]
    pub flush: FlushConfig,

    #[serde(default)]
    pub browser: BrowserConfig,
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// Priority (lowest to highest):
    /// 1. Default values
    /// 2. System config: `~/.clawcore/config.toml`
    /// 3. Local config: `./clawcore.toml`
    /// 4. Environment variables (`CLAWCORE_*`)
    pub fn load() -> Result<Self> {
        tracing::debug!("Loading configuration...");
        let mut config = Self::default();

        if let Some(system_path) = Self::system_config_path()
            && system_path.exists()
        {
            tracing::debug!("Loading system config from: {:?}", system_path);
            config = Self::merge_from_file(config, &system_path)?;
        }

        let local_path = Self::local_config_path();
        if local_path.exists() {
            tracing::debug!("Loading local config from: {:?}", local_path);
            config = Self::merge_from_file(config, &local_path)?;
        }

        config = Self::apply_env_overrides(config);
        config.store.path = expand_tilde(&config.store.path);

        tracing::debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if path.exists() {
            config = Self::merge_from_file(config, path)?;
        } else {
            anyhow::bail!("Config file not found: {:?}", path);
        }
        config = Self::apply_env_overrides(config);
        config.store.path = expand_tilde(&config.store.path);
        Ok(config)
    }

    pub fn system_config_path() -> Option<PathBuf> {
        Some(clawcore_home().join("config.toml"))
    }

    fn local_config_path() -> PathBuf {
        PathBuf::from("./clawcore.toml")
    }

    fn merge_from_file(_base: Self, path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let file_config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(file_config)
    }

    /// Apply `CLAWCORE_*` environment variable overrides.
    ///
    /// Only the handful of options an operator is likely to flip at deploy
    /// time are covered; everything else goes through the TOML file.
    fn apply_env_overrides(mut config: Self) -> Self {
        if let Ok(path) = std::env::var("CLAWCORE_DB_PATH") {
            config.store.path = PathBuf::from(path);
        }
        if let Ok(level) = std::env::var("CLAWCORE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(v) = std::env::var("CLAWCORE_COMPACTION_RESERVE_TOKENS")
            && let Ok(n) = v.parse()
        {
            config.compaction.reserve_tokens = n;
        }
        config
    }
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_tilde(p: &Path) -> PathBuf {
    if let Ok(rest) = p.strip_prefix("~") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else {
        p.to_path_buf()
    }
}

/// Canonical base directory: `~/.clawcore/`. Created on first access.
pub fn clawcore_home() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let p = home.join(".clawcore");
    if !p.exists() {
        let _ = fs::create_dir_all(&p);
    }
    p
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Busy-timeout for SQLite writers contending on the WAL.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,

    /// Pool size for the deadpool-sqlite connection pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_db_path() -> PathBuf {
    clawcore_home().join("clawcore.db")
}

fn default_busy_timeout_ms() -> u32 {
    5_000
}

fn default_pool_size() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Context-usage percent thresholds that can trigger a checkpoint.
    #[serde(default = "default_checkpoint_threshold_percent")]
    pub threshold_percent: u32,

    /// Minimum new user turns since the last checkpoint before generating again.
    #[serde(default = "default_turn_threshold")]
    pub turn_threshold: u32,

    /// Minimum session tokens before a turn-triggered checkpoint is allowed.
    #[serde(default = "default_min_tokens_for_gen")]
    pub min_tokens_for_gen: u32,

    /// Timeout for the background generation task, in seconds.
    #[serde(default = "default_checkpoint_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            threshold_percent: default_checkpoint_threshold_percent(),
            turn_threshold: default_turn_threshold(),
            min_tokens_for_gen: default_min_tokens_for_gen(),
            timeout_secs: default_checkpoint_timeout_secs(),
        }
    }
}

fn default_checkpoint_threshold_percent() -> u32 {
    50
}
fn default_turn_threshold() -> u32 {
    10
}
fn default_min_tokens_for_gen() -> u32 {
    2_000
}
fn default_checkpoint_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: u32,

    #[serde(default = "default_keep_percent")]
    pub keep_percent: u32,

    #[serde(default = "default_emergency_keep_percent")]
    pub emergency_keep_percent: u32,

    #[serde(default = "default_min_messages")]
    pub min_messages: usize,

    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_seconds: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            reserve_tokens: default_reserve_tokens(),
            keep_percent: default_keep_percent(),
            emergency_keep_percent: default_emergency_keep_percent(),
            min_messages: default_min_messages(),
            max_messages: default_max_messages(),
            retry_interval_seconds: default_retry_interval_secs(),
        }
    }
}

fn default_reserve_tokens() -> u32 {
    4_000
}
fn default_keep_percent() -> u32 {
    50
}
fn default_emergency_keep_percent() -> u32 {
    70
}
fn default_min_messages() -> usize {
    20
}
fn default_max_messages() -> usize {
    0 // 0 = unbounded by message count; tokens-only trigger
}
fn default_retry_interval_secs() -> u64 {
    60
}

/// One entry in the memory-flush threshold ladder (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum InjectAs {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushThreshold {
    pub percent: u32,
    pub prompt: String,
    pub inject_as: InjectAs,
    #[serde(default = "default_once_per_cycle")]
    pub once_per_cycle: bool,
}

fn default_once_per_cycle() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    #[serde(default = "default_flush_thresholds")]
    pub thresholds: Vec<FlushThreshold>,

    /// Below this usage fraction, flushed thresholds are reset for a new cycle.
    #[serde(default = "default_flush_reset_usage")]
    pub reset_usage: f64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            thresholds: default_flush_thresholds(),
            reset_usage: default_flush_reset_usage(),
        }
    }
}

fn default_flush_reset_usage() -> f64 {
    0.25
}

fn default_flush_thresholds() -> Vec<FlushThreshold> {
    vec![
        FlushThreshold {
            percent: 50,
            prompt: "Context is at 50% capacity as of YYYY-MM-DD. Consider writing durable notes to memory/ now.".to_string(),
            inject_as: InjectAs::System,
            once_per_cycle: true,
        },
        FlushThreshold {
            percent: 75,
            prompt: "Context is at 75% capacity as of YYYY-MM-DD. Write any important state to memory/ before it's compacted away.".to_string(),
            inject_as: InjectAs::System,
            once_per_cycle: true,
        },
        FlushThreshold {
            percent: 90,
            prompt: "Context is at 90% capacity as of YYYY-MM-DD. Compaction is imminent — save anything you need to remember to memory/ now.".to_string(),
            inject_as: InjectAs::User,
            once_per_cycle: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.compaction.reserve_tokens, config.compaction.reserve_tokens);
        assert_eq!(parsed.flush.thresholds.len(), config.flush.thresholds.len());
    }

    #[test]
    fn expand_tilde_uses_home_dir() {
        let p = Path::new("~/foo/bar");
        let expanded = expand_tilde(p);
        assert!(expanded.ends_with("foo/bar"));
        assert!(!expanded.starts_with("~"));
    }

    #[test]
    fn load_from_missing_path_errors() {
        let result = Config::load_from_path("/nonexistent/clawcore-test-config.toml");
        assert!(result.is_err());
    }
}
