// src/config/mod.rs - Engine configuration loaded from YAML

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::bot::matcher::WorkerPoolConfig;
use crate::bot::pattern::PatternCompiler;
use crate::bot::shutdown::ShutdownConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/retrigger.yaml";

const MAX_POOL_SIZE: usize = 256;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding guild documents, global settings and backups
    pub data_dir: PathBuf,
    /// Substituted for `{prefix}` in trigger patterns
    pub command_prefix: String,
    pub save_interval_seconds: u64,
    pub matcher: MatcherConfig,
    pub shutdown: ShutdownSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Number of worker processes; also the match concurrency limit
    pub pool_size: usize,
    /// Worker executable; defaults to this binary in `match-worker` mode
    pub worker_program: Option<PathBuf>,
    /// Optional engine-level cap on backtracking steps, applied on top of the timeout
    pub backtrack_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    pub graceful_timeout_seconds: u64,
    pub component_timeout_seconds: u64,
    pub backup_on_shutdown: bool,
    pub max_operations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            command_prefix: "!".to_string(),
            save_interval_seconds: 120,
            matcher: MatcherConfig::default(),
            shutdown: ShutdownSettings::default(),
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get().clamp(1, 8),
            worker_program: None,
            backtrack_limit: None,
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            graceful_timeout_seconds: 30,
            component_timeout_seconds: 10,
            backup_on_shutdown: true,
            max_operations: 1000,
        }
    }
}

impl EngineConfig {
    /// Config file location: `RETRIGGER_CONFIG` or the default path
    pub fn config_path() -> PathBuf {
        env::var("RETRIGGER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load the config file, writing one with defaults if it does not exist
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Self::default();
            config.save(path).await?;
            info!("Created default configuration at {}", path.display());
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Apply `RETRIGGER_DATA_DIR` and `RETRIGGER_WORKERS` from the environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("RETRIGGER_DATA_DIR") {
            info!("Data directory overridden from environment: {}", dir);
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(workers) = lookup("RETRIGGER_WORKERS") {
            match workers.trim().parse::<usize>() {
                Ok(size) if (1..=MAX_POOL_SIZE).contains(&size) => self.matcher.pool_size = size,
                _ => warn!("Ignoring invalid RETRIGGER_WORKERS value: {}", workers),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_prefix.is_empty() || self.command_prefix.chars().any(char::is_whitespace) {
            return Err(anyhow::anyhow!("Command prefix must be non-empty and contain no whitespace"));
        }
        if self.save_interval_seconds == 0 {
            return Err(anyhow::anyhow!("Save interval must be at least 1 second"));
        }
        if !(1..=MAX_POOL_SIZE).contains(&self.matcher.pool_size) {
            return Err(anyhow::anyhow!("Matcher pool size must be between 1 and {}", MAX_POOL_SIZE));
        }
        if self.matcher.backtrack_limit == Some(0) {
            return Err(anyhow::anyhow!("Backtrack limit must be positive when set"));
        }
        if self.shutdown.component_timeout_seconds == 0 || self.shutdown.max_operations == 0 {
            return Err(anyhow::anyhow!("Shutdown timeouts and operation limit must be positive"));
        }
        Ok(())
    }

    pub fn pattern_compiler(&self) -> PatternCompiler {
        let compiler = PatternCompiler::new(self.command_prefix.clone());
        match self.matcher.backtrack_limit {
            Some(limit) => compiler.with_backtrack_limit(limit),
            None => compiler,
        }
    }

    pub fn worker_pool_config(&self) -> Result<WorkerPoolConfig> {
        let mut pool = match &self.matcher.worker_program {
            Some(program) => WorkerPoolConfig {
                size: self.matcher.pool_size,
                program: program.clone(),
                args: vec!["match-worker".to_string()],
                backtrack_limit: usize::MAX,
            },
            None => WorkerPoolConfig::current_exe(self.matcher.pool_size)
                .context("Failed to locate the current executable for match workers")?,
        };
        if let Some(limit) = self.matcher.backtrack_limit {
            pool.backtrack_limit = limit;
        }
        Ok(pool)
    }

    pub fn shutdown_config(&self) -> ShutdownConfig {
        ShutdownConfig {
            graceful_timeout_seconds: self.shutdown.graceful_timeout_seconds,
            component_timeout_seconds: self.shutdown.component_timeout_seconds,
            create_backup: self.shutdown.backup_on_shutdown,
            max_operations: self.shutdown.max_operations,
        }
    }
}
