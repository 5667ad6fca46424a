//! Configuration management for tokenmap
//!
//! This module provides configuration structures and defaults for the
//! filter, the token counter, the tree builder, the watcher and the
//! maintenance sweep. Values come from defaults, an optional TOML file and
//! `TOKENMAP_*` environment variables, in that order.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Global configuration for tokenmap
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenMapConfig {
    pub filter: FilterConfig,
    pub tokens: TokenConfig,
    pub builder: BuilderConfig,
    pub watcher: WatcherConfig,
    pub maintenance: MaintenanceConfig,
}

/// Which names are left out of the tree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Plain patterns match as substrings, patterns with `*`, `?` or `[` as globs
    pub ignored_patterns: Vec<String>,
    /// Extensions kept when non-empty; names without an extension always pass
    pub allowed_extensions: Vec<String>,
    pub name_cache_size: usize,
    pub extension_cache_size: usize,
}

/// Token counting worker pool and cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Worker count override; derived from available parallelism when unset
    pub max_workers: Option<usize>,
    pub worker_cap: usize,
    /// Hard cap on cached counts
    pub cache_size: usize,
    /// Share of the cap kept by an explicit trim
    pub trim_ratio: f32,
    /// Files above this many bytes get an estimated count
    pub large_file_threshold: u64,
    pub bytes_per_token: u64,
}

/// Initial scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Files counted eagerly during the scan; the rest are backfilled
    pub eager_limit: usize,
    pub expand_all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Native events when available, polling always
    Auto,
    /// Require native file system events on top of polling
    Native,
    /// Polling only
    Polling,
}

/// Change watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub mode: WatchMode,
    pub poll_interval_ms: u64,
    /// Directories listed per reconciliation cycle
    pub max_dirs_per_cycle: usize,
}

/// Periodic cache trimming and lazy token backfill
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
    pub backfill_interval_ms: u64,
    pub backfill_batch: usize,
}

pub const DEFAULT_IGNORED_PATTERNS: &[&str] = &[
    "__pycache__", "node_modules", "dist", "build", "venv", ".git", ".svn", ".hg",
    ".idea", ".vscode", ".env*", ".DS_Store", "Thumbs.db", "*.bak", "*.tmp",
    "desktop.ini", "*.log", "*.db", "*.key", "*.pyc", "*.exe", "*.dll", "*.so",
    "*.dylib", "target", "*.o", "*.obj", "*.class", "*.jar", "*.war", "*.ear",
    ".cache", ".pytest_cache", ".mypy_cache", ".tox", "*.swp", "*.swo",
    ".terraform", "*.lock", "package-lock.json",
];

pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    "py", "pyi", "pyw", "txt", "md", "rst", "json", "xml", "html", "htm", "css",
    "scss", "sass", "less", "yaml", "yml", "toml", "ini", "cfg", "conf", "properties",
    "sh", "bash", "zsh", "csh", "ksh", "bat", "cmd", "ps1", "vbs", "js", "ts",
    "jsx", "tsx", "mjs", "cjs", "c", "cpp", "h", "hpp", "cc", "hh", "cs", "go",
    "rs", "swift", "java", "kt", "kts", "scala", "sc", "groovy", "gradle", "rb",
    "php", "pl", "pm", "sql", "dockerignore", "json5", "hjson", "tf", "tfvars", "hcl",
];

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            ignored_patterns: DEFAULT_IGNORED_PATTERNS.iter().map(|s| s.to_string()).collect(),
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            name_cache_size: 10_000,
            extension_cache_size: 1_000,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            worker_cap: 8,
            cache_size: 10_000,
            trim_ratio: 0.5,
            large_file_threshold: 1024 * 1024, // 1 MiB
            bytes_per_token: 4,
        }
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            eager_limit: 50,
            expand_all: false,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Auto,
            poll_interval_ms: 1000,
            max_dirs_per_cycle: 64,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            backfill_interval_ms: 500,
            backfill_batch: 10,
        }
    }
}

impl TokenConfig {
    /// Worker pool size: the override, or available parallelism, capped
    pub fn worker_count(&self) -> usize {
        let cap = self.worker_cap.max(1);
        match self.max_workers {
            Some(n) => n.clamp(1, cap),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .clamp(1, cap),
        }
    }

    /// Entries kept by `trim_cache`
    pub fn trim_target(&self) -> usize {
        (self.cache_size as f32 * self.trim_ratio) as usize
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn backfill_interval(&self) -> Duration {
        Duration::from_millis(self.backfill_interval_ms)
    }
}

/// Configuration loading and management
impl TokenMapConfig {
    /// Parse a TOML file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load from `path` when given, defaults otherwise, then apply the environment
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Override with environment variables if present
    pub fn apply_env(&mut self) {
        if let Some(size) = env_parse::<usize>("TOKENMAP_CACHE_SIZE") {
            self.tokens.cache_size = size;
        }
        if let Some(workers) = env_parse::<usize>("TOKENMAP_WORKERS") {
            self.tokens.max_workers = Some(workers);
        }
        if let Some(limit) = env_parse::<usize>("TOKENMAP_EAGER_LIMIT") {
            self.builder.eager_limit = limit;
        }
        if let Some(ms) = env_parse::<u64>("TOKENMAP_POLL_INTERVAL_MS") {
            self.watcher.poll_interval_ms = ms;
        }
        if let Ok(val) = std::env::var("TOKENMAP_WATCH_MODE") {
            match WatchMode::from_str(&val, true) {
                Ok(mode) => self.watcher.mode = mode,
                Err(_) => tracing::warn!("Ignoring invalid TOKENMAP_WATCH_MODE={}", val),
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.tokens.cache_size == 0 {
            return Err("tokens.cache_size must be greater than 0".to_string());
        }

        if self.tokens.trim_ratio <= 0.0 || self.tokens.trim_ratio > 1.0 {
            return Err("tokens.trim_ratio must be between 0.0 and 1.0".to_string());
        }

        if self.tokens.bytes_per_token == 0 {
            return Err("tokens.bytes_per_token must be greater than 0".to_string());
        }

        if self.watcher.poll_interval_ms == 0 {
            return Err("watcher.poll_interval_ms must be greater than 0".to_string());
        }

        if self.watcher.max_dirs_per_cycle == 0 {
            return Err("watcher.max_dirs_per_cycle must be greater than 0".to_string());
        }

        if self.maintenance.backfill_interval_ms == 0 {
            return Err("maintenance.backfill_interval_ms must be greater than 0".to_string());
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let val = std::env::var(key).ok()?;
    match val.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={}", key, val);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TokenMapConfig::default();

        assert_eq!(config.builder.eager_limit, 50);
        assert_eq!(config.tokens.cache_size, 10_000);
        assert_eq!(config.watcher.mode, WatchMode::Auto);
        assert!(config.filter.ignored_patterns.iter().any(|p| p == "node_modules"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = TokenMapConfig::default();
        assert!(config.validate().is_ok());

        config.tokens.cache_size = 0;
        assert!(config.validate().is_err());

        config.tokens.cache_size = 100;
        config.tokens.trim_ratio = 1.5;
        assert!(config.validate().is_err());

        config.tokens.trim_ratio = 0.5;
        config.watcher.max_dirs_per_cycle = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_count_is_capped() {
        let mut tokens = TokenConfig::default();
        tokens.max_workers = Some(64);
        assert_eq!(tokens.worker_count(), 8);

        tokens.max_workers = Some(0);
        assert_eq!(tokens.worker_count(), 1);

        tokens.max_workers = None;
        assert!((1..=8).contains(&tokens.worker_count()));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenmap.toml");
        std::fs::write(
            &path,
            "[builder]\neager_limit = 5\n\n[watcher]\nmode = \"polling\"\n",
        )
        .unwrap();

        let config = TokenMapConfig::load(&path).unwrap();
        assert_eq!(config.builder.eager_limit, 5);
        assert!(!config.builder.expand_all);
        assert_eq!(config.watcher.mode, WatchMode::Polling);
        assert_eq!(config.watcher.poll_interval_ms, 1000);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = TokenMapConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_duration_conversions() {
        let config = TokenMapConfig::default();

        assert_eq!(config.watcher.poll_interval(), Duration::from_millis(1000));
        assert_eq!(config.maintenance.interval(), Duration::from_secs(60));
        assert_eq!(config.tokens.trim_target(), 5_000);
    }

    #[test]
    fn test_env_config_loading() {
        std::env::set_var("TOKENMAP_EAGER_LIMIT", "7");
        std::env::set_var("TOKENMAP_WATCH_MODE", "native");

        let mut config = TokenMapConfig::default();
        config.apply_env();

        assert_eq!(config.builder.eager_limit, 7);
        assert_eq!(config.watcher.mode, WatchMode::Native);

        // Cleanup
        std::env::remove_var("TOKENMAP_EAGER_LIMIT");
        std::env::remove_var("TOKENMAP_WATCH_MODE");
    }
}
