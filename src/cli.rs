use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::{TokenMapConfig, WatchMode};

#[derive(Parser)]
#[command(name = "tokenmap")]
#[command(version = "0.1.0")]
#[command(about = "A live file tree with per-file and per-directory token counts")]
#[command(long_about = "tokenmap scans a directory, counts the tokens of every text file in the background and keeps the tree and its directory totals up to date while files change. Collapsed directories and disabled files do not count towards the totals above them.")]
pub struct Cli {
    /// Directory to map
    #[arg(value_name = "PATH", help = "Root directory (defaults to current directory)")]
    pub path: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE", help = "Configuration file")]
    pub config: Option<PathBuf>,

    /// Output format for tree snapshots
    #[arg(long, default_value = "text", help = "Output format")]
    pub output: OutputFormat,

    /// Scan, count everything, print once and exit
    #[arg(long, help = "Print the tree once and exit")]
    pub once: bool,

    /// Start with every directory expanded
    #[arg(long, help = "Expand all directories")]
    pub expand_all: bool,

    /// Replace the allowed extension list
    #[arg(long, value_delimiter = ',', help = "File extensions to include (e.g., rs,py,md)")]
    pub extensions: Option<Vec<String>>,

    /// Ignore additional patterns
    #[arg(long, value_delimiter = ',', help = "Additional patterns to ignore")]
    pub ignore: Option<Vec<String>>,

    /// Watch mode - how changes are detected
    #[arg(short, long, help = "File watching mode")]
    pub mode: Option<WatchMode>,

    /// Polling interval in milliseconds
    #[arg(long, help = "Polling interval in ms")]
    pub poll_interval: Option<u64>,

    /// Use a character-based estimate instead of the BPE tokenizer
    #[arg(long, help = "Estimate tokens as characters / 4")]
    pub estimate: bool,

    /// Where expansion and disabled flags are loaded from and saved to
    #[arg(long, value_name = "FILE", help = "View state file")]
    pub state: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Indented tree with counts
    Text,
    /// One JSON document per snapshot
    Json,
    /// Root total and counts only
    Compact,
}

impl Cli {
    pub fn get_watch_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    /// Fold command line overrides into a loaded configuration
    pub fn apply_to(&self, config: &mut TokenMapConfig) {
        if let Some(extensions) = &self.extensions {
            config.filter.allowed_extensions = extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect();
        }
        if let Some(patterns) = &self.ignore {
            config.filter.ignored_patterns.extend(patterns.iter().cloned());
        }
        if let Some(mode) = self.mode {
            config.watcher.mode = mode;
        }
        if let Some(ms) = self.poll_interval {
            config.watcher.poll_interval_ms = ms;
        }
        if self.expand_all {
            config.builder.expand_all = true;
        }
    }

    /// Log to stderr so snapshots on stdout stay parseable
    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }

    pub fn validate(&self) -> Result<(), String> {
        let path = self.get_watch_path();

        if !path.exists() {
            return Err(format!("Path does not exist: {}", path.display()));
        }

        if !path.is_dir() {
            return Err(format!("Path is not a directory: {}", path.display()));
        }

        if self.poll_interval == Some(0) {
            return Err("Poll interval must be greater than 0".to_string());
        }

        Ok(())
    }
}
