use crate::error::InspectError;
use crate::scope::DEFAULT_PROFILE;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_NAME: &str = "auto-inspect.json";
const DEFAULT_DEBOUNCE_MS: u64 = 1000;
const DEFAULT_LOG_LEVEL: &str = "info";

/// JSON config file structure
#[derive(Deserialize, Default, Debug)]
struct FileConfig {
    debounce_ms: Option<u64>,
    log_level: Option<String>,
    root: Option<PathBuf>,
    analyzer: Option<PathBuf>,
    analyzer_args: Option<Vec<String>>,
    check: Option<PathBuf>,
    check_args: Option<Vec<String>>,
    profile: Option<String>,
    scratch_dirs: Option<Vec<PathBuf>>,
    git_filter: Option<bool>,
}

/// Re-runs inspections on the directories of edited files once edits settle
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Quiet period after the last edit before inspecting, in milliseconds
    #[arg(long, default_value_t = DEFAULT_DEBOUNCE_MS, env = "AUTO_INSPECT_DEBOUNCE_MS")]
    pub debounce_ms: u64,

    /// Log filter: a level (trace, debug, info, warn, error) or an
    /// `EnvFilter` directive such as `auto_inspect=debug`
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "AUTO_INSPECT_LOG")]
    pub log_level: String,

    /// Workspace root used when the editor does not announce one
    #[arg(long, env = "AUTO_INSPECT_ROOT")]
    pub root: Option<PathBuf>,

    /// Analyzer executable; the files to inspect are appended to its arguments
    #[arg(long, env = "AUTO_INSPECT_ANALYZER")]
    pub analyzer: Option<PathBuf>,

    /// Extra argument passed to the analyzer before the file list
    #[arg(long = "analyzer-arg", allow_hyphen_values = true)]
    pub analyzer_args: Vec<String>,

    /// Syntax checker run per changed file; non-zero exit postpones inspection
    #[arg(long)]
    pub check: Option<PathBuf>,

    /// Extra argument passed to the syntax checker before the file
    #[arg(long = "check-arg", allow_hyphen_values = true)]
    pub check_args: Vec<String>,

    /// Inspection profile name handed to the analyzer
    #[arg(long, default_value = DEFAULT_PROFILE)]
    pub profile: String,

    /// Directory holding scratch files that are never inspected
    #[arg(long = "scratch-dir")]
    pub scratch_dirs: Vec<PathBuf>,

    /// Only track files git would list (tracked or untracked-but-not-ignored).
    /// Enabled unless turned off here or in the config file.
    #[arg(long, action = clap::ArgAction::Set)]
    pub git_filter: Option<bool>,
}

impl Config {
    /// Merge the config file underneath CLI args.
    /// Priority: CLI args > env vars > config file > defaults
    pub fn with_file_config(mut self) -> Self {
        if let Some(fc) = Self::load_config_file() {
            self.merge(fc);
        }

        if let Some(ref root) = self.root {
            if !root.is_dir() {
                warn!("Configured root is not a directory: {}, ignoring it", root.display());
                self.root = None;
            }
        }

        self
    }

    fn merge(&mut self, fc: FileConfig) {
        if let Some(v) = fc.debounce_ms {
            if self.debounce_ms == DEFAULT_DEBOUNCE_MS {
                self.debounce_ms = v;
            }
        }
        if let Some(v) = fc.log_level {
            if self.log_level == DEFAULT_LOG_LEVEL {
                self.log_level = v;
            }
        }
        if let Some(v) = fc.profile {
            if self.profile == DEFAULT_PROFILE {
                self.profile = v;
            }
        }
        if self.root.is_none() {
            self.root = fc.root;
        }
        if self.analyzer.is_none() {
            self.analyzer = fc.analyzer;
        }
        if self.analyzer_args.is_empty() {
            self.analyzer_args = fc.analyzer_args.unwrap_or_default();
        }
        if self.check.is_none() {
            self.check = fc.check;
        }
        if self.check_args.is_empty() {
            self.check_args = fc.check_args.unwrap_or_default();
        }
        if self.scratch_dirs.is_empty() {
            self.scratch_dirs = fc.scratch_dirs.unwrap_or_default();
        }
        if self.git_filter.is_none() {
            self.git_filter = fc.git_filter;
        }
    }

    /// Reject configurations the watcher cannot run with
    pub fn validate(&self) -> Result<(), InspectError> {
        if self.analyzer.is_none() {
            return Err(InspectError::ConfigError(
                "no analyzer configured (use --analyzer or \"analyzer\" in auto-inspect.json)"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn git_filter_enabled(&self) -> bool {
        self.git_filter.unwrap_or(true)
    }

    /// Filter for the log subscriber; an unparsable directive falls back to the default level
    pub fn log_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.log_level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
    }

    /// Load config from file (searches multiple locations)
    fn load_config_file() -> Option<FileConfig> {
        for path in Self::get_config_file_candidates() {
            if !path.exists() {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<FileConfig>(&content) {
                    Ok(config) => {
                        info!("Loaded config from: {}", path.display());
                        return Some(config);
                    }
                    Err(e) => {
                        warn!("Failed to parse {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    warn!("Failed to read {}: {}", path.display(), e);
                }
            }
        }
        None
    }

    /// Get list of config file candidates in priority order
    fn get_config_file_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(CONFIG_FILE_NAME));
        }

        #[cfg(windows)]
        if let Ok(userprofile) = std::env::var("USERPROFILE") {
            candidates.push(PathBuf::from(&userprofile).join(".config").join(CONFIG_FILE_NAME));
            candidates.push(PathBuf::from(&userprofile).join(CONFIG_FILE_NAME));
        }

        #[cfg(not(windows))]
        if let Ok(home) = std::env::var("HOME") {
            candidates.push(PathBuf::from(&home).join(".config").join(CONFIG_FILE_NAME));
            candidates.push(PathBuf::from(&home).join(format!(".{}", CONFIG_FILE_NAME)));
        }

        candidates
    }
}
