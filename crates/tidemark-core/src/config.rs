//! Configuration module for Tidemark.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::domain::PathCase;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for Tidemark.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watch: WatchConfig,
    pub logging: LoggingConfig,
}

/// Watched tree and debounce settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Root directory of the watched tree.
    pub root: PathBuf,
    /// Quiet period (ms) a change must see before it fires.
    pub debounce_delay_ms: u64,
    /// How many times a change may be re-armed before it fires regardless.
    pub max_resets: u32,
    /// How long (ms) fired changes accumulate before a batch is dispatched.
    pub batch_window_ms: u64,
    /// Batch size that triggers an immediate dispatch.
    pub batch_limit: usize,
    /// Whether paths differing only in case are distinct entries.
    pub case_sensitive: bool,
    /// Capacity of the watcher-to-engine notification channel.
    pub channel_capacity: usize,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

/// Timing knobs of the debounce queue, in the form the queue consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceSettings {
    pub delay: Duration,
    pub max_resets: u32,
    pub batch_window: Duration,
    pub batch_limit: usize,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        WatchConfig::default().debounce_settings()
    }
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/tidemark/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("tidemark")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("Tidemark"),
            debounce_delay_ms: 2000,
            max_resets: 500,
            batch_window_ms: 1000,
            batch_limit: 500,
            case_sensitive: true,
            channel_capacity: 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl WatchConfig {
    /// Debounce timings as durations.
    pub fn debounce_settings(&self) -> DebounceSettings {
        DebounceSettings {
            delay: Duration::from_millis(self.debounce_delay_ms),
            max_resets: self.max_resets,
            batch_window: Duration::from_millis(self.batch_window_ms),
            batch_limit: self.batch_limit,
        }
    }

    /// Key comparison rule for the index and queue.
    pub fn path_case(&self) -> PathCase {
        if self.case_sensitive {
            PathCase::Sensitive
        } else {
            PathCase::Insensitive
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"watch.batch_limit"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut positive = |field: &str, value: u64| {
            if value == 0 {
                errors.push(ValidationError {
                    field: field.into(),
                    message: "must be greater than 0".into(),
                });
            }
        };

        // --- watch ---
        positive("watch.debounce_delay_ms", self.watch.debounce_delay_ms);
        positive("watch.max_resets", u64::from(self.watch.max_resets));
        positive("watch.batch_window_ms", self.watch.batch_window_ms);
        positive("watch.batch_limit", self.watch.batch_limit as u64);
        positive("watch.channel_capacity", self.watch.channel_capacity as u64);

        // Tilde paths are expanded at runtime.
        let root_str = self.watch.root.to_string_lossy();
        if !root_str.starts_with('~') && !self.watch.root.is_dir() {
            errors.push(ValidationError {
                field: "watch.root".into(),
                message: format!("directory does not exist: {}", self.watch.root.display()),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}', expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for [`Config`] used by tests and embedding applications.
///
/// ```
/// use tidemark_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .watch_debounce_delay_ms(500)
///     .logging_level("debug")
///     .build();
/// assert_eq!(config.watch.debounce_delay_ms, 500);
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- watch ---

    pub fn watch_root(mut self, root: PathBuf) -> Self {
        self.config.watch.root = root;
        self
    }

    pub fn watch_debounce_delay_ms(mut self, ms: u64) -> Self {
        self.config.watch.debounce_delay_ms = ms;
        self
    }

    pub fn watch_max_resets(mut self, n: u32) -> Self {
        self.config.watch.max_resets = n;
        self
    }

    pub fn watch_batch_window_ms(mut self, ms: u64) -> Self {
        self.config.watch.batch_window_ms = ms;
        self
    }

    pub fn watch_batch_limit(mut self, n: usize) -> Self {
        self.config.watch.batch_limit = n;
        self
    }

    pub fn watch_case_sensitive(mut self, sensitive: bool) -> Self {
        self.config.watch.case_sensitive = sensitive;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    // -- Defaults --

    #[test]
    fn default_config_has_expected_timings() {
        let cfg = Config::default();
        assert_eq!(cfg.watch.debounce_delay_ms, 2000);
        assert_eq!(cfg.watch.max_resets, 500);
        assert_eq!(cfg.watch.batch_window_ms, 1000);
        assert_eq!(cfg.watch.batch_limit, 500);
        assert!(cfg.watch.case_sensitive);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn debounce_settings_convert_to_durations() {
        let settings = Config::default().watch.debounce_settings();
        assert_eq!(settings.delay, Duration::from_secs(2));
        assert_eq!(settings.batch_window, Duration::from_secs(1));
        assert_eq!(settings, DebounceSettings::default());
    }

    #[test]
    fn default_config_passes_validation_apart_from_root() {
        let errors = Config::default().validate();
        let non_root: Vec<_> = errors.iter().filter(|e| e.field != "watch.root").collect();
        assert!(non_root.is_empty(), "unexpected validation errors: {non_root:?}");
    }

    // -- Loading --

    #[test]
    fn load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "watch:\n  root: {}\n  debounce_delay_ms: 250\n  case_sensitive: false\nlogging:\n  level: debug\n  json: true\n",
            dir.path().display()
        );
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.watch.root, dir.path());
        assert_eq!(cfg.watch.debounce_delay_ms, 250);
        // Unset fields keep their defaults.
        assert_eq!(cfg.watch.batch_limit, 500);
        assert_eq!(cfg.watch.path_case(), PathCase::Insensitive);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg.watch.debounce_delay_ms, 2000);
    }

    #[test]
    fn load_returns_error_on_invalid_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"watch: [unterminated").unwrap();
        tmp.flush().unwrap();
        assert!(Config::load(tmp.path()).is_err());
    }

    // -- Validation --

    #[test]
    fn validate_catches_zero_values_and_bad_level() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigBuilder::new()
            .watch_root(dir.path().to_path_buf())
            .watch_debounce_delay_ms(0)
            .watch_batch_limit(0)
            .logging_level("verbose")
            .build_validated();

        let errors = result.unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["watch.debounce_delay_ms", "watch.batch_limit", "logging.level"]
        );
    }

    #[test]
    fn validate_reports_missing_root() {
        let cfg = ConfigBuilder::new()
            .watch_root(PathBuf::from("/definitely/not/here"))
            .build();
        assert!(cfg.validate().iter().any(|e| e.field == "watch.root"));
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError {
            field: "watch.batch_limit".into(),
            message: "must be greater than 0".into(),
        };
        assert_eq!(err.to_string(), "watch.batch_limit: must be greater than 0");
    }
}
