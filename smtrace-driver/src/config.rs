//! Analysis configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via SMTRACE_CONFIG or --config)
//! 3. Environment variables
//! 4. Command line flags (applied by the binary)

use serde::{Deserialize, Serialize};
use smtrace_core::event::DEFAULT_ENTITY_FIELD;
use smtrace_core::{AdaptiveStrategy, ClusterStrategy, PercentileStrategy, Timestamp};
use std::path::{Path, PathBuf};

/// Analysis configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the model, trace and kernel data come from.
    pub input: InputConfig,
    /// How the group is built and finalized.
    pub analysis: AnalysisConfig,
    /// What is reported.
    pub output: OutputConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SMTRACE_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::file(path, e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Yaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self).map_err(|e| ConfigError::Yaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|e| ConfigError::file(path, e))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `SMTRACE_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.input.apply_overrides(&lookup);
        self.analysis.apply_overrides(&lookup);
        self.output.apply_overrides(&lookup);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.input.validate()?;
        self.analysis.validate()
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Input configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Model definition (JSON).
    pub model: Option<PathBuf>,
    /// Trace events (JSON lines).
    pub events: Option<PathBuf>,
    /// Kernel scheduling and counter records (JSON lines).
    pub kernel_log: Option<PathBuf>,
    /// Event field holding the entity id.
    pub entity_field: String,
    /// Events before this timestamp are skipped.
    pub start: Option<Timestamp>,
    /// Events after this timestamp are skipped.
    pub end: Option<Timestamp>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            model: None,
            events: None,
            kernel_log: None,
            entity_field: DEFAULT_ENTITY_FIELD.to_string(),
            start: None,
            end: None,
        }
    }
}

impl InputConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("SMTRACE_MODEL") {
            self.model = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("SMTRACE_EVENTS") {
            self.events = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("SMTRACE_KERNEL_LOG") {
            self.kernel_log = Some(PathBuf::from(path));
        }
        if let Some(field) = lookup("SMTRACE_ENTITY_FIELD") {
            self.entity_field = field;
        }
        if let Some(start) = lookup("SMTRACE_START") {
            if let Ok(ts) = start.parse() {
                self.start = Some(ts);
            }
        }
        if let Some(end) = lookup("SMTRACE_END") {
            if let Ok(ts) = end.parse() {
                self.end = Some(ts);
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.entity_field.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                key: "input.entity_field",
                reason: "must name an event field".to_string(),
            });
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(ConfigError::InvalidSetting {
                    key: "input.start",
                    reason: format!("window starts at {} but input.end is {}", start, end),
                });
            }
        }
        Ok(())
    }

    /// Whether `ts` falls inside the configured window.
    pub fn in_window(&self, ts: Timestamp) -> bool {
        self.start.map_or(true, |start| ts >= start) && self.end.map_or(true, |end| ts <= end)
    }
}

/// Adaptive decision strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Cluster the samples and bound the dominant cluster.
    #[default]
    Cluster,
    /// Bound the samples at a percentile.
    Percentile,
}

/// Analysis configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub strategy: StrategyKind,
    /// Percentile used by the percentile strategy.
    pub percentile: f64,
    /// Learn adaptive constraints as if every run were valid.
    pub all_instances_valid: bool,
    /// Drop verdicts of adaptive constraints that could not be decided.
    pub clean_up_adaptive: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Cluster,
            percentile: 95.0,
            all_instances_valid: false,
            clean_up_adaptive: true,
        }
    }
}

impl AnalysisConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(strategy) = lookup("SMTRACE_STRATEGY") {
            match strategy.to_lowercase().as_str() {
                "cluster" => self.strategy = StrategyKind::Cluster,
                "percentile" => self.strategy = StrategyKind::Percentile,
                _ => {}
            }
        }
        if let Some(percentile) = lookup("SMTRACE_PERCENTILE") {
            if let Ok(p) = percentile.parse() {
                self.percentile = p;
            }
        }
        if let Some(all_valid) = lookup("SMTRACE_ALL_VALID") {
            self.all_instances_valid = parse_flag(&all_valid);
        }
        if let Some(clean_up) = lookup("SMTRACE_CLEAN_UP") {
            self.clean_up_adaptive = parse_flag(&clean_up);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.percentile > 0.0 && self.percentile <= 100.0) {
            return Err(ConfigError::InvalidSetting {
                key: "analysis.percentile",
                reason: format!("{} is not a percentile in (0, 100]", self.percentile),
            });
        }
        Ok(())
    }

    /// Builds the configured adaptive strategy.
    pub fn strategy(&self) -> Box<dyn AdaptiveStrategy> {
        match self.strategy {
            StrategyKind::Cluster => Box::new(ClusterStrategy),
            StrategyKind::Percentile => Box::new(PercentileStrategy::new(self.percentile)),
        }
    }
}

/// Report format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Output configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    /// Include a full dump of every instance.
    pub dump_instances: bool,
    /// Also write the segments as JSON to this file.
    pub segments_file: Option<PathBuf>,
}

impl OutputConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(format) = lookup("SMTRACE_FORMAT") {
            match format.to_lowercase().as_str() {
                "text" => self.format = OutputFormat::Text,
                "json" => self.format = OutputFormat::Json,
                _ => {}
            }
        }
        if let Some(dump) = lookup("SMTRACE_DUMP_INSTANCES") {
            self.dump_instances = parse_flag(&dump);
        }
        if let Some(path) = lookup("SMTRACE_SEGMENTS_FILE") {
            self.segments_file = Some(PathBuf::from(path));
        }
    }
}

/// Why an analysis configuration could not be used.
#[derive(Debug)]
pub enum ConfigError {
    /// The YAML file could not be read or written.
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The YAML file does not describe an analysis.
    Yaml { path: PathBuf, message: String },
    /// A setting is out of range; `key` is its dotted YAML path.
    InvalidSetting { key: &'static str, reason: String },
}

impl ConfigError {
    fn file(path: &Path, source: std::io::Error) -> Self {
        ConfigError::File {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Dotted path of the offending setting, if one is known.
    pub fn key(&self) -> Option<&'static str> {
        match self {
            ConfigError::InvalidSetting { key, .. } => Some(*key),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::File { path, source } => write!(
                f,
                "analysis config '{}' is not accessible: {}",
                path.display(),
                source
            ),
            ConfigError::Yaml { path, message } => write!(
                f,
                "analysis config '{}' is not valid YAML for smtrace: {}",
                path.display(),
                message
            ),
            ConfigError::InvalidSetting { key, reason } => write!(f, "setting {}: {}", key, reason),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::File { source, .. } => Some(source),
            _ => None,
        }
    }
}
