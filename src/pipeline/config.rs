//! Pipeline configuration.
//!
//! Every recognised option lives in [`PipelineConfig`] with its default.
//! Values are layered: defaults, then an optional YAML file, then `ROAST_*`
//! environment variables, then command-line flags applied by the caller.
//! [`PipelineConfig::validate`] runs before anything is started.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clients::HttpSettings;
use crate::error::ConfigError;
use crate::feedback::FeedbackConfig;
use crate::publish::{CaptionConfig, GateConfig, IntervalPolicy};
use crate::retry::RetryPolicy;
use crate::scheduler::BatchConfig;
use crate::scoring::{Thresholds, Weights};

/// Default number of artifacts analysed concurrently.
pub const DEFAULT_ANALYSIS_CONCURRENCY: usize = 10;

/// Settings for the Analyze stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Directory the vision process writes `{request_id}.json` signal files to.
    pub signals_dir: PathBuf,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_ANALYSIS_CONCURRENCY,
            retry: RetryPolicy::default(),
            signals_dir: PathBuf::from("./signals"),
        }
    }
}

/// Settings for the publishing capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Log instead of posting.
    pub dry_run: bool,
    pub http: HttpSettings,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            http: HttpSettings::default(),
        }
    }
}

/// Complete configuration of a pipeline run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch: BatchConfig,
    pub analysis: AnalysisConfig,
    pub thresholds: Thresholds,
    pub weights: Weights,
    pub gate: GateConfig,
    pub caption: CaptionConfig,
    pub generator: HttpSettings,
    pub publisher: PublisherConfig,
    pub feedback: FeedbackConfig,
    pub storage: StorageConfig,
}

/// Filesystem locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub history_path: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            history_path: PathBuf::from("./data/history.db"),
            output_dir: PathBuf::from("./output"),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a YAML document; missing keys keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Defaults or `path`, with environment overrides, validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `ROAST_*` overrides from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `ROAST_MAX_WORKERS`, `ROAST_QUEUE_CAPACITY`
    /// - `ROAST_PACING_MIN_SECS`, `ROAST_PACING_MAX_SECS`, `ROAST_JITTER_SEED`
    /// - `ROAST_MAX_RETRIES`, `ROAST_INITIAL_DELAY_SECS`, `ROAST_CALL_TIMEOUT_SECS`
    ///   (applied to both the generation and publish retry policies)
    /// - `ROAST_ANALYSIS_CONCURRENCY`, `ROAST_SIGNALS_DIR`
    /// - `ROAST_ROAST_THRESHOLD`, `ROAST_WARP_THRESHOLD`, `ROAST_MELT_THRESHOLD`
    /// - `ROAST_DAILY_LIMIT`, `ROAST_MIN_INTERVAL_SECS`, `ROAST_UTC_OFFSET_MINUTES`,
    ///   `ROAST_INTERVAL_POLICY` (`wait` or `skip`)
    /// - `ROAST_GENERATOR_URL`, `ROAST_GENERATOR_API_KEY`
    /// - `ROAST_PUBLISHER_URL`, `ROAST_PUBLISHER_API_KEY`, `ROAST_DRY_RUN`
    /// - `ROAST_FEEDBACK_ENABLED`, `ROAST_FEEDBACK_URL`, `ROAST_FEEDBACK_API_KEY`,
    ///   `ROAST_FEEDBACK_CONCURRENCY`
    /// - `ROAST_HISTORY_PATH`, `ROAST_OUTPUT_DIR`
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from any key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("ROAST_MAX_WORKERS") {
            self.batch.max_workers = parse_value(&val, "ROAST_MAX_WORKERS")?;
        }
        if let Some(val) = lookup("ROAST_QUEUE_CAPACITY") {
            self.batch.queue_capacity = parse_value(&val, "ROAST_QUEUE_CAPACITY")?;
        }
        if let Some(val) = lookup("ROAST_PACING_MIN_SECS") {
            self.batch.pacing_min = parse_secs(&val, "ROAST_PACING_MIN_SECS")?;
        }
        if let Some(val) = lookup("ROAST_PACING_MAX_SECS") {
            self.batch.pacing_max = parse_secs(&val, "ROAST_PACING_MAX_SECS")?;
        }
        if let Some(val) = lookup("ROAST_JITTER_SEED") {
            self.batch.jitter_seed = Some(parse_value(&val, "ROAST_JITTER_SEED")?);
        }

        if let Some(val) = lookup("ROAST_MAX_RETRIES") {
            let retries: u32 = parse_value(&val, "ROAST_MAX_RETRIES")?;
            self.batch.retry.max_retries = retries;
            self.gate.retry.max_retries = retries;
        }
        if let Some(val) = lookup("ROAST_INITIAL_DELAY_SECS") {
            let delay = parse_secs(&val, "ROAST_INITIAL_DELAY_SECS")?;
            self.batch.retry.initial_delay = delay;
            self.gate.retry.initial_delay = delay;
        }
        if let Some(val) = lookup("ROAST_CALL_TIMEOUT_SECS") {
            let timeout = parse_secs(&val, "ROAST_CALL_TIMEOUT_SECS")?;
            self.batch.retry.attempt_timeout = timeout;
            self.gate.retry.attempt_timeout = timeout;
        }

        if let Some(val) = lookup("ROAST_ANALYSIS_CONCURRENCY") {
            self.analysis.concurrency = parse_value(&val, "ROAST_ANALYSIS_CONCURRENCY")?;
        }
        if let Some(val) = lookup("ROAST_SIGNALS_DIR") {
            self.analysis.signals_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("ROAST_ROAST_THRESHOLD") {
            self.thresholds.roast_threshold = parse_value(&val, "ROAST_ROAST_THRESHOLD")?;
        }
        if let Some(val) = lookup("ROAST_WARP_THRESHOLD") {
            self.thresholds.warp_threshold = parse_value(&val, "ROAST_WARP_THRESHOLD")?;
        }
        if let Some(val) = lookup("ROAST_MELT_THRESHOLD") {
            self.thresholds.melt_threshold = parse_value(&val, "ROAST_MELT_THRESHOLD")?;
        }

        if let Some(val) = lookup("ROAST_DAILY_LIMIT") {
            self.gate.daily_limit = parse_value(&val, "ROAST_DAILY_LIMIT")?;
        }
        if let Some(val) = lookup("ROAST_MIN_INTERVAL_SECS") {
            self.gate.min_interval = parse_secs(&val, "ROAST_MIN_INTERVAL_SECS")?;
        }
        if let Some(val) = lookup("ROAST_UTC_OFFSET_MINUTES") {
            self.gate.utc_offset_minutes = parse_value(&val, "ROAST_UTC_OFFSET_MINUTES")?;
        }
        if let Some(val) = lookup("ROAST_INTERVAL_POLICY") {
            self.gate.interval_policy = parse_interval_policy(&val)?;
        }

        if let Some(val) = lookup("ROAST_GENERATOR_URL") {
            self.generator.base_url = val;
        }
        if let Some(val) = lookup("ROAST_GENERATOR_API_KEY") {
            self.generator.api_key = Some(val);
        }
        if let Some(val) = lookup("ROAST_PUBLISHER_URL") {
            self.publisher.http.base_url = val;
        }
        if let Some(val) = lookup("ROAST_PUBLISHER_API_KEY") {
            self.publisher.http.api_key = Some(val);
        }
        if let Some(val) = lookup("ROAST_DRY_RUN") {
            self.publisher.dry_run = parse_bool(&val, "ROAST_DRY_RUN")?;
        }

        if let Some(val) = lookup("ROAST_FEEDBACK_ENABLED") {
            self.feedback.enabled = parse_bool(&val, "ROAST_FEEDBACK_ENABLED")?;
        }
        if let Some(val) = lookup("ROAST_FEEDBACK_URL") {
            self.feedback.http.base_url = val;
        }
        if let Some(val) = lookup("ROAST_FEEDBACK_API_KEY") {
            self.feedback.http.api_key = Some(val);
        }
        if let Some(val) = lookup("ROAST_FEEDBACK_CONCURRENCY") {
            self.feedback.concurrency = parse_value(&val, "ROAST_FEEDBACK_CONCURRENCY")?;
        }

        if let Some(val) = lookup("ROAST_HISTORY_PATH") {
            self.storage.history_path = PathBuf::from(val);
        }
        if let Some(val) = lookup("ROAST_OUTPUT_DIR") {
            self.storage.output_dir = PathBuf::from(val);
        }
        Ok(())
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first invalid value found; these are fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.batch.validate()?;
        self.thresholds.validate()?;
        self.weights.validate()?;
        self.gate.validate()?;
        self.feedback.validate()?;

        if self.analysis.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "analysis.concurrency must be at least 1".to_string(),
            ));
        }
        if self.analysis.retry.attempt_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "analysis.retry.attempt_timeout must be positive".to_string(),
            ));
        }
        if self.caption.max_chars == 0 {
            return Err(ConfigError::ValidationFailed(
                "caption.max_chars must be at least 1".to_string(),
            ));
        }
        if !self.publisher.dry_run && self.publisher.http.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "publisher.http.base_url is required unless dry_run is set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_weights(mut self, weights: Weights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_analysis(mut self, analysis: AnalysisConfig) -> Self {
        self.analysis = analysis;
        self
    }

    pub fn with_caption(mut self, caption: CaptionConfig) -> Self {
        self.caption = caption;
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackConfig) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.output_dir = dir.into();
        self
    }

    pub fn with_history_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.history_path = path.into();
        self
    }
}

/// Parse a configuration value into a type.
fn parse_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse a non-negative number of seconds.
fn parse_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_value(value, key)?;
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected a non-negative number of seconds, got '{}'", value),
    })
}

/// Parse a boolean flag.
fn parse_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

fn parse_interval_policy(value: &str) -> Result<IntervalPolicy, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "wait" => Ok(IntervalPolicy::Wait),
        "skip" => Ok(IntervalPolicy::Skip),
        _ => Err(ConfigError::InvalidValue {
            key: "ROAST_INTERVAL_POLICY".to_string(),
            message: format!("expected 'wait' or 'skip', got '{}'", value),
        }),
    }
}
