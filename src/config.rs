//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{ConfigError, Result};

/// Environment prefix for configuration overrides, e.g. `FLOODGATE__LIMITER__CAPACITY=20`.
const ENV_PREFIX: &str = "FLOODGATE";

/// Top-level configuration for a Floodgate engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// The limiter every request (or every key) is admitted through
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Per-key multiplexing settings
    #[serde(default)]
    pub keyed: Option<KeyedConfig>,

    /// Settings for limiters backed by a shared counter store
    #[serde(default)]
    pub distributed: Option<DistributedConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterConfig::default(),
            keyed: None,
            distributed: None,
        }
    }
}

/// The admission strategy a limiter implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    TokenBucket,
    LeakyBucket,
    FixedWindow,
    SlidingWindow,
    Concurrency,
    Adaptive,
}

impl LimiterKind {
    /// Whether the strategy reads `period_ms`.
    pub fn uses_period(&self) -> bool {
        !matches!(self, LimiterKind::Concurrency)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterKind::TokenBucket => "token_bucket",
            LimiterKind::LeakyBucket => "leaky_bucket",
            LimiterKind::FixedWindow => "fixed_window",
            LimiterKind::SlidingWindow => "sliding_window",
            LimiterKind::Concurrency => "concurrency",
            LimiterKind::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a single limiter instance.
///
/// `capacity` and `period_ms` mean slightly different things per strategy:
///
/// | kind             | capacity              | period                 |
/// |------------------|-----------------------|------------------------|
/// | `token_bucket`   | bucket size           | time to refill a token |
/// | `leaky_bucket`   | queue length          | drain interval         |
/// | `fixed_window`   | admissions per window | window length          |
/// | `sliding_window` | admissions per window | window length          |
/// | `concurrency`    | in-flight limit       | unused                 |
/// | `adaptive`       | maximum limit         | adjustment interval    |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Admission strategy
    #[serde(default = "default_kind")]
    pub kind: LimiterKind,

    /// Capacity of the limiter
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Refill period, drain interval, window or adjustment interval in milliseconds
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Feedback settings, only read by the adaptive strategy
    #[serde(default)]
    pub adaptive: Option<AdaptiveSettings>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            capacity: default_capacity(),
            period_ms: default_period_ms(),
            adaptive: None,
        }
    }
}

fn default_kind() -> LimiterKind {
    LimiterKind::TokenBucket
}

fn default_capacity() -> u64 {
    10
}

fn default_period_ms() -> u64 {
    100
}

impl LimiterConfig {
    /// Create a configuration for the given strategy.
    ///
    /// Periods are kept in whole milliseconds; a sub-millisecond remainder
    /// rounds up so a non-zero period never becomes zero.
    pub fn new(kind: LimiterKind, capacity: u64, period: Duration) -> Self {
        Self {
            kind,
            capacity,
            period_ms: u64::try_from(period.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX),
            adaptive: None,
        }
    }

    /// Builder-style: set adaptive feedback settings.
    pub fn with_adaptive(mut self, settings: AdaptiveSettings) -> Self {
        self.adaptive = Some(settings);
        self
    }

    /// The configured period as a [`Duration`].
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Adaptive settings, falling back to the defaults.
    pub fn adaptive_settings(&self) -> AdaptiveSettings {
        self.adaptive.clone().unwrap_or_default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        validate_shape(self.kind, self.capacity, self.period())?;
        if self.kind == LimiterKind::Adaptive {
            self.adaptive_settings().validate(self.capacity)?;
        }
        Ok(())
    }
}

/// Check the capacity and period every strategy is built from.
pub(crate) fn validate_shape(
    kind: LimiterKind,
    capacity: u64,
    period: Duration,
) -> std::result::Result<(), ConfigError> {
    if capacity == 0 {
        return Err(ConfigError::ZeroCapacity);
    }
    if kind.uses_period() && period.is_zero() {
        return Err(ConfigError::ZeroPeriod(kind));
    }
    Ok(())
}

/// Tuning for the adaptive limiter's feedback loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveSettings {
    /// Lowest limit the feedback loop may shrink to
    #[serde(default = "default_min_limit")]
    pub min_limit: u64,

    /// Starting limit; defaults to `min_limit`
    #[serde(default)]
    pub initial_limit: Option<u64>,

    /// Success ratio above which the limit grows by one
    #[serde(default = "default_increase_above")]
    pub increase_above: f64,

    /// Success ratio below which the limit shrinks by one
    #[serde(default = "default_decrease_below")]
    pub decrease_below: f64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            min_limit: default_min_limit(),
            initial_limit: None,
            increase_above: default_increase_above(),
            decrease_below: default_decrease_below(),
        }
    }
}

fn default_min_limit() -> u64 {
    1
}

fn default_increase_above() -> f64 {
    0.9
}

fn default_decrease_below() -> f64 {
    0.5
}

impl AdaptiveSettings {
    /// Create settings with the given lower bound and default thresholds.
    pub fn new(min_limit: u64) -> Self {
        Self {
            min_limit,
            ..Self::default()
        }
    }

    /// Builder-style: set the starting limit.
    pub fn initial(mut self, initial_limit: u64) -> Self {
        self.initial_limit = Some(initial_limit);
        self
    }

    /// Builder-style: set both success-ratio thresholds.
    pub fn thresholds(mut self, decrease_below: f64, increase_above: f64) -> Self {
        self.decrease_below = decrease_below;
        self.increase_above = increase_above;
        self
    }

    pub fn initial_limit(&self) -> u64 {
        self.initial_limit.unwrap_or(self.min_limit)
    }

    /// Validate against the maximum limit.
    pub fn validate(&self, max_limit: u64) -> std::result::Result<(), ConfigError> {
        let initial = self.initial_limit();
        if self.min_limit == 0 || self.min_limit > max_limit || !(self.min_limit..=max_limit).contains(&initial) {
            return Err(ConfigError::InvalidBounds {
                min: self.min_limit,
                initial,
                max: max_limit,
            });
        }

        let in_unit = |r: f64| (0.0..=1.0).contains(&r);
        if !in_unit(self.decrease_below)
            || !in_unit(self.increase_above)
            || self.decrease_below > self.increase_above
        {
            return Err(ConfigError::InvalidThresholds {
                decrease_below: self.decrease_below,
                increase_above: self.increase_above,
            });
        }
        Ok(())
    }
}

/// Per-key multiplexing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedConfig {
    /// Keys not accessed for this long are eligible for removal
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// How often the idle sweep runs
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Keys that get their own limiter configuration instead of the shared one
    #[serde(default)]
    pub overrides: HashMap<String, LimiterConfig>,
}

impl Default for KeyedConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            overrides: HashMap::new(),
        }
    }
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

impl KeyedConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// The configuration a key should be built from.
    pub fn limiter_for<'a>(&'a self, key: &str, default: &'a LimiterConfig) -> &'a LimiterConfig {
        self.overrides.get(key).unwrap_or(default)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.idle_timeout_ms == 0 || self.sweep_interval_ms == 0 {
            return Err(ConfigError::ZeroSweep);
        }
        for limiter in self.overrides.values() {
            limiter.validate()?;
        }
        Ok(())
    }
}

/// Settings for limiters whose counters live in a shared store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Identifier of this node; a random one is generated when absent
    #[serde(default)]
    pub node_id: Option<String>,
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, layered with
    /// `FLOODGATE__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }
        let config: EngineConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every limiter configuration reachable from this config.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.limiter.validate()?;
        if let Some(keyed) = &self.keyed {
            keyed.validate()?;
        }
        Ok(())
    }
}
