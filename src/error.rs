//! Error types for Floodgate.

use std::time::Duration;

use thiserror::Error;

use crate::config::LimiterKind;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Invalid limiter configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Configuration could not be read or merged
    #[error("Settings error: {0}")]
    Settings(#[from] ::config::ConfigError),

    /// Configuration could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Counter store errors
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;

impl FloodgateError {
    /// Whether the error was caused by invalid configuration values.
    pub fn is_config(&self) -> bool {
        matches!(self, FloodgateError::Config(_))
    }
}

/// A limiter configuration that cannot be constructed.
///
/// Construction never partially succeeds: any of these fails the whole build.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("capacity must be greater than zero")]
    ZeroCapacity,

    #[error("{0} requires a non-zero period")]
    ZeroPeriod(LimiterKind),

    #[error("adaptive bounds are invalid: min {min}, initial {initial}, max {max}")]
    InvalidBounds { min: u64, initial: u64, max: u64 },

    #[error("adaptive thresholds are invalid: decrease below {decrease_below}, increase above {increase_above}")]
    InvalidThresholds {
        decrease_below: f64,
        increase_above: f64,
    },

    #[error("idle timeout and sweep interval must be greater than zero")]
    ZeroSweep,
}

/// Why an admission did not complete.
///
/// All of these are recoverable; the caller decides whether to retry,
/// queue elsewhere, or drop the work.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// The deadline elapsed before capacity became available.
    #[error("timed out after {0:?} waiting for capacity")]
    Timeout(Duration),

    /// The caller's cancellation signal fired while waiting.
    #[error("wait was canceled")]
    Canceled,

    /// The limiter refused the request outright (for example a full queue).
    #[error("request rejected: {0}")]
    Rejected(&'static str),

    /// The request can never be admitted by this limiter.
    #[error("cost {cost} exceeds capacity {capacity}")]
    Unsatisfiable { cost: u64, capacity: u64 },
}

/// Errors raised by a [`CounterStore`](crate::store::CounterStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter overflow for key {0}")]
    Overflow(String),
}
