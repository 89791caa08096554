//! Admission-control configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, AdmissionResult};
use crate::types::HeadroomCheck;

/// Length of the rolling RPM/BPM window.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Default bound on a single store operation.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

/// Configuration for the usage ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Rolling window length in seconds.
    pub window_secs: u64,
    /// How long events are kept before pruning, in seconds. Never shorter
    /// than the window.
    pub retention_secs: u64,
    /// Bound on each store operation in milliseconds.
    pub store_timeout_ms: u64,
    /// Interval between background prune passes in seconds.
    pub prune_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW_SECS,
            retention_secs: DEFAULT_WINDOW_SECS,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            prune_interval_secs: 30,
        }
    }
}

impl LedgerConfig {
    /// Rolling window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Retention horizon, at least as long as the window.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        if self.retention_secs > self.window_secs {
            Duration::from_secs(self.retention_secs)
        } else {
            Duration::from_secs(self.window_secs)
        }
    }

    /// Bound on each store operation.
    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Interval between background prune passes.
    #[must_use]
    pub const fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    /// Set the window length in seconds.
    #[must_use]
    pub const fn with_window_secs(mut self, secs: u64) -> Self {
        self.window_secs = secs;
        self
    }

    /// Set the retention horizon in seconds.
    #[must_use]
    pub const fn with_retention_secs(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    /// Set the store timeout in milliseconds.
    #[must_use]
    pub const fn with_store_timeout_ms(mut self, ms: u64) -> Self {
        self.store_timeout_ms = ms;
        self
    }

    /// Set the prune interval in seconds.
    #[must_use]
    pub const fn with_prune_interval_secs(mut self, secs: u64) -> Self {
        self.prune_interval_secs = secs;
        self
    }

    /// Validate the ledger settings.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::Config` for a zero window, timeout or prune interval.
    pub fn validate(&self) -> AdmissionResult<()> {
        if self.window_secs == 0 {
            return Err(AdmissionError::Config("window_secs must be > 0".to_string()));
        }
        if self.store_timeout_ms == 0 {
            return Err(AdmissionError::Config("store_timeout_ms must be > 0".to_string()));
        }
        if self.prune_interval_secs == 0 {
            return Err(AdmissionError::Config("prune_interval_secs must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Node selection strategy among eligible nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Uniform random choice.
    #[default]
    UniformRandom,
    /// Rotate through eligible nodes in id order.
    RoundRobin,
    /// Random choice weighted by remaining headroom.
    WeightedHeadroom,
}

/// Configuration for admission decisions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Whether the incoming workload counts against the BPM limit.
    pub headroom_check: HeadroomCheck,
    /// Selection strategy.
    pub selection: SelectionStrategy,
    /// Seed for the selection random source (random seed when unset).
    pub seed: Option<u64>,
}

/// Complete admission-control configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadroomConfig {
    /// Ledger settings.
    pub ledger: LedgerConfig,
    /// Admission settings.
    pub admission: AdmissionConfig,
}

impl HeadroomConfig {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> HeadroomConfigBuilder {
        HeadroomConfigBuilder::default()
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found.
    pub fn validate(&self) -> AdmissionResult<()> {
        self.ledger.validate()
    }
}

/// Builder for `HeadroomConfig`.
#[derive(Debug, Clone, Default)]
pub struct HeadroomConfigBuilder {
    config: HeadroomConfig,
}

impl HeadroomConfigBuilder {
    /// Set ledger configuration.
    #[must_use]
    pub fn ledger(mut self, config: LedgerConfig) -> Self {
        self.config.ledger = config;
        self
    }

    /// Set how the incoming workload is checked.
    #[must_use]
    pub const fn headroom_check(mut self, check: HeadroomCheck) -> Self {
        self.config.admission.headroom_check = check;
        self
    }

    /// Set the selection strategy.
    #[must_use]
    pub const fn selection(mut self, strategy: SelectionStrategy) -> Self {
        self.config.admission.selection = strategy;
        self
    }

    /// Seed the selection random source.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.config.admission.seed = Some(seed);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> HeadroomConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.window(), Duration::from_secs(60));
        assert_eq!(config.retention(), Duration::from_secs(60));
        assert_eq!(config.store_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retention_never_shorter_than_window() {
        let config = LedgerConfig::default().with_retention_secs(10);
        assert_eq!(config.retention(), Duration::from_secs(60));

        let config = LedgerConfig::default().with_retention_secs(600);
        assert_eq!(config.retention(), Duration::from_secs(600));
    }

    #[test]
    fn test_ledger_validation() {
        assert!(LedgerConfig::default().with_window_secs(0).validate().is_err());
        assert!(LedgerConfig::default().with_store_timeout_ms(0).validate().is_err());
        assert!(LedgerConfig::default().with_prune_interval_secs(0).validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = HeadroomConfig::builder()
            .ledger(LedgerConfig::default().with_window_secs(30))
            .headroom_check(HeadroomCheck::Current)
            .selection(SelectionStrategy::RoundRobin)
            .seed(7)
            .build();

        assert_eq!(config.ledger.window_secs, 30);
        assert_eq!(config.admission.headroom_check, HeadroomCheck::Current);
        assert_eq!(config.admission.selection, SelectionStrategy::RoundRobin);
        assert_eq!(config.admission.seed, Some(7));
    }

    #[test]
    fn test_default_admission() {
        let config = AdmissionConfig::default();
        assert_eq!(config.headroom_check, HeadroomCheck::Projected);
        assert_eq!(config.selection, SelectionStrategy::UniformRandom);
        assert!(config.seed.is_none());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: HeadroomConfig = serde_json::from_str(
            r#"{"ledger": {"window_secs": 120}, "admission": {"selection": "weighted_headroom"}}"#,
        )
        .unwrap();
        assert_eq!(config.ledger.window_secs, 120);
        assert_eq!(config.ledger.store_timeout_ms, DEFAULT_STORE_TIMEOUT_MS);
        assert_eq!(config.admission.selection, SelectionStrategy::WeightedHeadroom);
    }
}
