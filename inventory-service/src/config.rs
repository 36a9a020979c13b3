use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::availability::AlwaysAvailableSkus;

/// Runtime configuration handed to the dispatcher, read model and rollup.
#[derive(Debug, Clone, Default)]
pub struct InventoryConfig {
    pub capabilities: Capabilities,
    pub rollup: RollupConfig,
    pub always_available_skus: Vec<String>,
}

impl InventoryConfig {
    /// Exempt SKU set for a [`ReadModel`](crate::reads::ReadModel). Embedders
    /// set `always_available_skus`; the service binary has no read surface.
    pub fn availability(&self) -> AlwaysAvailableSkus {
        AlwaysAvailableSkus::new(self.always_available_skus.iter().cloned())
    }
}

/// What this inventory backend advertises to its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub allocation_tracked: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            allocation_tracked: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollupConfig {
    /// Keys with fewer live journal rows are skipped.
    pub min_rows: usize,
    pub interval: Duration,
    pub mode: RollupMode,
    pub failure_policy: FailurePolicy,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            min_rows: 2,
            interval: Duration::from_secs(60),
            mode: RollupMode::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Where a compaction puts the summed deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum RollupMode {
    /// Replace the summed rows with one consolidated journal row.
    #[default]
    Consolidate,
    /// Add the sum to the base row. Keys without a base row fall back to
    /// a consolidated journal row.
    MergeIntoBase,
}

/// How a batch pass reacts to a key that fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum FailurePolicy {
    /// Log the key and move on to the next one.
    #[default]
    Isolate,
    /// Stop the pass at the first failing key.
    FailFast,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::SkuAvailability;

    #[test]
    fn defaults() {
        let config = InventoryConfig::default();
        assert!(config.capabilities.allocation_tracked);
        assert_eq!(config.rollup.min_rows, 2);
        assert_eq!(config.rollup.interval, Duration::from_secs(60));
        assert_eq!(config.rollup.mode, RollupMode::Consolidate);
        assert_eq!(config.rollup.failure_policy, FailurePolicy::Isolate);
        assert!(config.always_available_skus.is_empty());
    }

    #[test]
    fn availability_uses_configured_skus() {
        let config = InventoryConfig {
            always_available_skus: vec!["GIFT-CARD".to_string()],
            ..InventoryConfig::default()
        };
        let availability = config.availability();
        assert!(availability.is_always_available("GIFT-CARD"));
        assert!(!availability.is_always_available("SKU-1"));
    }

    #[test]
    fn value_enums_parse_kebab_case() {
        assert_eq!(
            RollupMode::from_str("merge-into-base", false).unwrap(),
            RollupMode::MergeIntoBase
        );
        assert_eq!(
            FailurePolicy::from_str("fail-fast", false).unwrap(),
            FailurePolicy::FailFast
        );
    }
}
