//! Rate Limit Configuration
//!
//! Static per-operation limits and the read-only registry built from them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CoordinatorError;

/// Limits for one named external operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Operation name callers pass to `acquire`
    pub operation: String,

    /// Sustained refill rate (tokens per second)
    pub rate_per_second: f64,

    /// Maximum tokens the bucket holds
    pub burst_capacity: u32,

    /// Minimum spacing between queued grants in milliseconds
    #[serde(default)]
    pub min_delay_ms: u64,

    /// Largest number of items one call may carry
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,
}

fn default_max_batch_size() -> u32 {
    1
}

/// Built-in operation table used when the config file defines none.
///
/// (operation, rate/s, burst, min delay ms, max batch size)
pub const DEFAULT_OPERATIONS: &[(&str, f64, u32, u64, u32)] = &[
    ("catalog.get_item", 2.0, 2, 0, 1),
    ("catalog.search", 2.0, 2, 0, 20),
    ("pricing.item_offers", 0.5, 1, 0, 1),
    ("pricing.competitive", 0.5, 1, 0, 20),
    ("fees.estimate", 1.0, 2, 500, 20),
];

impl RateLimitConfig {
    /// Create a configuration entry
    pub fn new(operation: &str, rate_per_second: f64, burst_capacity: u32) -> Self {
        Self {
            operation: operation.to_string(),
            rate_per_second,
            burst_capacity,
            min_delay_ms: 0,
            max_batch_size: default_max_batch_size(),
        }
    }

    /// Set the minimum spacing between queued grants
    pub fn min_delay_ms(mut self, min_delay_ms: u64) -> Self {
        self.min_delay_ms = min_delay_ms;
        self
    }

    /// Set the maximum batch size
    pub fn max_batch_size(mut self, max_batch_size: u32) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Minimum spacing as a duration
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    /// Time to refill `tokens` tokens from empty
    pub fn refill_time(&self, tokens: f64) -> Duration {
        Duration::from_secs_f64((tokens.max(0.0)) / self.rate_per_second)
    }

    /// Validate the entry
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.operation.trim().is_empty() {
            anyhow::bail!("Operation name must not be empty");
        }
        if !self.rate_per_second.is_finite() || self.rate_per_second <= 0.0 {
            anyhow::bail!(
                "Operation '{}' has invalid rate_per_second {}: must be > 0",
                self.operation,
                self.rate_per_second
            );
        }
        if self.burst_capacity == 0 {
            anyhow::bail!("Operation '{}' must have burst_capacity >= 1", self.operation);
        }
        if self.max_batch_size == 0 {
            anyhow::bail!("Operation '{}' must have max_batch_size >= 1", self.operation);
        }
        Ok(())
    }
}

/// Read-only lookup table of operation limits.
///
/// Built once at startup; unknown operations fail fast instead of falling
/// back to a default entry.
#[derive(Debug, Clone)]
pub struct OperationRegistry {
    entries: HashMap<String, Arc<RateLimitConfig>>,
}

impl OperationRegistry {
    /// Build a registry, rejecting invalid or duplicate entries
    pub fn new(configs: Vec<RateLimitConfig>) -> anyhow::Result<Self> {
        let mut entries = HashMap::with_capacity(configs.len());
        for config in configs {
            config.validate()?;
            let name = config.operation.clone();
            if entries.insert(name.clone(), Arc::new(config)).is_some() {
                anyhow::bail!("Operation '{}' is configured more than once", name);
            }
        }
        if entries.is_empty() {
            anyhow::bail!("At least one operation must be configured");
        }
        Ok(Self { entries })
    }

    /// Registry populated from [`DEFAULT_OPERATIONS`]
    pub fn builtin() -> Self {
        let entries = default_operations()
            .into_iter()
            .map(|c| (c.operation.clone(), Arc::new(c)))
            .collect();
        Self { entries }
    }

    /// Look up an operation
    pub fn get(&self, operation: &str) -> Result<&Arc<RateLimitConfig>, CoordinatorError> {
        self.entries
            .get(operation)
            .ok_or_else(|| CoordinatorError::UnknownOperation(operation.to_string()))
    }

    /// Whether an operation is configured
    pub fn contains(&self, operation: &str) -> bool {
        self.entries.contains_key(operation)
    }

    /// Operation names in sorted order
    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// All entries
    pub fn iter(&self) -> impl Iterator<Item = &Arc<RateLimitConfig>> {
        self.entries.values()
    }

    /// Number of configured operations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Materialize [`DEFAULT_OPERATIONS`]
pub fn default_operations() -> Vec<RateLimitConfig> {
    DEFAULT_OPERATIONS
        .iter()
        .map(|&(operation, rate, burst, min_delay_ms, max_batch)| {
            RateLimitConfig::new(operation, rate, burst)
                .min_delay_ms(min_delay_ms)
                .max_batch_size(max_batch)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = OperationRegistry::builtin();
        assert_eq!(registry.len(), DEFAULT_OPERATIONS.len());

        let fees = registry.get("fees.estimate").unwrap();
        assert_eq!(fees.burst_capacity, 2);
        assert_eq!(fees.min_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_builtin_entries_are_valid() {
        for config in default_operations() {
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_unknown_operation() {
        let registry = OperationRegistry::builtin();
        let err = registry.get("orders.list").unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownOperation(op) if op == "orders.list"));
    }

    #[test]
    fn test_rejects_invalid_entries() {
        assert!(OperationRegistry::new(vec![RateLimitConfig::new("a", 0.0, 1)]).is_err());
        assert!(OperationRegistry::new(vec![RateLimitConfig::new("a", -1.0, 1)]).is_err());
        assert!(OperationRegistry::new(vec![RateLimitConfig::new("a", 1.0, 0)]).is_err());
        assert!(OperationRegistry::new(vec![
            RateLimitConfig::new("a", 1.0, 1).max_batch_size(0)
        ])
        .is_err());
        assert!(OperationRegistry::new(vec![]).is_err());
    }

    #[test]
    fn test_rejects_duplicates() {
        let result = OperationRegistry::new(vec![
            RateLimitConfig::new("a", 1.0, 1),
            RateLimitConfig::new("a", 2.0, 2),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_refill_time() {
        let config = RateLimitConfig::new("a", 2.0, 4);
        assert_eq!(config.refill_time(1.0), Duration::from_millis(500));
        assert_eq!(config.refill_time(-3.0), Duration::ZERO);
    }

    #[test]
    fn test_config_serialization() {
        let toml_entry = r#"
            operation = "catalog.search"
            rate_per_second = 2.0
            burst_capacity = 2
        "#;
        let parsed: RateLimitConfig = toml::from_str(toml_entry).unwrap();
        assert_eq!(parsed.min_delay_ms, 0);
        assert_eq!(parsed.max_batch_size, 1);
    }
}
