//! Engine configuration.

use std::time::Duration;

use concord_error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Tunables for a [`crate::TransactionManager`].
///
/// Deserializes from any serde format; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout applied to every lock wait, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Run cycle detection whenever a lock request has to wait.
    pub deadlock_detection: bool,
    /// Maximum number of transactions one cycle search may visit.
    pub deadlock_max_graph_size: usize,
    /// Interval at which a blocked waiter re-examines the wait-for graph
    /// after lock state changed elsewhere, in milliseconds.
    pub deadlock_recheck_ms: u64,
    /// Run garbage collection opportunistically after commits.
    pub auto_gc: bool,
    /// Shortest interval between automatic GC passes, in milliseconds.
    pub gc_min_interval_ms: u64,
    /// Longest interval between automatic GC passes, in milliseconds.
    pub gc_max_interval_ms: u64,
    /// Mean chain length at which GC runs at its fastest rate.
    pub gc_target_chain_length: f64,
    /// How many finished transaction outcomes are remembered so that late
    /// calls on them report `InvalidState`.
    pub outcome_retention: usize,
    /// Ring buffer capacity of the built-in metrics observer.
    pub event_log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            deadlock_detection: true,
            deadlock_max_graph_size: 1_024,
            deadlock_recheck_ms: 25,
            auto_gc: true,
            gc_min_interval_ms: 10,
            gc_max_interval_ms: 1_000,
            gc_target_chain_length: 8.0,
            outcome_retention: 65_536,
            event_log_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms == 0 {
            return Err(EngineError::invalid_config("lock_timeout_ms must be >= 1"));
        }
        if self.deadlock_max_graph_size < 2 {
            return Err(EngineError::invalid_config(
                "deadlock_max_graph_size must allow at least a two-transaction cycle",
            ));
        }
        if self.deadlock_recheck_ms == 0 {
            return Err(EngineError::invalid_config("deadlock_recheck_ms must be >= 1"));
        }
        if self.gc_min_interval_ms > self.gc_max_interval_ms {
            return Err(EngineError::invalid_config(format!(
                "gc_min_interval_ms ({}) exceeds gc_max_interval_ms ({})",
                self.gc_min_interval_ms, self.gc_max_interval_ms
            )));
        }
        if !(self.gc_target_chain_length.is_finite() && self.gc_target_chain_length >= 1.0) {
            return Err(EngineError::invalid_config(
                "gc_target_chain_length must be a finite value >= 1",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub fn deadlock_recheck(&self) -> Duration {
        Duration::from_millis(self.deadlock_recheck_ms)
    }

    #[must_use]
    pub fn with_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn with_deadlock_detection(mut self, enabled: bool) -> Self {
        self.deadlock_detection = enabled;
        self
    }

    #[must_use]
    pub fn with_auto_gc(mut self, enabled: bool) -> Self {
        self.auto_gc = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.lock_timeout(), Duration::from_secs(5));
        assert!(cfg.deadlock_detection);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let zero_timeout = EngineConfig::default().with_lock_timeout_ms(0);
        assert!(matches!(
            zero_timeout.validate(),
            Err(EngineError::InvalidConfig { .. })
        ));

        let tiny_graph = EngineConfig {
            deadlock_max_graph_size: 1,
            ..EngineConfig::default()
        };
        assert!(tiny_graph.validate().is_err());

        let inverted_gc = EngineConfig {
            gc_min_interval_ms: 50,
            gc_max_interval_ms: 10,
            ..EngineConfig::default()
        };
        let err = inverted_gc.validate().unwrap_err();
        assert!(err.to_string().contains("gc_min_interval_ms (50)"));

        let nan_target = EngineConfig {
            gc_target_chain_length: f64::NAN,
            ..EngineConfig::default()
        };
        assert!(nan_target.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"lock_timeout_ms": 50, "auto_gc": false}"#).unwrap();
        assert_eq!(cfg.lock_timeout_ms, 50);
        assert!(!cfg.auto_gc);
        assert_eq!(cfg.deadlock_max_graph_size, 1_024);
    }
}
