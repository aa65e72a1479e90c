//! Automatic garbage collection scheduling.
//!
//! The interval between passes shrinks as version chains grow:
//!
//! ```text
//! f_gc = clamp(f_min * pressure / target, f_min, f_max)
//! ```
//!
//! where `pressure` is the mean chain length, `f_min = 1 / max_interval` and
//! `f_max = 1 / min_interval`.

use std::time::{Duration, Instant};

use crate::config::EngineConfig;

/// Derives the GC interval from observed version-chain pressure.
#[derive(Debug, Clone)]
pub struct GcScheduler {
    min_interval: Duration,
    max_interval: Duration,
    target_chain_length: f64,
    last_tick: Option<Instant>,
}

impl GcScheduler {
    #[must_use]
    pub fn new(min_interval: Duration, max_interval: Duration, target_chain_length: f64) -> Self {
        Self {
            min_interval,
            max_interval: max_interval.max(min_interval),
            target_chain_length: target_chain_length.max(1.0),
            last_tick: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Duration::from_millis(config.gc_min_interval_ms),
            Duration::from_millis(config.gc_max_interval_ms),
            config.gc_target_chain_length,
        )
    }

    /// Interval until the next pass at the given mean chain length.
    #[must_use]
    pub fn compute_interval(&self, pressure: f64) -> Duration {
        let scale = (pressure / self.target_chain_length).max(1.0);
        if !scale.is_finite() {
            return self.min_interval;
        }
        self.max_interval
            .div_f64(scale)
            .clamp(self.min_interval, self.max_interval)
    }

    /// Whether a pass is due at `now`; records the tick if so.
    pub fn should_tick(&mut self, pressure: f64, now: Instant) -> bool {
        let due = self
            .last_tick
            .is_none_or(|last| now.saturating_duration_since(last) >= self.compute_interval(pressure));
        if due {
            self.last_tick = Some(now);
        }
        due
    }
}

/// Mean versions per row; 0 for an empty store.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn chain_pressure(versions: usize, rows: usize) -> f64 {
    if rows == 0 {
        0.0
    } else {
        versions as f64 / rows as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched() -> GcScheduler {
        GcScheduler::new(Duration::from_millis(10), Duration::from_secs(1), 8.0)
    }

    #[test]
    fn interval_at_or_below_target_is_max() {
        let s = sched();
        assert_eq!(s.compute_interval(8.0), Duration::from_secs(1));
        assert_eq!(s.compute_interval(1.0), Duration::from_secs(1));
        assert_eq!(s.compute_interval(0.0), Duration::from_secs(1));
    }

    #[test]
    fn interval_shrinks_with_pressure_and_clamps() {
        let s = sched();
        assert_eq!(s.compute_interval(16.0), Duration::from_millis(500));
        assert_eq!(s.compute_interval(80.0), Duration::from_millis(100));
        assert_eq!(s.compute_interval(10_000.0), Duration::from_millis(10));
        assert_eq!(s.compute_interval(f64::INFINITY), Duration::from_millis(10));
    }

    #[test]
    fn should_tick_respects_interval() {
        let mut s = sched();
        let t0 = Instant::now();
        assert!(s.should_tick(8.0, t0), "first call always ticks");
        assert!(!s.should_tick(8.0, t0 + Duration::from_millis(500)));
        assert!(s.should_tick(80.0, t0 + Duration::from_millis(500)));
        assert!(!s.should_tick(80.0, t0 + Duration::from_millis(550)));
        assert!(s.should_tick(8.0, t0 + Duration::from_millis(1500)));
    }

    #[test]
    fn pressure_is_mean_chain_length() {
        assert!((chain_pressure(30, 10) - 3.0).abs() < f64::EPSILON);
        assert!(chain_pressure(0, 0).abs() < f64::EPSILON);
    }

    #[test]
    fn config_bounds_carry_over() {
        let s = GcScheduler::from_config(&EngineConfig::default());
        assert_eq!(s.compute_interval(1.0), Duration::from_secs(1));
        assert_eq!(s.compute_interval(1e9), Duration::from_millis(10));
    }
}
