//! Process-wide engine configuration.
//!
//! Grounded on the teacher's `app::config::AppConfig`: a small, cloneable
//! struct of defaults handed to the engine at startup, with per-raster
//! overrides living on the `RasterDescriptor` itself (spec §3, §6) rather
//! than here.

use std::time::Duration;

/// Default number of output arrays allowed in flight per query when a
/// query doesn't specify its own `max_queue_size` (spec §6).
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 5;

/// Default scheduler idle-sleep duration (spec §4.1 step 5).
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(50);

/// Process-wide defaults for the scheduler.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Fallback `max_queue_size` for queries that don't set one.
    pub default_max_queue_size: usize,

    /// How long the scheduler sleeps when a dispatch round made no
    /// progress (spec §4.1 step 5).
    pub idle_sleep: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            idle_sleep: DEFAULT_IDLE_SLEEP,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_max_queue_size(mut self, n: usize) -> Self {
        self.default_max_queue_size = n;
        self
    }

    pub fn with_idle_sleep(mut self, d: Duration) -> Self {
        self.idle_sleep = d;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bounds() {
        let cfg = EngineConfig::default();
        assert!(cfg.default_max_queue_size > 0);
        assert!(cfg.idle_sleep > Duration::from_millis(0));
    }

    #[test]
    fn builder_overrides_apply() {
        let cfg = EngineConfig::new()
            .with_default_max_queue_size(9)
            .with_idle_sleep(Duration::from_millis(5));
        assert_eq!(cfg.default_max_queue_size, 9);
        assert_eq!(cfg.idle_sleep, Duration::from_millis(5));
    }
}
