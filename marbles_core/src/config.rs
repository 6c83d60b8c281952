//! Engine configuration.

use marbles_env::{VirtualTime, DEFAULT_HORIZON};
use serde::{Deserialize, Serialize};

/// Default number of events kept per history.
pub const DEFAULT_EVENT_CAP: usize = 100;

/// Bounds applied to every evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Events recorded per history before the source is unsubscribed
    pub event_cap: usize,

    /// Last virtual frame at which scheduled actions still run
    pub horizon: VirtualTime,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_cap: DEFAULT_EVENT_CAP,
            horizon: DEFAULT_HORIZON,
        }
    }
}

impl EngineConfig {
    /// Sets the per-history event cap.
    pub fn with_event_cap(mut self, event_cap: usize) -> Self {
        self.event_cap = event_cap;
        self
    }

    /// Sets the clock horizon.
    pub fn with_horizon(mut self, horizon: VirtualTime) -> Self {
        self.horizon = horizon;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.event_cap, 100);
        assert_eq!(config.horizon, 1_000_000_000);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"event_cap": 5}"#).unwrap();
        assert_eq!(config, EngineConfig::default().with_event_cap(5));
    }
}
