//! Mesh configuration.

use serde::{Deserialize, Serialize};

/// Timing and sizing knobs for the proxy mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Interval between health-check sweeps, and the default for new pools.
    pub health_check_interval_ms: u64,
    /// Age after which a non-sticky binding is rotated. The rotation sweep
    /// ticks at half this interval.
    pub rotation_interval_ms: u64,
    /// Consecutive failed probes before a node is marked `error`.
    pub max_failures: u32,
    /// Buffered mesh events per subscriber.
    pub event_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 30_000,
            rotation_interval_ms: 300_000,
            max_failures: 3,
            event_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: MeshConfig = serde_json::from_str(r#"{"rotation_interval_ms": 1000}"#).unwrap();
        assert_eq!(config.rotation_interval_ms, 1_000);
        assert_eq!(config.health_check_interval_ms, 30_000);
        assert_eq!(config.max_failures, 3);
    }
}
