//! Orchestrator configuration.

use serde::{Deserialize, Serialize};

/// Cache lifetimes, batch sizing, and scale-out defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Stamped onto every blueprint; cached metrics older than this are re-synthesized.
    pub metrics_ttl_ms: u64,
    /// Default lifetime of the cached hypergrid snapshot.
    pub hypergrid_ttl_ms: u64,
    /// Items per batch in bulk embeds when the request does not say.
    pub batch_size: usize,
    /// Proxy countries handed out round-robin by scale-out.
    pub scale_countries: Vec<String>,
    /// Salt for synthetic URLs and content imprints.
    pub content_salt: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            metrics_ttl_ms: 2_000,
            hypergrid_ttl_ms: 2_500,
            batch_size: 100,
            scale_countries: ["US", "GB", "DE", "JP", "SG", "BR"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            content_salt: "embedgrid".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.hypergrid_ttl_ms, 2_500);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.scale_countries.len(), 6);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(r#"{"batch_size": 25}"#).unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.metrics_ttl_ms, 2_000);
        assert_eq!(config.content_salt, "embedgrid");
    }
}
