//! embedgrid.toml configuration parser.

use std::path::Path;

use serde::{Deserialize, Serialize};

use embedgrid_mesh::MeshConfig;
use embedgrid_orchestrator::OrchestratorConfig;

/// Everything the daemon reads at startup. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedgridConfig {
    pub orchestrator: OrchestratorConfig,
    pub mesh: MeshConfig,
    pub log: LogConfig,
    pub seed: SeedConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives. `RUST_LOG` wins when set.
    pub filter: String,
    /// Emit JSON lines instead of the human format.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,embedgrid=debug".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    /// Synthetic sessions created at startup. 0 disables seeding.
    pub sessions: u64,
    /// Seconds between global metrics reports.
    pub report_interval_secs: u64,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            sessions: 0,
            report_interval_secs: 30,
        }
    }
}

impl EmbedgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EmbedgridConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_empty() {
        let config: EmbedgridConfig = toml::from_str("").unwrap();
        assert_eq!(config, EmbedgridConfig::default());
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[orchestrator]
batch_size = 250
scale_countries = ["FR", "IN"]

[mesh]
rotation_interval_ms = 60000

[seed]
sessions = 5000
"#;
        let config: EmbedgridConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.orchestrator.batch_size, 250);
        assert_eq!(config.orchestrator.scale_countries, vec!["FR", "IN"]);
        assert_eq!(config.orchestrator.metrics_ttl_ms, 2_000);
        assert_eq!(config.mesh.rotation_interval_ms, 60_000);
        assert_eq!(config.mesh.max_failures, 3);
        assert_eq!(config.seed.sessions, 5_000);
        assert_eq!(config.seed.report_interval_secs, 30);
        assert!(!config.log.json);
    }

    #[test]
    fn test_from_file_roundtrip() {
        let mut config = EmbedgridConfig::default();
        config.log.json = true;
        config.seed.sessions = 10;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes()).unwrap();

        let loaded = EmbedgridConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EmbedgridConfig::from_file(&dir.path().join("absent.toml")).is_err());
    }
}
