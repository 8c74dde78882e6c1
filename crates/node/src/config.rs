//! Node configuration, loadable from `config.toml`.

use std::path::Path;

use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};
use weft_actuation::ActuationConfig;
use weft_primitives::sync::PROTOCOL_VERSION;
use weft_sync::SyncConfig;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Must match the peer exactly or sessions refuse to open.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub actuation: ActuationConfig,
}

fn default_node_name() -> String {
    "weft-node".to_owned()
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_owned()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            protocol_version: default_protocol_version(),
            sync: SyncConfig::default(),
            actuation: ActuationConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> EyreResult<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading config from {}", path.display()))?;
        toml::from_str(&raw).wrap_err("parsing config")
    }

    pub fn save(&self, path: &Path) -> EyreResult<()> {
        let raw = toml::to_string_pretty(self).wrap_err("serializing config")?;
        std::fs::write(path, raw)
            .wrap_err_with(|| format!("writing config to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.sync.max_packet_bytes, 220);
        assert_eq!(config.actuation.rate_limit_max, 3);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = NodeConfig::default();
        let raw = toml::to_string_pretty(&config).unwrap();
        let back: NodeConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("weft-config-{}.toml", std::process::id()));
        let config = NodeConfig::default();
        config.save(&path).unwrap();
        let back = NodeConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let raw = r#"
            node_name = "bench-node"

            [sync]
            max_packet_bytes = 64
        "#;
        let config: NodeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.node_name, "bench-node");
        assert_eq!(config.sync.max_packet_bytes, 64);
        assert_eq!(config.actuation.intent_ttl_default_ms, 30_000);
    }
}
