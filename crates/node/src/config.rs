//! `GlintConfig`: the on-disk node configuration, mirroring
//! `calimero-config`'s `ConfigFile` (TOML, `serde`, an `exists`/`load`/`save`
//! triad keyed on a directory).

use camino::Utf8Path;
use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "glint.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AntiEntropyMode {
    Fifo,
    Raae,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepairRateConfig {
    pub capacity: u64,
    pub refill_per_second: u64,
}

impl Default for RepairRateConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            refill_per_second: 16,
        }
    }
}

/// The full configuration surface from spec.md §6, plus `http_port`/
/// `rpc_port` which are accepted and stored but never read (wire transport
/// is out of scope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct GlintConfig {
    pub node_id: String,
    pub http_port: u16,
    pub rpc_port: u16,
    pub wal_dir: String,
    pub snapshot_dir: String,
    pub dedupe_ttl_seconds: u64,
    pub wal_rotate_bytes: u64,
    pub snapshot_every_ops: u64,
    pub vnodes_per_node: usize,
    pub replication_factor: usize,
    pub read_quorum: usize,
    pub write_quorum: usize,
    pub merkle_leaf_count: usize,
    pub gossip_interval_seconds: u64,
    pub repair_rate: RepairRateConfig,
    pub anti_entropy_mode: AntiEntropyMode,
    pub max_value_bytes: usize,
}

impl Default for GlintConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_owned(),
            http_port: 7840,
            rpc_port: 7841,
            wal_dir: "data/wal".to_owned(),
            snapshot_dir: "data/snapshot".to_owned(),
            dedupe_ttl_seconds: 60,
            wal_rotate_bytes: 64 * 1024 * 1024,
            snapshot_every_ops: 10_000,
            vnodes_per_node: 32,
            replication_factor: 3,
            read_quorum: 2,
            write_quorum: 2,
            merkle_leaf_count: 1024,
            gossip_interval_seconds: 5,
            repair_rate: RepairRateConfig::default(),
            anti_entropy_mode: AntiEntropyMode::Raae,
            max_value_bytes: 1024 * 1024,
        }
    }
}

impl GlintConfig {
    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;
        toml::from_str(&content).wrap_err_with(|| format!("failed to parse {path:?}"))
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create config directory {dir:?}"))?;
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = GlintConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: GlintConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let mut config = GlintConfig::default();
        config.node_id = "node-x".to_owned();
        config.save(&path).unwrap();

        assert!(GlintConfig::exists(&path));
        let loaded = GlintConfig::load(&path).unwrap();
        assert_eq!(loaded.node_id, "node-x");
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let partial = "node_id = \"only-this\"\n";
        let config: GlintConfig = toml::from_str(partial).unwrap();
        assert_eq!(config.node_id, "only-this");
        assert_eq!(config.replication_factor, GlintConfig::default().replication_factor);
    }
}
