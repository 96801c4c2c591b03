//! Engine configuration (loaded by the `cli` crate via the `config` crate, the same
//! layered-sources approach the teacher uses for its own settings).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::chain_view::Network;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub network: NetworkConfig,
    pub db_path: PathBuf,
    /// Block height the engine starts interpreting transactions at; earlier blocks
    /// are skipped entirely rather than decoded and discarded.
    pub genesis_block: u32,
    /// Governance-style feature activations pinned ahead of the ones carried on-chain
    /// (e.g. when replaying a testnet fixture without the real activation tx history).
    #[serde(default)]
    pub activation_overrides: Vec<ActivationOverride>,
    /// Height -> consensus hash hex string, the checkpoint table spec §4.7 step 3
    /// validates post-block state against.
    #[serde(default)]
    pub checkpoints: BTreeMap<u32, String>,
    #[serde(default)]
    pub checkpoint_override: bool,
    /// Block interval at which an in-memory snapshot is taken (spec §4.7 step 4).
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u32,
    /// Block interval at which the consensus hash is logged (spec §4.7 step 5); `0`
    /// disables the periodic log (checkpoint validation still runs every block).
    #[serde(default)]
    pub consensus_hash_interval: u32,
}

fn default_snapshot_interval() -> u32 {
    10_000
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum NetworkConfig {
    MainNet,
    TestNet,
    RegTest,
}

impl From<NetworkConfig> for Network {
    fn from(n: NetworkConfig) -> Self {
        match n {
            NetworkConfig::MainNet => Network::MainNet,
            NetworkConfig::TestNet => Network::TestNet,
            NetworkConfig::RegTest => Network::RegTest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationOverride {
    pub feature_id: u16,
    pub activation_block: u32,
    pub min_client_version: u32,
}

impl EngineConfig {
    /// Loads configuration from (in ascending priority) a base file, an optional
    /// network-specific overlay, and environment variables prefixed `TALLYLINE_`,
    /// mirroring the teacher's own `Settings::new` layering.
    pub fn load(base_path: &str, network_overlay: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder().add_source(config::File::with_name(base_path));
        if let Some(overlay) = network_overlay {
            builder = builder.add_source(config::File::with_name(overlay).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("TALLYLINE").separator("__"));
        let settings = builder.build()?;
        settings.try_deserialize().map_err(anyhow::Error::from)
    }

    pub fn checkpoint_table(&self) -> anyhow::Result<BTreeMap<u32, [u8; 32]>> {
        let mut table = BTreeMap::new();
        for (height, hex_hash) in &self.checkpoints {
            let bytes = hex::decode(hex_hash)?;
            let mut hash = [0u8; 32];
            if bytes.len() != 32 {
                anyhow::bail!("checkpoint at height {height} is not a 32-byte hash");
            }
            hash.copy_from_slice(&bytes);
            table.insert(*height, hash);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_table_rejects_wrong_length() {
        let mut cfg = EngineConfig {
            network: NetworkConfig::RegTest,
            db_path: PathBuf::from("/tmp/tallyline"),
            genesis_block: 0,
            activation_overrides: Vec::new(),
            checkpoints: BTreeMap::new(),
            checkpoint_override: false,
            snapshot_interval: 10_000,
            consensus_hash_interval: 0,
        };
        cfg.checkpoints.insert(100, "deadbeef".into());
        assert!(cfg.checkpoint_table().is_err());
    }
}
