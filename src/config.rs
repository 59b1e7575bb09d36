use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const DEFAULT_FETCH_BATCH_SIZE: u64 = 400;
pub const DEFAULT_MAX_CONCURRENCY: usize = 100;
pub const DEFAULT_RPC_BATCH_SIZE: usize = 100;
pub const DEFAULT_DEBUG_BATCH_SIZE: usize = 15;
pub const DEFAULT_VALIDATOR_SYNC_MINUTES: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vm {
    Evm,
    Pchain,
}

/// Configuration for a single chain. One entry per chain in the YAML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    pub chain_id: u32,
    pub vm: Vm,
    pub rpc_url: String,
    pub name: String,

    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    // RPC batching: standard eth_* calls vs heavier debug/trace calls
    #[serde(default = "default_rpc_batch_size")]
    pub rpc_batch_size: usize,
    #[serde(default = "default_debug_batch_size")]
    pub debug_batch_size: usize,

    // P-chain only
    #[serde(default)]
    pub enable_validator_sync: bool,
    #[serde(default = "default_validator_sync_minutes")]
    pub validator_sync_interval_minutes: u64,
}

fn default_fetch_batch_size() -> u64 {
    DEFAULT_FETCH_BATCH_SIZE
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_rpc_batch_size() -> usize {
    DEFAULT_RPC_BATCH_SIZE
}

fn default_debug_batch_size() -> usize {
    DEFAULT_DEBUG_BATCH_SIZE
}

fn default_validator_sync_minutes() -> u64 {
    DEFAULT_VALIDATOR_SYNC_MINUTES
}

impl ChainConfig {
    pub fn validator_sync_interval(&self) -> Duration {
        Duration::from_secs(self.validator_sync_interval_minutes * 60)
    }
}

/// Loads and validates the chain list from a YAML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Vec<ChainConfig>> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let configs: Vec<ChainConfig> = serde_yaml::from_str(&data).context("failed to parse config")?;

    if configs.is_empty() {
        bail!("no chain configurations found in {}", path.display());
    }

    for (i, cfg) in configs.iter().enumerate() {
        if cfg.chain_id == 0 && cfg.vm != Vm::Pchain {
            bail!("chain at index {i}: chain_id cannot be 0 for non-P-chain VMs");
        }
        if cfg.rpc_url.is_empty() {
            bail!("chain at index {i}: rpc_url is required");
        }
        if cfg.name.is_empty() {
            bail!("chain {}: name is required", cfg.chain_id);
        }
    }

    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entry_with_defaults() {
        let yaml = r#"
- chain_id: 43114
  vm: evm
  rpc_url: "http://localhost:9650/ext/bc/C/rpc"
  name: "avalanche"
"#;
        let configs: Vec<ChainConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(configs.len(), 1);

        let cfg = &configs[0];
        assert_eq!(cfg.chain_id, 43114);
        assert_eq!(cfg.vm, Vm::Evm);
        assert_eq!(cfg.start_block, 0);
        assert_eq!(cfg.fetch_batch_size, DEFAULT_FETCH_BATCH_SIZE);
        assert_eq!(cfg.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(cfg.rpc_batch_size, DEFAULT_RPC_BATCH_SIZE);
        assert_eq!(cfg.debug_batch_size, DEFAULT_DEBUG_BATCH_SIZE);
        assert!(!cfg.enable_validator_sync);
        assert_eq!(cfg.validator_sync_interval(), Duration::from_secs(300));
    }

    #[test]
    fn parses_pchain_entry() {
        let yaml = r#"
- chain_id: 0
  vm: pchain
  rpc_url: "http://localhost:9650"
  name: "p-chain"
  enable_validator_sync: true
  validator_sync_interval_minutes: 10
"#;
        let configs: Vec<ChainConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(configs[0].vm, Vm::Pchain);
        assert!(configs[0].enable_validator_sync);
        assert_eq!(
            configs[0].validator_sync_interval(),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn rejects_chain_id_zero_for_evm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "- chain_id: 0\n  vm: evm\n  rpc_url: \"http://x\"\n  name: \"bad\"\n",
        )
        .unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("chain_id cannot be 0"));
    }

    #[test]
    fn rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "- chain_id: 1\n  vm: evm\n  rpc_url: \"http://x\"\n  name: \"\"\n",
        )
        .unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("name is required"));
    }
}
