//! Node configuration.

use serde::{Deserialize, Serialize};

/// Which consensus engine the node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    /// Full IBFT voting.
    #[default]
    Ibft,
    /// Fixed-interval sealing without voting (one-node integration mode).
    Dev,
}

/// Node configuration, loadable from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Consensus engine selection.
    pub consensus: ConsensusMode,
    /// Gossip-origin gas-price floor; zero disables it.
    pub price_limit: u64,
    /// Target block gas limit; inherited from the parent with a bounded
    /// delta otherwise.
    pub block_gas_limit: u64,
    /// Dev-mode block cadence, seconds.
    pub dev_interval: u64,
    /// IBFT target block cadence, seconds; also the round-timeout base.
    pub block_time: u64,
    /// Blocks per validator-rotation epoch.
    pub epoch_size: u64,
    /// Whether this node proposes when elected.
    pub seal: bool,
    /// Pool capacity in slots.
    pub max_slots: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            consensus: ConsensusMode::Ibft,
            price_limit: 0,
            block_gas_limit: 8_000_000,
            dev_interval: 1,
            block_time: 2,
            epoch_size: 100_000,
            seal: true,
            max_slots: 4096,
        }
    }
}

impl NodeConfig {
    /// Parse a configuration from JSON, filling omitted fields with
    /// defaults.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_fields_take_defaults() {
        let config =
            NodeConfig::from_json(r#"{ "consensus": "dev", "dev_interval": 5 }"#).unwrap();
        assert_eq!(config.consensus, ConsensusMode::Dev);
        assert_eq!(config.dev_interval, 5);
        assert_eq!(config.block_gas_limit, 8_000_000);
        assert!(config.seal);
    }

    #[test]
    fn zero_price_limit_means_disabled() {
        let config = NodeConfig::default();
        assert_eq!(config.price_limit, 0);
    }
}
