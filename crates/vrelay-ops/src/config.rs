//! Orchestrator configuration, loaded from TOML.
//!
//! ```toml
//! event_timeout_ms = 120000
//! poll_interval_ms = 1000
//!
//! [[chains]]
//! chain_id = 100
//! gateway_url = "http://hub:8545"
//! role = "hub"
//!
//! [[chains]]
//! chain_id = 1
//! gateway_url = "http://l1:8545"
//! role = "execution"
//!
//! [retry]
//! max_attempts = 5
//!
//! [relayer]
//! min_fee = 1000
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vrelay_auction::BidPolicy;
use vrelay_chain::{ChainClient, ChainRole, GatewayClient};
use vrelay_sync::SyncConfig;
use vrelay_types::{Amount, ChainId, RelayError, Result};

/// One chain gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEndpoint {
    pub chain_id: ChainId,
    pub gateway_url: String,
    pub role: ChainRole,
    /// HTTP request timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Backoff for transient chain failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): doubling, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}

/// Relayer economics as written in TOML, whose integers are 64-bit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayerPolicyConfig {
    pub min_fee: u64,
    /// Unlimited when unset.
    pub max_gas_on_destination: Option<u64>,
}

impl RelayerPolicyConfig {
    pub fn bid_policy(&self) -> BidPolicy {
        BidPolicy {
            min_fee: self.min_fee.into(),
            max_gas_on_destination: self
                .max_gas_on_destination
                .map_or(Amount::MAX, Amount::from),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub chains: Vec<ChainEndpoint>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Default timeout of event waits.
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,
    /// Block-height and gateway polling interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub relayer: RelayerPolicyConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_event_timeout_ms() -> u64 {
    120_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| RelayError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(RelayError::Config(format!(
                    "chain {} configured twice",
                    chain.chain_id
                )));
            }
            if chain.gateway_url.is_empty() {
                return Err(RelayError::Config(format!(
                    "chain {} has no gateway_url",
                    chain.chain_id
                )));
            }
        }
        let hubs = self
            .chains
            .iter()
            .filter(|c| c.role == ChainRole::Hub)
            .count();
        if hubs > 1 {
            return Err(RelayError::Config(format!(
                "expected at most one hub chain, found {}",
                hubs
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(RelayError::Config("retry.max_attempts must be > 0".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(RelayError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn hub(&self) -> Option<&ChainEndpoint> {
        self.chains.iter().find(|c| c.role == ChainRole::Hub)
    }

    pub fn executions(&self) -> impl Iterator<Item = &ChainEndpoint> {
        self.chains.iter().filter(|c| c.role == ChainRole::Execution)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// One gateway client per configured chain.
    pub fn gateway_clients(&self) -> Vec<Arc<dyn ChainClient>> {
        self.chains
            .iter()
            .map(|c| {
                Arc::new(
                    GatewayClient::new(c.chain_id, &c.gateway_url, c.timeout_ms)
                        .with_poll_interval(self.poll_interval_ms),
                ) as Arc<dyn ChainClient>
            })
            .collect()
    }
}
