//! Configuration management for the swap coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::timelock::TimelockConfig;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub timelocks: TimelockConfig,
    pub chains: ChainsConfig,
    #[serde(default)]
    pub auction: AuctionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    /// Wait after the destination escrow is confirmed before moving to
    /// `waiting_for_secret`. Not a finality guarantee.
    pub settle_delay_ms: u64,
    pub verification_poll_interval_ms: u64,
    pub max_verification_attempts: u32,
    pub base_fee_poll_interval_secs: u64,
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub store: StoreBackend,
}

impl CoordinatorConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn verification_poll_interval(&self) -> Duration {
        Duration::from_millis(self.verification_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainsConfig {
    pub evm: Option<EvmChainConfig>,
    pub near: Option<NearChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub confirmation_blocks: u64,
    pub escrow_factory: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NearChainConfig {
    pub network_id: String,
    pub rpc_url: String,
    /// Escrows are sub-accounts of this account
    pub escrow_factory: String,
    pub confirmation_blocks: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuctionConfig {
    /// Share of a base-fee drop passed on to the maker as a rate bonus
    pub gas_savings_share: f64,
    pub default_duration_secs: u64,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            gas_savings_share: 0.5,
            default_duration_secs: 180,
        }
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("FUSION_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        self.timelocks
            .validate()
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        let evm = self
            .chains
            .evm
            .as_ref()
            .context("An [chains.evm] section is required")?;
        if evm.rpc_urls.is_empty() {
            anyhow::bail!("EVM chain {} has no RPC URLs configured", evm.chain_id);
        }
        if evm.escrow_factory.is_empty() {
            anyhow::bail!("EVM chain {} has no escrow factory", evm.chain_id);
        }

        let near = self
            .chains
            .near
            .as_ref()
            .context("A [chains.near] section is required")?;
        if near.rpc_url.is_empty() {
            anyhow::bail!("NEAR network {} has no RPC URL configured", near.network_id);
        }
        if near.escrow_factory.is_empty() {
            anyhow::bail!("NEAR network {} has no escrow factory", near.network_id);
        }

        if !(0.0..=1.0).contains(&self.auction.gas_savings_share) {
            anyhow::bail!("auction.gas_savings_share must be within [0, 1]");
        }

        if self.coordinator.store == StoreBackend::Postgres && self.database.is_none() {
            anyhow::bail!("store = \"postgres\" requires a [database] section");
        }

        if self.coordinator.max_verification_attempts == 0 {
            anyhow::bail!("coordinator.max_verification_attempts must be at least 1");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[coordinator]
instance_id = "coordinator-1"
settle_delay_ms = 2000
verification_poll_interval_ms = 5000
max_verification_attempts = 60
base_fee_poll_interval_secs = 12
health_check_interval_secs = 30

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[chains.evm]
chain_id = 11155111
rpc_urls = ["https://sepolia.example/${FUSION_TEST_RPC_KEY}"]
confirmation_blocks = 12
escrow_factory = "0x0000000000000000000000000000000000000001"

[chains.near]
network_id = "testnet"
rpc_url = "https://rpc.testnet.near.org"
escrow_factory = "escrow-factory.testnet"
confirmation_blocks = 3
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file_with_defaults() {
        env::set_var("FUSION_TEST_RPC_KEY", "abc123");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let contents = std::fs::read_to_string(file.path()).unwrap();
        let settings = Settings::from_toml_str(&contents).unwrap();

        assert_eq!(settings.coordinator.store, StoreBackend::Memory);
        assert_eq!(settings.timelocks, TimelockConfig::default());
        assert_eq!(settings.auction.default_duration_secs, 180);
        assert_eq!(
            settings.chains.evm.unwrap().rpc_urls,
            vec!["https://sepolia.example/abc123".to_string()]
        );
    }

    #[test]
    fn test_invalid_timelocks_rejected() {
        let config = format!(
            "{}\n[timelocks]\nsrc_finality_lock = 60\nsrc_resolver_withdrawal = 600\nsrc_cancellation = 500\nsrc_public_cancellation = 3600\ndst_finality_lock = 60\ndst_resolver_withdrawal = 480\ndst_cancellation = 1500\n",
            SAMPLE
        );
        assert!(Settings::from_toml_str(&config).is_err());
    }

    #[test]
    fn test_postgres_store_needs_database() {
        let config = SAMPLE.replace(
            "health_check_interval_secs = 30",
            "health_check_interval_secs = 30\nstore = \"postgres\"",
        );
        assert!(Settings::from_toml_str(&config).is_err());
    }
}
