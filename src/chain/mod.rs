//! Chain module - read-only access to the two ledgers an order spans
//!
//! This module provides:
//! - The `ChainAdapter` contract every chain family implements
//! - An EVM adapter with multi-RPC failover
//! - A NEAR adapter over JSON-RPC view calls
//! - Per-chain finality tracking of escrow deployment transactions

pub mod evm;
pub mod finality;
pub mod near;

pub use evm::EvmAdapter;
pub use finality::FinalityTracker;
pub use near::NearAdapter;

use crate::config::Settings;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::order::{ChainRef, OrderHash};
use crate::secret::Hashlock;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Ledger family; one adapter implementation per family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Evm,
    Near,
}

impl ChainFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainFamily::Evm => "evm",
            ChainFamily::Near => "near",
        }
    }
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusion status of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxStatus {
    pub block_number: u64,
    pub success: bool,
}

/// What the chain says about a deployed escrow.
///
/// Fields a family cannot report are `None`; the verifier decides which of
/// them it requires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscrowSnapshot {
    pub order_hash: Option<OrderHash>,
    pub hashlock: Option<Hashlock>,
    pub maker: Option<String>,
    pub taker: Option<String>,
    pub token: Option<String>,
    pub amount: Option<u128>,
    pub safety_deposit: Option<u128>,
    pub is_withdrawn: bool,
    pub is_cancelled: bool,
    /// Unix seconds
    pub deployed_at: Option<i64>,
}

/// Read-only chain access used by the verifier and the engine.
///
/// Every method distinguishes "the chain answered no" (`Ok(false)`,
/// `Ok(None)`) from "the chain did not answer" (`Err`).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn family(&self) -> ChainFamily;

    /// EVM chain id or NEAR network id
    fn chain_id(&self) -> String;

    /// Balance of `account` in `token` (native asset for "native"/"near"/zero address)
    async fn get_balance(&self, account: &str, token: &str) -> CoordinatorResult<u128>;

    /// Contract code at `address` (EVM) or account existence (NEAR)
    async fn code_exists(&self, address: &str) -> CoordinatorResult<bool>;

    async fn get_block_number(&self) -> CoordinatorResult<u64>;

    /// `sender` is required to look up NEAR transactions; EVM ignores it
    async fn get_transaction(
        &self,
        tx_hash: &str,
        sender: &str,
    ) -> CoordinatorResult<Option<TxStatus>>;

    /// Escrow parameters and withdraw/cancel status
    async fn get_escrow_state(
        &self,
        address: &str,
        deploy_tx: &str,
    ) -> CoordinatorResult<Option<EscrowSnapshot>>;

    /// Latest base fee (EVM) or gas price (NEAR), if the chain reports one
    async fn get_base_fee(&self) -> CoordinatorResult<Option<u128>>;
}

/// Adapters and finality trackers for every configured chain family
pub struct ChainRegistry {
    adapters: DashMap<ChainFamily, Arc<dyn ChainAdapter>>,
    finality_trackers: DashMap<ChainFamily, Arc<FinalityTracker>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self {
            adapters: DashMap::new(),
            finality_trackers: DashMap::new(),
        }
    }

    /// Connect every chain in the settings
    pub async fn from_settings(settings: &Settings) -> CoordinatorResult<Self> {
        let registry = Self::new();

        if let Some(evm) = &settings.chains.evm {
            info!("Initializing EVM chain {}", evm.chain_id);
            let adapter = EvmAdapter::new(evm.clone()).await?;
            registry.register(Arc::new(adapter), evm.confirmation_blocks);
        }

        if let Some(near) = &settings.chains.near {
            info!("Initializing NEAR network {}", near.network_id);
            let adapter = NearAdapter::new(near.clone())?;
            registry.register(Arc::new(adapter), near.confirmation_blocks);
        }

        Ok(registry)
    }

    /// Add (or replace) the adapter for its family
    pub fn register(&self, adapter: Arc<dyn ChainAdapter>, confirmation_blocks: u64) {
        let family = adapter.family();
        let tracker = FinalityTracker::new(family, confirmation_blocks, adapter.clone());
        self.finality_trackers.insert(family, Arc::new(tracker));
        self.adapters.insert(family, adapter);
    }

    /// Adapter serving `chain`; the network id must match the configured one
    pub fn adapter(&self, chain: &ChainRef) -> CoordinatorResult<Arc<dyn ChainAdapter>> {
        let adapter = self
            .adapters
            .get(&chain.family)
            .map(|a| a.clone())
            .ok_or_else(|| CoordinatorError::ChainNotConfigured(chain.family.to_string()))?;

        if adapter.chain_id() != chain.chain_id {
            return Err(CoordinatorError::ChainNotConfigured(format!(
                "{}:{}",
                chain.family, chain.chain_id
            )));
        }
        Ok(adapter)
    }

    pub fn adapter_for_family(&self, family: ChainFamily) -> Option<Arc<dyn ChainAdapter>> {
        self.adapters.get(&family).map(|a| a.clone())
    }

    pub fn finality(&self, family: ChainFamily) -> CoordinatorResult<Arc<FinalityTracker>> {
        self.finality_trackers
            .get(&family)
            .map(|f| f.clone())
            .ok_or_else(|| CoordinatorError::ChainNotConfigured(family.to_string()))
    }

    /// Whether `chain` has a matching adapter
    pub fn supports(&self, chain: &ChainRef) -> bool {
        self.adapter(chain).is_ok()
    }

    /// Health check for all chains, queried concurrently
    pub async fn health_check(&self) -> Vec<(ChainFamily, bool)> {
        let adapters: Vec<_> = self
            .adapters
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let checks = adapters.into_iter().map(|(family, adapter)| async move {
            let healthy = match adapter.get_block_number().await {
                Ok(_) => true,
                Err(e) => {
                    error!("Health check failed for {}: {}", family, e);
                    false
                }
            };
            crate::metrics::record_chain_health(family, healthy);
            (family, healthy)
        });

        futures::future::join_all(checks).await
    }

    pub fn families(&self) -> Vec<ChainFamily> {
        self.adapters.iter().map(|e| *e.key()).collect()
    }
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::new()
    }
}
