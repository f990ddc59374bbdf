//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fusion_coordinator::chain::{ChainAdapter, ChainFamily, ChainRegistry, EscrowSnapshot, TxStatus};
use fusion_coordinator::config::Settings;
use fusion_coordinator::coordination::{CoordinationEngine, DeploymentReport, ManualClock};
use fusion_coordinator::error::CoordinatorResult;
use fusion_coordinator::order::{ChainRef, OrderTerms, ResolverAccounts};
use fusion_coordinator::partial::MerkleTree;
use fusion_coordinator::secret::{Hashlock, Secret};
use fusion_coordinator::store::MemoryStore;

pub const NOW: i64 = 1_700_000_000;
pub const RESOLVER: &str = "resolver-1";
pub const NEAR_FACTORY: &str = "escrow-factory.testnet";
pub const SRC_ESCROW: &str = "escrow-7c1e.escrow-factory.testnet";
pub const DST_ESCROW: &str = "0x00000000000000000000000000000000000000e5";

const SETTINGS: &str = r#"
[coordinator]
instance_id = "e2e"
settle_delay_ms = 10
verification_poll_interval_ms = 10
max_verification_attempts = 10000
base_fee_poll_interval_secs = 12
health_check_interval_secs = 30

[api]
host = "127.0.0.1"
port = 0

[metrics]
enabled = false
port = 0

[chains.evm]
chain_id = 11155111
rpc_urls = ["http://localhost:8545"]
confirmation_blocks = 2
escrow_factory = "0x0000000000000000000000000000000000000001"

[chains.near]
network_id = "testnet"
rpc_url = "http://localhost:3030"
escrow_factory = "escrow-factory.testnet"
confirmation_blocks = 2
"#;

/// In-process chain whose escrows are whatever the test says they are
pub struct StubChain {
    family: ChainFamily,
    chain_id: String,
    block: AtomicU64,
    balances: DashMap<String, u128>,
    escrows: DashMap<String, EscrowSnapshot>,
}

impl StubChain {
    pub fn new(family: ChainFamily, chain_id: &str) -> Self {
        Self {
            family,
            chain_id: chain_id.to_string(),
            block: AtomicU64::new(1_000),
            balances: DashMap::new(),
            escrows: DashMap::new(),
        }
    }

    pub fn put_escrow(&self, address: &str, balance: u128, snapshot: EscrowSnapshot) {
        self.balances.insert(address.to_string(), balance);
        self.escrows.insert(address.to_string(), snapshot);
    }

    pub fn set_withdrawn(&self, address: &str) {
        if let Some(mut escrow) = self.escrows.get_mut(address) {
            escrow.is_withdrawn = true;
        }
    }

    pub fn set_cancelled(&self, address: &str) {
        if let Some(mut escrow) = self.escrows.get_mut(address) {
            escrow.is_cancelled = true;
        }
    }
}

#[async_trait]
impl ChainAdapter for StubChain {
    fn family(&self) -> ChainFamily {
        self.family
    }

    fn chain_id(&self) -> String {
        self.chain_id.clone()
    }

    async fn get_balance(&self, account: &str, _token: &str) -> CoordinatorResult<u128> {
        Ok(self.balances.get(account).map(|b| *b).unwrap_or(0))
    }

    async fn code_exists(&self, address: &str) -> CoordinatorResult<bool> {
        Ok(self.escrows.contains_key(address))
    }

    async fn get_block_number(&self) -> CoordinatorResult<u64> {
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn get_transaction(
        &self,
        _tx_hash: &str,
        _sender: &str,
    ) -> CoordinatorResult<Option<TxStatus>> {
        Ok(Some(TxStatus {
            block_number: 10,
            success: true,
        }))
    }

    async fn get_escrow_state(
        &self,
        address: &str,
        _deploy_tx: &str,
    ) -> CoordinatorResult<Option<EscrowSnapshot>> {
        Ok(self.escrows.get(address).map(|s| s.clone()))
    }

    async fn get_base_fee(&self) -> CoordinatorResult<Option<u128>> {
        Ok(Some(100))
    }
}

pub struct Harness {
    pub engine: Arc<CoordinationEngine>,
    pub clock: Arc<ManualClock>,
    pub near: Arc<StubChain>,
    pub evm: Arc<StubChain>,
    store: Arc<MemoryStore>,
    chains: Arc<ChainRegistry>,
    settings: Settings,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(Settings::from_toml_str(SETTINGS).expect("settings"))
    }

    /// Watchers back off after `attempts` unsafe polls
    pub fn with_max_attempts(attempts: u32) -> Self {
        let mut settings = Settings::from_toml_str(SETTINGS).expect("settings");
        settings.coordinator.max_verification_attempts = attempts;
        Self::with_settings(settings)
    }

    fn with_settings(settings: Settings) -> Self {
        let near = Arc::new(StubChain::new(ChainFamily::Near, "testnet"));
        let evm = Arc::new(StubChain::new(ChainFamily::Evm, "11155111"));

        let chains = ChainRegistry::new();
        chains.register(near.clone(), 2);
        chains.register(evm.clone(), 2);

        let chains = Arc::new(chains);
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let engine = CoordinationEngine::new(store.clone(), chains.clone(), &settings)
            .with_clock(clock.clone());

        Self {
            engine: Arc::new(engine),
            clock,
            near,
            evm,
            store,
            chains,
            settings,
        }
    }

    /// A second coordinator sharing this one's store, chains and clock
    pub fn peer(&self) -> Arc<CoordinationEngine> {
        Arc::new(
            CoordinationEngine::new(self.store.clone(), self.chains.clone(), &self.settings)
                .with_clock(self.clock.clone()),
        )
    }
}

pub fn secret(byte: u8) -> Secret {
    Secret([byte; 32])
}

/// NEAR-sourced terms; these carry no maker signature
pub fn near_to_evm_terms(hashlock: Hashlock) -> OrderTerms {
    OrderTerms {
        salt: 7,
        maker: "maker.testnet".to_string(),
        src_chain: ChainRef {
            family: ChainFamily::Near,
            chain_id: "testnet".to_string(),
        },
        dst_chain: ChainRef {
            family: ChainFamily::Evm,
            chain_id: "11155111".to_string(),
        },
        src_token: "usdc.fakes.testnet".to_string(),
        dst_token: "0x1c7d4b196cb0c7b01d743fbc6116a902379c7238".to_string(),
        src_amount: 1_000_000,
        dst_amount: 995_000,
        safety_deposit: 1_000,
        hashlock,
        timeout: NOW + 3_600,
        allow_partial_fills: false,
        fill_parts: 0,
    }
}

/// Merkle root over the secrets' hashes, in index order
pub fn merkle_hashlock(secrets: &[Secret]) -> Hashlock {
    let leaves: Vec<Hashlock> = secrets.iter().map(|s| s.hashlock()).collect();
    MerkleTree::build(&leaves).root()
}

pub fn accounts() -> ResolverAccounts {
    ResolverAccounts {
        src: "resolver.testnet".to_string(),
        dst: "0xffcf8fdee72ac11b5c542428b35eef5769c409f0".to_string(),
    }
}

pub fn report(address: &str, tx_hash: &str) -> DeploymentReport {
    DeploymentReport {
        address: address.to_string(),
        tx_hash: tx_hash.to_string(),
        block_number: 10,
        deployed_at: None,
    }
}

/// Escrow snapshots matching `terms` as deployed for `accounts()`
pub fn escrow_snapshots(terms: &OrderTerms) -> (EscrowSnapshot, EscrowSnapshot) {
    let order_hash = terms.order_hash();
    let src = EscrowSnapshot {
        order_hash: Some(order_hash),
        hashlock: None,
        maker: Some(terms.maker.clone()),
        taker: Some(accounts().src),
        token: Some(terms.src_token.clone()),
        amount: Some(terms.src_amount),
        safety_deposit: Some(terms.safety_deposit),
        is_withdrawn: false,
        is_cancelled: false,
        deployed_at: None,
    };
    let dst = EscrowSnapshot {
        order_hash: None,
        hashlock: Some(terms.hashlock),
        maker: Some(terms.maker.clone()),
        taker: Some(accounts().dst),
        token: Some(terms.dst_token.clone()),
        amount: Some(terms.dst_amount),
        safety_deposit: Some(terms.safety_deposit),
        is_withdrawn: false,
        is_cancelled: false,
        deployed_at: None,
    };
    (src, dst)
}

/// Poll `check` until it holds or five seconds pass
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
