//! EVM adapter with multi-RPC support and automatic failover
//!
//! Escrow parameters are not readable from the escrow contract itself; they
//! are recovered from the factory event emitted in the deployment
//! transaction, and withdraw/cancel status from the escrow's own events.

use super::{ChainAdapter, ChainFamily, EscrowSnapshot, TxStatus};
use crate::config::EvmChainConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::order::OrderHash;
use crate::secret::Hashlock;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const SRC_ESCROW_CREATED: &str = "SrcEscrowCreated((bytes32,bytes32,uint256,uint256,uint256,uint256,uint256,uint256),(uint256,uint256,uint256,uint256,uint256))";
const DST_ESCROW_CREATED: &str = "DstEscrowCreated(address,bytes32,uint256)";
const ESCROW_WITHDRAWAL: &str = "EscrowWithdrawal(bytes32)";
const ESCROW_CANCELLED: &str = "EscrowCancelled()";

/// `balanceOf(address)`
const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

fn is_native(token: &str) -> bool {
    let token = token.to_lowercase();
    token == "native" || token == "eth" || token == format!("{:?}", Address::zero())
}

fn u256_to_u128(value: U256) -> u128 {
    if value > U256::from(u128::MAX) {
        u128::MAX
    } else {
        value.as_u128()
    }
}

/// 32-byte ABI word `index` of `data`
fn word(data: &[u8], index: usize) -> Option<[u8; 32]> {
    let start = index * 32;
    let slice = data.get(start..start + 32)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(slice);
    Some(out)
}

/// Address packed into the low 20 bytes of a word
fn word_address(word: &[u8; 32]) -> String {
    format!("{:?}", Address::from_slice(&word[12..]))
}

fn word_u128(word: &[u8; 32]) -> u128 {
    u256_to_u128(U256::from_big_endian(word))
}

/// Decode `SrcEscrowCreated` data: immutables (8 words) then the
/// destination complement (5 words)
fn decode_src_created(data: &[u8]) -> Option<EscrowSnapshot> {
    let timelocks = U256::from_big_endian(&word(data, 7)?);
    let deployed_at = (timelocks >> 224).low_u64() as i64;

    Some(EscrowSnapshot {
        order_hash: Some(OrderHash(word(data, 0)?)),
        hashlock: Some(Hashlock(word(data, 1)?)),
        maker: Some(word_address(&word(data, 2)?)),
        taker: Some(word_address(&word(data, 3)?)),
        token: Some(word_address(&word(data, 4)?)),
        amount: Some(word_u128(&word(data, 5)?)),
        safety_deposit: Some(word_u128(&word(data, 6)?)),
        is_withdrawn: false,
        is_cancelled: false,
        deployed_at: Some(deployed_at),
    })
}

/// Decode `DstEscrowCreated` data, returning the escrow address with the
/// partial snapshot
fn decode_dst_created(data: &[u8]) -> Option<(String, EscrowSnapshot)> {
    let escrow = word_address(&word(data, 0)?);
    let snapshot = EscrowSnapshot {
        hashlock: Some(Hashlock(word(data, 1)?)),
        taker: Some(word_address(&word(data, 2)?)),
        ..Default::default()
    };
    Some((escrow, snapshot))
}

/// Multi-provider EVM adapter
pub struct EvmAdapter {
    config: EvmChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    factory: Address,
}

impl EvmAdapter {
    pub async fn new(config: EvmChainConfig) -> CoordinatorResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(CoordinatorError::ChainUnavailable {
                chain: format!("evm:{}", config.chain_id),
                message: "No valid RPC providers".to_string(),
            });
        }

        let factory: Address = config.escrow_factory.parse().map_err(|e| {
            CoordinatorError::Config(format!(
                "invalid escrow factory {}: {}",
                config.escrow_factory, e
            ))
        })?;

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            factory,
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn unavailable(&self, message: impl std::fmt::Display) -> CoordinatorError {
        CoordinatorError::ChainUnavailable {
            chain: format!("evm:{}", self.config.chain_id),
            message: message.to_string(),
        }
    }

    /// Run `op` against each provider in turn until one answers
    async fn with_failover<T, F, Fut>(&self, what: &str, op: F) -> CoordinatorResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        for _ in 0..self.http_providers.len() {
            match op(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        "Failed to {} on chain {}: {}",
                        what, self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.unavailable(format!("all providers failed to {}", what)))
    }

    fn parse_address(&self, address: &str) -> CoordinatorResult<Address> {
        address
            .parse()
            .map_err(|e| CoordinatorError::InvalidOrder(format!("invalid EVM address {}: {}", address, e)))
    }

    fn parse_tx_hash(&self, tx_hash: &str) -> CoordinatorResult<H256> {
        tx_hash
            .parse()
            .map_err(|e| CoordinatorError::InvalidOrder(format!("invalid tx hash {}: {}", tx_hash, e)))
    }

    async fn token_balance(&self, token: Address, owner: Address) -> CoordinatorResult<u128> {
        let mut data = BALANCE_OF_SELECTOR.to_vec();
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(owner.as_bytes());
        let tx: TypedTransaction = TransactionRequest::new().to(token).data(data).into();

        let output = self
            .with_failover("call balanceOf", |p| {
                let tx = tx.clone();
                async move { p.call(&tx, None).await }
            })
            .await?;

        let raw = word(&output, 0).ok_or_else(|| self.unavailable("short balanceOf output"))?;
        Ok(word_u128(&raw))
    }

    /// Whether the escrow emitted withdrawal or cancellation events
    async fn escrow_status(&self, escrow: Address, from_block: u64) -> CoordinatorResult<(bool, bool)> {
        let withdrawal = event_topic(ESCROW_WITHDRAWAL);
        let cancelled = event_topic(ESCROW_CANCELLED);
        let filter = Filter::new()
            .address(escrow)
            .from_block(from_block)
            .topic0(vec![withdrawal, cancelled]);

        let logs = self
            .with_failover("get escrow logs", |p| {
                let filter = filter.clone();
                async move { p.get_logs(&filter).await }
            })
            .await?;

        let is_withdrawn = logs.iter().any(|l| l.topics.first() == Some(&withdrawal));
        let is_cancelled = logs.iter().any(|l| l.topics.first() == Some(&cancelled));
        Ok((is_withdrawn, is_cancelled))
    }

    async fn block_timestamp(&self, block_number: u64) -> CoordinatorResult<Option<i64>> {
        let block = self
            .with_failover("get block", |p| async move { p.get_block(block_number).await })
            .await?;
        Ok(block.map(|b| b.timestamp.low_u64() as i64))
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    fn chain_id(&self) -> String {
        self.config.chain_id.to_string()
    }

    async fn get_balance(&self, account: &str, token: &str) -> CoordinatorResult<u128> {
        let owner = self.parse_address(account)?;
        if is_native(token) {
            let balance = self
                .with_failover("get balance", |p| async move { p.get_balance(owner, None).await })
                .await?;
            return Ok(u256_to_u128(balance));
        }
        let token = self.parse_address(token)?;
        self.token_balance(token, owner).await
    }

    async fn code_exists(&self, address: &str) -> CoordinatorResult<bool> {
        let address = self.parse_address(address)?;
        let code = self
            .with_failover("get code", |p| async move { p.get_code(address, None).await })
            .await?;
        Ok(!code.is_empty())
    }

    async fn get_block_number(&self) -> CoordinatorResult<u64> {
        let block = self
            .with_failover("get block number", |p| async move { p.get_block_number().await })
            .await?;
        Ok(block.as_u64())
    }

    async fn get_transaction(
        &self,
        tx_hash: &str,
        _sender: &str,
    ) -> CoordinatorResult<Option<TxStatus>> {
        let hash = self.parse_tx_hash(tx_hash)?;
        let receipt = self
            .with_failover("get receipt", |p| async move {
                p.get_transaction_receipt(hash).await
            })
            .await?;

        Ok(receipt.and_then(|r| {
            r.block_number.map(|block| TxStatus {
                block_number: block.as_u64(),
                success: r.status == Some(1u64.into()),
            })
        }))
    }

    async fn get_escrow_state(
        &self,
        address: &str,
        deploy_tx: &str,
    ) -> CoordinatorResult<Option<EscrowSnapshot>> {
        let escrow = self.parse_address(address)?;
        let hash = self.parse_tx_hash(deploy_tx)?;
        let receipt = match self
            .with_failover("get receipt", |p| async move {
                p.get_transaction_receipt(hash).await
            })
            .await?
        {
            Some(receipt) => receipt,
            None => return Ok(None),
        };
        let block_number = match receipt.block_number {
            Some(block) => block.as_u64(),
            None => return Ok(None),
        };

        let src_topic = event_topic(SRC_ESCROW_CREATED);
        let dst_topic = event_topic(DST_ESCROW_CREATED);
        let escrow_hex = format!("{:?}", escrow);

        let mut snapshot = None;
        for log in receipt.logs.iter().filter(|l| l.address == self.factory) {
            match log.topics.first() {
                Some(topic) if *topic == src_topic => {
                    snapshot = decode_src_created(&log.data);
                }
                Some(topic) if *topic == dst_topic => {
                    if let Some((created, partial)) = decode_dst_created(&log.data) {
                        if created == escrow_hex {
                            snapshot = Some(partial);
                        }
                    }
                }
                _ => {}
            }
            if snapshot.is_some() {
                break;
            }
        }

        let mut snapshot = match snapshot {
            Some(s) => s,
            None => {
                debug!("No factory event for escrow {} in tx {}", address, deploy_tx);
                return Ok(None);
            }
        };

        if snapshot.deployed_at.is_none() {
            snapshot.deployed_at = self.block_timestamp(block_number).await?;
        }
        let (is_withdrawn, is_cancelled) = self.escrow_status(escrow, block_number).await?;
        snapshot.is_withdrawn = is_withdrawn;
        snapshot.is_cancelled = is_cancelled;

        Ok(Some(snapshot))
    }

    async fn get_base_fee(&self) -> CoordinatorResult<Option<u128>> {
        let block = self
            .with_failover("get latest block", |p| async move {
                p.get_block(BlockNumber::Latest).await
            })
            .await?;
        Ok(block
            .and_then(|b| b.base_fee_per_gas)
            .map(u256_to_u128))
    }
}
