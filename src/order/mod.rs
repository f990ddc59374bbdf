//! Swap orders: immutable terms, identity and coordination state
//!
//! An order's identity is the keccak-256 of its canonically encoded terms.
//! Everything outside `OrderTerms` is coordination state owned by the
//! coordination engine.

mod prepared;

pub use prepared::PreparedOrder;

use crate::chain::ChainFamily;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::partial::PartialFillState;
use crate::secret::Hashlock;

use ethers::types::{Address, RecoveryMessage, Signature};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// Content-derived order identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderHash(pub [u8; 32]);

impl OrderHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for OrderHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for OrderHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderHash({})", self)
    }
}

impl FromStr for OrderHash {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw)
            .map_err(|e| CoordinatorError::InvalidOrder(format!("bad order hash {}: {}", s, e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoordinatorError::InvalidOrder(format!("order hash {} is not 32 bytes", s)))?;
        Ok(OrderHash(arr))
    }
}

impl Serialize for OrderHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OrderHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        OrderHash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A chain family plus the network identifier within that family
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainRef {
    pub family: ChainFamily,
    /// EVM chain id ("11155111") or NEAR network id ("testnet")
    pub chain_id: String,
}

/// Which escrow of the swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainSide {
    Src,
    Dst,
}

impl ChainSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainSide::Src => "src",
            ChainSide::Dst => "dst",
        }
    }
}

impl fmt::Display for ChainSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainSide {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "src" | "source" => Ok(ChainSide::Src),
            "dst" | "destination" => Ok(ChainSide::Dst),
            other => Err(CoordinatorError::InvalidOrder(format!("unknown side {}", other))),
        }
    }
}

/// Order lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPhase {
    Submitted,
    Claimed,
    SrcEscrowDeployed,
    DstEscrowDeployed,
    WaitingForSecret,
    Completed,
    Recovery,
    Cancelled,
}

impl OrderPhase {
    pub const ALL: [OrderPhase; 8] = [
        OrderPhase::Submitted,
        OrderPhase::Claimed,
        OrderPhase::SrcEscrowDeployed,
        OrderPhase::DstEscrowDeployed,
        OrderPhase::WaitingForSecret,
        OrderPhase::Completed,
        OrderPhase::Recovery,
        OrderPhase::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderPhase::Submitted => "submitted",
            OrderPhase::Claimed => "claimed",
            OrderPhase::SrcEscrowDeployed => "src_escrow_deployed",
            OrderPhase::DstEscrowDeployed => "dst_escrow_deployed",
            OrderPhase::WaitingForSecret => "waiting_for_secret",
            OrderPhase::Completed => "completed",
            OrderPhase::Recovery => "recovery",
            OrderPhase::Cancelled => "cancelled",
        }
    }

    /// No mutation of any kind is permitted once terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderPhase::Completed | OrderPhase::Cancelled)
    }

    /// Forward progress (claim, deploy, reveal) is only possible here
    pub fn is_progressing(&self) -> bool {
        !self.is_terminal() && *self != OrderPhase::Recovery
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: OrderPhase) -> bool {
        use OrderPhase::*;
        match (*self, next) {
            (Submitted, Claimed)
            | (Claimed, SrcEscrowDeployed)
            | (SrcEscrowDeployed, DstEscrowDeployed)
            | (DstEscrowDeployed, WaitingForSecret)
            | (WaitingForSecret, Completed)
            | (Recovery, Cancelled) => true,
            (from, Recovery) | (from, Cancelled) => from.is_progressing(),
            _ => false,
        }
    }
}

impl fmt::Display for OrderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderPhase {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderPhase::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| CoordinatorError::Internal(format!("unknown order phase {}", s)))
    }
}

/// Immutable terms signed by the maker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTerms {
    pub salt: u64,
    pub maker: String,
    pub src_chain: ChainRef,
    pub dst_chain: ChainRef,
    pub src_token: String,
    pub dst_token: String,
    pub src_amount: u128,
    pub dst_amount: u128,
    pub safety_deposit: u128,
    /// SHA-256 of the secret, or Merkle root of secret hashes for partial fills
    pub hashlock: Hashlock,
    /// Unix seconds after which an undeployed order may be cancelled
    pub timeout: i64,
    pub allow_partial_fills: bool,
    /// N, the number of fill parts (zero when partial fills are disabled)
    pub fill_parts: u32,
}

impl OrderTerms {
    /// Basic sanity checks on the terms
    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.src_chain.family == self.dst_chain.family {
            return Err(CoordinatorError::InvalidOrder(
                "source and destination must be different chain families".to_string(),
            ));
        }
        if self.src_amount == 0 || self.dst_amount == 0 {
            return Err(CoordinatorError::InvalidOrder(
                "amounts must be non-zero".to_string(),
            ));
        }
        if self.maker.is_empty() {
            return Err(CoordinatorError::InvalidOrder("maker is empty".to_string()));
        }
        if self.allow_partial_fills && self.fill_parts == 0 {
            return Err(CoordinatorError::InvalidOrder(
                "partial-fill order needs at least one part".to_string(),
            ));
        }
        if !self.allow_partial_fills && self.fill_parts != 0 {
            return Err(CoordinatorError::InvalidOrder(
                "fill parts set on an order without partial fills".to_string(),
            ));
        }
        Ok(())
    }

    /// Canonical length-prefixed encoding used for hashing
    fn encode(&self) -> Vec<u8> {
        fn put(buf: &mut Vec<u8>, field: &[u8]) {
            buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
            buf.extend_from_slice(field);
        }

        let mut buf = Vec::with_capacity(512);
        put(&mut buf, &self.salt.to_be_bytes());
        put(&mut buf, self.maker.as_bytes());
        put(&mut buf, self.src_chain.family.as_str().as_bytes());
        put(&mut buf, self.src_chain.chain_id.as_bytes());
        put(&mut buf, self.dst_chain.family.as_str().as_bytes());
        put(&mut buf, self.dst_chain.chain_id.as_bytes());
        put(&mut buf, self.src_token.as_bytes());
        put(&mut buf, self.dst_token.as_bytes());
        put(&mut buf, &self.src_amount.to_be_bytes());
        put(&mut buf, &self.dst_amount.to_be_bytes());
        put(&mut buf, &self.safety_deposit.to_be_bytes());
        put(&mut buf, self.hashlock.as_bytes());
        put(&mut buf, &self.timeout.to_be_bytes());
        put(&mut buf, &[self.allow_partial_fills as u8]);
        put(&mut buf, &self.fill_parts.to_be_bytes());
        buf
    }

    /// Content-derived order hash
    pub fn order_hash(&self) -> OrderHash {
        let digest = Keccak256::digest(self.encode());
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        OrderHash(out)
    }

    /// Check an EIP-191 signature of the order hash against the maker.
    ///
    /// Only EVM-sourced orders carry a maker signature; a NEAR maker
    /// authorizes the swap by funding the source escrow itself.
    pub fn verify_signature(&self, signature: &str) -> CoordinatorResult<()> {
        if self.src_chain.family != ChainFamily::Evm {
            return Ok(());
        }

        let maker: Address = self
            .maker
            .parse()
            .map_err(|e| CoordinatorError::InvalidOrder(format!("invalid maker address: {}", e)))?;
        let signature = Signature::from_str(signature)
            .map_err(|e| CoordinatorError::InvalidSignature(e.to_string()))?;
        let hash = self.order_hash();
        let signer = signature
            .recover(RecoveryMessage::Data(hash.as_bytes().to_vec()))
            .map_err(|e| CoordinatorError::InvalidSignature(e.to_string()))?;

        if signer != maker {
            return Err(CoordinatorError::InvalidSignature(format!(
                "signed by {:?}, maker is {:?}",
                signer, maker
            )));
        }
        Ok(())
    }
}

/// A deployed escrow as reported by the resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowDeployment {
    pub address: String,
    pub tx_hash: String,
    pub block_number: u64,
    /// Unix seconds; the origin of this side's timelocks
    pub deployed_at: i64,
}

/// The assigned resolver's account on each chain of the order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverAccounts {
    pub src: String,
    pub dst: String,
}

impl ResolverAccounts {
    pub fn on(&self, side: ChainSide) -> &str {
        match side {
            ChainSide::Src => &self.src,
            ChainSide::Dst => &self.dst,
        }
    }
}

/// An order with its coordination state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_hash: OrderHash,
    pub terms: OrderTerms,
    pub signature: Option<String>,
    pub phase: OrderPhase,
    /// Bumped on every stored mutation
    pub version: u64,
    pub resolver: Option<String>,
    /// Taker accounts the escrows must name
    pub resolver_accounts: Option<ResolverAccounts>,
    /// Auction rate quoted to the winning resolver at claim time
    pub claimed_rate: Option<f64>,
    pub src_escrow: Option<EscrowDeployment>,
    pub dst_escrow: Option<EscrowDeployment>,
    pub partial_fill: Option<PartialFillState>,
    pub cancel_reason: Option<String>,
    /// Set when an invariant violation stopped automatic processing
    pub halted: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Order {
    /// Build a freshly submitted order
    pub fn new(terms: OrderTerms, signature: Option<String>, now: i64) -> Self {
        let partial_fill = if terms.allow_partial_fills {
            Some(PartialFillState::new(terms.src_amount, terms.fill_parts))
        } else {
            None
        };

        Self {
            order_hash: terms.order_hash(),
            terms,
            signature,
            phase: OrderPhase::Submitted,
            version: 0,
            resolver: None,
            resolver_accounts: None,
            claimed_rate: None,
            src_escrow: None,
            dst_escrow: None,
            partial_fill,
            cancel_reason: None,
            halted: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn escrow(&self, side: ChainSide) -> Option<&EscrowDeployment> {
        match side {
            ChainSide::Src => self.src_escrow.as_ref(),
            ChainSide::Dst => self.dst_escrow.as_ref(),
        }
    }

    pub fn escrow_mut(&mut self, side: ChainSide) -> &mut Option<EscrowDeployment> {
        match side {
            ChainSide::Src => &mut self.src_escrow,
            ChainSide::Dst => &mut self.dst_escrow,
        }
    }

    pub fn chain(&self, side: ChainSide) -> &ChainRef {
        match side {
            ChainSide::Src => &self.terms.src_chain,
            ChainSide::Dst => &self.terms.dst_chain,
        }
    }

    pub fn token(&self, side: ChainSide) -> &str {
        match side {
            ChainSide::Src => &self.terms.src_token,
            ChainSide::Dst => &self.terms.dst_token,
        }
    }

    pub fn amount(&self, side: ChainSide) -> u128 {
        match side {
            ChainSide::Src => self.terms.src_amount,
            ChainSide::Dst => self.terms.dst_amount,
        }
    }

    pub fn deployed_sides(&self) -> Vec<ChainSide> {
        [ChainSide::Src, ChainSide::Dst]
            .into_iter()
            .filter(|side| self.escrow(*side).is_some())
            .collect()
    }

    pub fn is_assigned(&self, resolver: &str) -> bool {
        self.resolver.as_deref() == Some(resolver)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Move to `next`, refusing illegal transitions and regressions
    pub fn advance(&mut self, next: OrderPhase, now: i64) -> CoordinatorResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(CoordinatorError::InvariantViolation {
                order_hash: self.order_hash.to_string(),
                message: format!("illegal transition {} -> {}", self.phase, next),
            });
        }
        self.phase = next;
        self.updated_at = now;
        Ok(())
    }
}
