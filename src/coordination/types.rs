//! Requests and answers of the coordination engine

use crate::auction::CurvePoint;
use crate::order::{EscrowDeployment, Order, OrderHash, OrderTerms};
use crate::partial::MerkleProof;
use crate::secret::{RevealConditions, Secret};
use crate::timelock::TimelockPhase;
use crate::verifier::VerificationReport;

use serde::{Deserialize, Serialize};

/// Auction parameters supplied with an order; unset fields use defaults
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuctionParams {
    pub points: Option<Vec<CurvePoint>>,
    pub duration_secs: Option<u64>,
    /// Base fee the maker priced against; polled from the EVM chain if unset
    pub original_base_fee: Option<u128>,
}

/// A signed order together with its secrets
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitOrder {
    pub terms: OrderTerms,
    pub signature: Option<String>,
    /// One secret, or N+1 for a partial-fill order (index order)
    pub secrets: Vec<Secret>,
    #[serde(default)]
    pub auction: AuctionParams,
}

/// A resolver's report of an escrow it deployed
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentReport {
    pub address: String,
    pub tx_hash: String,
    pub block_number: u64,
    /// Used only when the chain does not report the timelock origin
    #[serde(default)]
    pub deployed_at: Option<i64>,
}

/// Verification state of one side. `Unknown` means the chain could not be
/// read, which is never the same as unsafe.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SideSafety {
    NotDeployed,
    Verified { report: VerificationReport },
    Unsafe { report: VerificationReport },
    Unknown { error: String },
}

impl SideSafety {
    pub fn is_verified(&self) -> bool {
        matches!(self, SideSafety::Verified { .. })
    }

    pub fn report(&self) -> Option<&VerificationReport> {
        match self {
            SideSafety::Verified { report } | SideSafety::Unsafe { report } => Some(report),
            SideSafety::NotDeployed | SideSafety::Unknown { .. } => None,
        }
    }

    pub fn taker_confirmed(&self) -> bool {
        self.report().map(|r| r.taker_confirmed).unwrap_or(false)
    }

    pub fn is_withdrawn(&self) -> bool {
        self.report().map(|r| r.is_withdrawn).unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.report().map(|r| r.is_cancelled).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyReport {
    pub order_hash: OrderHash,
    pub src: SideSafety,
    pub dst: SideSafety,
    pub finality_reached: bool,
    pub timing_window_open: bool,
    /// Merged gate conditions, absent if this instance holds no secrets
    pub conditions: Option<RevealConditions>,
    /// All reveal conditions hold
    pub safe: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RevealResponse {
    Released {
        index: u32,
        secret: Secret,
        /// Present for partial-fill secrets
        proof: Option<MerkleProof>,
    },
    NotReady {
        missing: Vec<&'static str>,
    },
    AlreadyRevealed {
        index: u32,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SideStatus {
    pub phase: TimelockPhase,
    pub time_remaining: Option<i64>,
    pub escrow: Option<EscrowDeployment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderStatus {
    pub order: Order,
    pub src: SideStatus,
    pub dst: SideStatus,
    pub conditions: Option<RevealConditions>,
    pub revealed_indices: Vec<u32>,
    pub available_indices: Option<Vec<u32>>,
    /// Live auction rate while the order is unclaimed
    pub current_rate: Option<f64>,
}
