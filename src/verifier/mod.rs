//! Escrow safety verification
//!
//! The coordinator checks every escrow itself before the secret gate may
//! open; a resolver's report of its own deployment is never trusted.
//! Verification is all-or-nothing: one issue makes the escrow unsafe. An
//! adapter failure is returned as an error, which callers treat as
//! "unknown" rather than "unsafe".

mod evm;
mod near;

pub use evm::EvmEscrowVerifier;
pub use near::NearEscrowVerifier;

use crate::chain::{ChainAdapter, ChainFamily, ChainRegistry, EscrowSnapshot};
use crate::error::CoordinatorResult;
use crate::order::{ChainSide, EscrowDeployment, Order, OrderHash};
use crate::secret::Hashlock;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a correct escrow for one side of an order must look like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedEscrow {
    pub order_hash: OrderHash,
    pub hashlock: Hashlock,
    pub token: String,
    pub amount: u128,
    /// Taker account the escrow must name, once a resolver is assigned
    pub taker: Option<String>,
}

impl ExpectedEscrow {
    pub fn for_side(order: &Order, side: ChainSide) -> Self {
        Self {
            order_hash: order.order_hash,
            hashlock: order.terms.hashlock,
            token: order.token(side).to_string(),
            amount: order.amount(side),
            taker: order
                .resolver_accounts
                .as_ref()
                .map(|accounts| accounts.on(side).to_string()),
        }
    }
}

/// Outcome of verifying one escrow
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationReport {
    pub verified: bool,
    pub issues: Vec<String>,
    /// The escrow names the expected taker
    pub taker_confirmed: bool,
    pub is_withdrawn: bool,
    pub is_cancelled: bool,
}

impl VerificationReport {
    fn from_issues(issues: Vec<String>, snapshot: Option<&EscrowSnapshot>, taker_confirmed: bool) -> Self {
        Self {
            verified: issues.is_empty(),
            issues,
            taker_confirmed,
            is_withdrawn: snapshot.map(|s| s.is_withdrawn).unwrap_or(false),
            is_cancelled: snapshot.map(|s| s.is_cancelled).unwrap_or(false),
        }
    }
}

/// One verification strategy per chain family
#[async_trait]
pub trait EscrowVerifier: Send + Sync {
    async fn verify(
        &self,
        escrow: &EscrowDeployment,
        expected: &ExpectedEscrow,
    ) -> CoordinatorResult<VerificationReport>;
}

fn same_account(family: ChainFamily, a: &str, b: &str) -> bool {
    match family {
        ChainFamily::Evm => a.eq_ignore_ascii_case(b),
        ChainFamily::Near => a == b,
    }
}

/// Checks both families share: existence, funding, not spent, parameters.
///
/// Returns the snapshot (if readable) so strategies can add their own
/// checks, with issues appended to `issues`.
pub(crate) async fn check_escrow(
    adapter: &dyn ChainAdapter,
    escrow: &EscrowDeployment,
    expected: &ExpectedEscrow,
    issues: &mut Vec<String>,
) -> CoordinatorResult<Option<EscrowSnapshot>> {
    let family = adapter.family();

    if !adapter.code_exists(&escrow.address).await? {
        issues.push(format!("escrow {} not found", escrow.address));
        return Ok(None);
    }

    let balance = adapter.get_balance(&escrow.address, &expected.token).await?;
    if balance < expected.amount {
        issues.push(format!(
            "escrow underfunded: holds {} of {}, expected at least {}",
            balance, expected.token, expected.amount
        ));
    }

    let snapshot = match adapter
        .get_escrow_state(&escrow.address, &escrow.tx_hash)
        .await?
    {
        Some(snapshot) => snapshot,
        None => {
            issues.push(format!("escrow {} state unreadable", escrow.address));
            return Ok(None);
        }
    };

    if snapshot.is_withdrawn {
        issues.push("escrow already withdrawn".to_string());
    }
    if snapshot.is_cancelled {
        issues.push("escrow already cancelled".to_string());
    }

    if let Some(order_hash) = snapshot.order_hash {
        if order_hash != expected.order_hash {
            issues.push(format!(
                "escrow bound to order {}, expected {}",
                order_hash, expected.order_hash
            ));
        }
    }
    if let Some(hashlock) = snapshot.hashlock {
        if hashlock != expected.hashlock {
            issues.push(format!(
                "escrow hashlock {} does not match {}",
                hashlock, expected.hashlock
            ));
        }
    }
    if let Some(token) = &snapshot.token {
        if !same_account(family, token, &expected.token) {
            issues.push(format!("escrow token {} is not {}", token, expected.token));
        }
    }
    if let Some(amount) = snapshot.amount {
        if amount < expected.amount {
            issues.push(format!(
                "escrow amount {} below expected {}",
                amount, expected.amount
            ));
        }
    }
    if let (Some(taker), Some(expected_taker)) = (&snapshot.taker, &expected.taker) {
        if !same_account(family, taker, expected_taker) {
            issues.push(format!(
                "escrow taker {} is not the assigned resolver {}",
                taker, expected_taker
            ));
        }
    }

    Ok(Some(snapshot))
}

fn taker_confirmed(family: ChainFamily, snapshot: Option<&EscrowSnapshot>, expected: &ExpectedEscrow) -> bool {
    match (snapshot.and_then(|s| s.taker.as_deref()), expected.taker.as_deref()) {
        (Some(taker), Some(expected)) => same_account(family, taker, expected),
        _ => false,
    }
}

/// Dispatches verification to the strategy for an order side's chain
pub struct SafetyVerifier {
    chains: Arc<ChainRegistry>,
    near_factory: String,
}

impl SafetyVerifier {
    pub fn new(chains: Arc<ChainRegistry>, near_factory: impl Into<String>) -> Self {
        Self {
            chains,
            near_factory: near_factory.into(),
        }
    }

    /// Verify the deployed escrow on `side` of `order`
    pub async fn verify_side(
        &self,
        order: &Order,
        side: ChainSide,
    ) -> CoordinatorResult<VerificationReport> {
        let escrow = match order.escrow(side) {
            Some(escrow) => escrow,
            None => {
                return Ok(VerificationReport::from_issues(
                    vec![format!("{} escrow not deployed", side)],
                    None,
                    false,
                ))
            }
        };

        let chain = order.chain(side);
        let adapter = self.chains.adapter(chain)?;
        let expected = ExpectedEscrow::for_side(order, side);

        let report = match chain.family {
            ChainFamily::Evm => EvmEscrowVerifier::new(adapter).verify(escrow, &expected).await?,
            ChainFamily::Near => {
                NearEscrowVerifier::new(adapter, self.near_factory.clone())
                    .verify(escrow, &expected)
                    .await?
            }
        };

        if report.verified {
            debug!("{} escrow of order {} verified", side, order.order_hash);
        } else {
            warn!(
                "{} escrow of order {} failed verification: {:?}",
                side, order.order_hash, report.issues
            );
            crate::metrics::record_verification_failure(chain.family);
        }
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::MockChainAdapter;
    use crate::order::tests::sample_terms;

    pub fn expected() -> ExpectedEscrow {
        let terms = sample_terms();
        ExpectedEscrow {
            order_hash: terms.order_hash(),
            hashlock: terms.hashlock,
            token: terms.dst_token.clone(),
            amount: terms.dst_amount,
            taker: Some("resolver.testnet".to_string()),
        }
    }

    pub fn deployment(address: &str) -> EscrowDeployment {
        EscrowDeployment {
            address: address.to_string(),
            tx_hash: "4Fq3d5uZm1h8kgbCsQoTcVXWYMcb8Q4n7YVzG8c1k1JZ".to_string(),
            block_number: 100,
            deployed_at: 1_700_000_000,
        }
    }

    pub fn good_snapshot(expected: &ExpectedEscrow) -> EscrowSnapshot {
        EscrowSnapshot {
            order_hash: Some(expected.order_hash),
            hashlock: None,
            maker: Some("maker.testnet".to_string()),
            taker: expected.taker.clone(),
            token: Some(expected.token.clone()),
            amount: Some(expected.amount),
            safety_deposit: Some(1_000),
            is_withdrawn: false,
            is_cancelled: false,
            deployed_at: None,
        }
    }

    /// A NEAR adapter mock reporting `balance` and `snapshot`
    pub fn near_mock(balance: u128, snapshot: Option<EscrowSnapshot>) -> MockChainAdapter {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_family().return_const(ChainFamily::Near);
        adapter.expect_code_exists().returning(|_| Ok(true));
        adapter
            .expect_get_balance()
            .returning(move |_, _| Ok(balance));
        adapter
            .expect_get_escrow_state()
            .returning(move |_, _| Ok(snapshot.clone()));
        adapter
    }

    #[tokio::test]
    async fn test_check_escrow_collects_every_issue() {
        let expected = expected();
        let mut snapshot = good_snapshot(&expected);
        snapshot.is_withdrawn = true;
        snapshot.order_hash = Some(OrderHash([9u8; 32]));
        let adapter = near_mock(10, Some(snapshot));

        let mut issues = Vec::new();
        check_escrow(&adapter, &deployment("escrow-1.factory.testnet"), &expected, &mut issues)
            .await
            .unwrap();

        assert_eq!(issues.len(), 3, "{:?}", issues);
        assert!(issues[0].contains("underfunded"));
        assert!(issues[1].contains("withdrawn"));
        assert!(issues[2].contains("bound to order"));
    }

    #[tokio::test]
    async fn test_missing_escrow_stops_early() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_family().return_const(ChainFamily::Evm);
        adapter.expect_code_exists().returning(|_| Ok(false));

        let mut issues = Vec::new();
        let snapshot = check_escrow(&adapter, &deployment("0xdead"), &expected(), &mut issues)
            .await
            .unwrap();
        assert!(snapshot.is_none());
        assert_eq!(issues, vec!["escrow 0xdead not found".to_string()]);
    }

    #[test]
    fn test_evm_accounts_compare_case_insensitive() {
        assert!(same_account(
            ChainFamily::Evm,
            "0xFFcf8FDEE72ac11b5c542428B35EEF5769C409f0",
            "0xffcf8fdee72ac11b5c542428b35eef5769c409f0"
        ));
        assert!(!same_account(ChainFamily::Near, "Resolver.testnet", "resolver.testnet"));
    }
}
