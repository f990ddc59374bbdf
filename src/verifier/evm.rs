//! EVM escrow verification

use super::{check_escrow, taker_confirmed, EscrowVerifier, ExpectedEscrow, VerificationReport};
use crate::chain::{ChainAdapter, ChainFamily};
use crate::error::CoordinatorResult;
use crate::order::EscrowDeployment;

use async_trait::async_trait;
use std::sync::Arc;

/// Escrow contracts created by the EVM escrow factory.
///
/// The factory event binds the hashlock, so an escrow whose hashlock cannot
/// be read is not accepted.
pub struct EvmEscrowVerifier {
    adapter: Arc<dyn ChainAdapter>,
}

impl EvmEscrowVerifier {
    pub fn new(adapter: Arc<dyn ChainAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl EscrowVerifier for EvmEscrowVerifier {
    async fn verify(
        &self,
        escrow: &EscrowDeployment,
        expected: &ExpectedEscrow,
    ) -> CoordinatorResult<VerificationReport> {
        let mut issues = Vec::new();
        let snapshot = check_escrow(self.adapter.as_ref(), escrow, expected, &mut issues).await?;

        if let Some(snapshot) = &snapshot {
            if snapshot.hashlock.is_none() {
                issues.push("factory event does not report the hashlock".to_string());
            }
        }

        let taker_ok = taker_confirmed(ChainFamily::Evm, snapshot.as_ref(), expected);
        Ok(VerificationReport::from_issues(issues, snapshot.as_ref(), taker_ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{EscrowSnapshot, MockChainAdapter};
    use crate::verifier::tests::{deployment, expected};

    fn evm_mock(balance: u128, snapshot: Option<EscrowSnapshot>) -> MockChainAdapter {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_family().return_const(ChainFamily::Evm);
        adapter.expect_code_exists().returning(|_| Ok(true));
        adapter
            .expect_get_balance()
            .returning(move |_, _| Ok(balance));
        adapter
            .expect_get_escrow_state()
            .returning(move |_, _| Ok(snapshot.clone()));
        adapter
    }

    fn evm_expected() -> ExpectedEscrow {
        let mut expected = expected();
        expected.token = "0x1c7d4b196cb0c7b01d743fbc6116a902379c7238".to_string();
        expected.taker = Some("0xffcf8fdee72ac11b5c542428b35eef5769c409f0".to_string());
        expected
    }

    #[tokio::test]
    async fn test_verified_escrow() {
        let expected = evm_expected();
        let snapshot = EscrowSnapshot {
            order_hash: Some(expected.order_hash),
            hashlock: Some(expected.hashlock),
            taker: Some("0xFFcf8FDEE72ac11b5c542428B35EEF5769C409f0".to_string()),
            amount: Some(expected.amount),
            ..Default::default()
        };
        let verifier = EvmEscrowVerifier::new(Arc::new(evm_mock(expected.amount, Some(snapshot))));

        let report = verifier
            .verify(&deployment("0x22d491bde2303f2f43325b2108d26f1eaba1e32b"), &expected)
            .await
            .unwrap();
        assert!(report.verified, "{:?}", report.issues);
        assert!(report.taker_confirmed);
    }

    #[tokio::test]
    async fn test_missing_hashlock_rejected() {
        let expected = evm_expected();
        let snapshot = EscrowSnapshot {
            taker: expected.taker.clone(),
            ..Default::default()
        };
        let verifier = EvmEscrowVerifier::new(Arc::new(evm_mock(expected.amount, Some(snapshot))));

        let report = verifier
            .verify(&deployment("0x22d491bde2303f2f43325b2108d26f1eaba1e32b"), &expected)
            .await
            .unwrap();
        assert!(!report.verified);
        assert_eq!(report.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_adapter_failure_is_an_error_not_a_report() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_family().return_const(ChainFamily::Evm);
        adapter.expect_code_exists().returning(|_| {
            Err(crate::error::CoordinatorError::ChainUnavailable {
                chain: "evm:11155111".to_string(),
                message: "timeout".to_string(),
            })
        });
        let verifier = EvmEscrowVerifier::new(Arc::new(adapter));

        let result = verifier
            .verify(&deployment("0x22d491bde2303f2f43325b2108d26f1eaba1e32b"), &evm_expected())
            .await;
        assert!(matches!(result, Err(e) if e.is_retryable()));
    }
}
