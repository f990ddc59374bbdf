//! NEAR escrow verification

use super::{check_escrow, taker_confirmed, EscrowVerifier, ExpectedEscrow, VerificationReport};
use crate::chain::{ChainAdapter, ChainFamily};
use crate::error::CoordinatorResult;
use crate::order::EscrowDeployment;

use async_trait::async_trait;
use std::sync::Arc;

/// Escrow accounts deployed by the NEAR escrow factory.
///
/// NEAR escrows do not expose their hashlock; it is bound by the factory
/// that created them, so the escrow must be a sub-account of the configured
/// factory and report the expected order hash.
pub struct NearEscrowVerifier {
    adapter: Arc<dyn ChainAdapter>,
    factory: String,
}

impl NearEscrowVerifier {
    pub fn new(adapter: Arc<dyn ChainAdapter>, factory: String) -> Self {
        Self { adapter, factory }
    }

    fn is_factory_account(&self, address: &str) -> bool {
        address
            .strip_suffix(&self.factory)
            .and_then(|prefix| prefix.strip_suffix('.'))
            .map(|name| !name.is_empty() && !name.contains('.'))
            .unwrap_or(false)
    }
}

#[async_trait]
impl EscrowVerifier for NearEscrowVerifier {
    async fn verify(
        &self,
        escrow: &EscrowDeployment,
        expected: &ExpectedEscrow,
    ) -> CoordinatorResult<VerificationReport> {
        let mut issues = Vec::new();

        if !self.is_factory_account(&escrow.address) {
            issues.push(format!(
                "escrow {} is not a sub-account of factory {}",
                escrow.address, self.factory
            ));
        }

        let snapshot = check_escrow(self.adapter.as_ref(), escrow, expected, &mut issues).await?;

        if let Some(snapshot) = &snapshot {
            if snapshot.order_hash.is_none() {
                issues.push("escrow does not report a valid order hash".to_string());
            }
        }

        let taker_ok = taker_confirmed(ChainFamily::Near, snapshot.as_ref(), expected);
        Ok(VerificationReport::from_issues(issues, snapshot.as_ref(), taker_ok))
    }
}
