//! Timelock configuration and the per-side phase calculator
//!
//! Each side's timeline starts at its escrow deployment timestamp. The
//! configured values are offsets (seconds) from that timestamp at which the
//! next window begins:
//!
//! ```text
//! src: | finality lock | resolver withdrawal | public withdrawal | resolver cancel | public cancel ...
//!      T         +finality_lock      +resolver_withdrawal   +cancellation   +public_cancellation
//! dst: | finality lock | resolver withdrawal | public withdrawal | resolver cancel ...
//! ```

mod phase;

pub use phase::{may_act, phase_at, time_remaining, Action, Actor, TimelockPhase};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::order::ChainSide;

use serde::{Deserialize, Serialize};

/// The seven timelock offsets shared by both escrows of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelockConfig {
    pub src_finality_lock: u32,
    pub src_resolver_withdrawal: u32,
    pub src_cancellation: u32,
    pub src_public_cancellation: u32,
    pub dst_finality_lock: u32,
    pub dst_resolver_withdrawal: u32,
    pub dst_cancellation: u32,
}

impl Default for TimelockConfig {
    fn default() -> Self {
        Self {
            src_finality_lock: 60,
            src_resolver_withdrawal: 600,
            src_cancellation: 1_800,
            src_public_cancellation: 3_600,
            dst_finality_lock: 60,
            dst_resolver_withdrawal: 480,
            dst_cancellation: 1_500,
        }
    }
}

impl TimelockConfig {
    /// Reject configurations that would let a cancellation overlap the
    /// withdrawal period it is supposed to follow
    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.src_finality_lock == 0 || self.dst_finality_lock == 0 {
            return Err(CoordinatorError::InvalidTimelocks(
                "finality lock must be non-zero".to_string(),
            ));
        }
        if self.src_finality_lock >= self.src_resolver_withdrawal {
            return Err(CoordinatorError::InvalidTimelocks(
                "src finality lock must end before resolver withdrawal ends".to_string(),
            ));
        }
        if self.src_resolver_withdrawal >= self.src_cancellation {
            return Err(CoordinatorError::InvalidTimelocks(
                "src resolver withdrawal must end before cancellation".to_string(),
            ));
        }
        if self.src_cancellation >= self.src_public_cancellation {
            return Err(CoordinatorError::InvalidTimelocks(
                "src cancellation must start before public cancellation".to_string(),
            ));
        }
        if self.dst_finality_lock >= self.dst_resolver_withdrawal {
            return Err(CoordinatorError::InvalidTimelocks(
                "dst finality lock must end before resolver withdrawal ends".to_string(),
            ));
        }
        if self.dst_resolver_withdrawal >= self.dst_cancellation {
            return Err(CoordinatorError::InvalidTimelocks(
                "dst resolver withdrawal must end before cancellation".to_string(),
            ));
        }
        Ok(())
    }

    /// Window boundaries for a side, in timeline order
    pub fn boundaries(&self, side: ChainSide) -> Vec<(u32, TimelockPhase)> {
        match side {
            ChainSide::Src => vec![
                (self.src_finality_lock, TimelockPhase::ResolverWithdrawal),
                (self.src_resolver_withdrawal, TimelockPhase::PublicWithdrawal),
                (self.src_cancellation, TimelockPhase::ResolverCancellation),
                (self.src_public_cancellation, TimelockPhase::PublicCancellation),
            ],
            ChainSide::Dst => vec![
                (self.dst_finality_lock, TimelockPhase::ResolverWithdrawal),
                (self.dst_resolver_withdrawal, TimelockPhase::PublicWithdrawal),
                (self.dst_cancellation, TimelockPhase::ResolverCancellation),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TimelockConfig::default().validate().is_ok());
    }

    #[test]
    fn test_withdrawal_must_end_before_cancellation() {
        let config = TimelockConfig {
            src_resolver_withdrawal: 1_800,
            src_cancellation: 1_800,
            ..TimelockConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoordinatorError::InvalidTimelocks(_))
        ));

        let config = TimelockConfig {
            dst_resolver_withdrawal: 2_000,
            dst_cancellation: 1_500,
            ..TimelockConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_finality_rejected() {
        let config = TimelockConfig {
            dst_finality_lock: 0,
            ..TimelockConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
