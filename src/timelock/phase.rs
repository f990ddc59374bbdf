//! Pure timelock phase calculation

use super::TimelockConfig;
use crate::order::ChainSide;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Window of a side's timeline that contains a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelockPhase {
    /// No deployment timestamp recorded yet; not the same as finality lock
    NotDeployed,
    FinalityLock,
    ResolverWithdrawal,
    PublicWithdrawal,
    ResolverCancellation,
    /// Source side only
    PublicCancellation,
}

impl TimelockPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimelockPhase::NotDeployed => "not_deployed",
            TimelockPhase::FinalityLock => "finality_lock",
            TimelockPhase::ResolverWithdrawal => "resolver_withdrawal",
            TimelockPhase::PublicWithdrawal => "public_withdrawal",
            TimelockPhase::ResolverCancellation => "resolver_cancellation",
            TimelockPhase::PublicCancellation => "public_cancellation",
        }
    }

    pub fn is_withdrawal(&self) -> bool {
        matches!(
            self,
            TimelockPhase::ResolverWithdrawal | TimelockPhase::PublicWithdrawal
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TimelockPhase::ResolverCancellation | TimelockPhase::PublicCancellation
        )
    }
}

impl fmt::Display for TimelockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is asking to act on an escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    AssignedResolver,
    Maker,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Withdraw,
    Cancel,
}

/// Phase of `side` at `now`.
///
/// Windows are half-open: at the exact instant a window ends the next one
/// is active.
pub fn phase_at(
    config: &TimelockConfig,
    side: ChainSide,
    deployed_at: Option<i64>,
    now: i64,
) -> TimelockPhase {
    let deployed_at = match deployed_at {
        Some(t) => t,
        None => return TimelockPhase::NotDeployed,
    };

    let elapsed = now - deployed_at;
    let mut phase = TimelockPhase::FinalityLock;
    for (offset, next) in config.boundaries(side) {
        if elapsed >= offset as i64 {
            phase = next;
        } else {
            break;
        }
    }
    phase
}

/// Seconds until the next window begins, `None` in the final window or
/// before deployment
pub fn time_remaining(
    config: &TimelockConfig,
    side: ChainSide,
    deployed_at: Option<i64>,
    now: i64,
) -> Option<i64> {
    let deployed_at = deployed_at?;
    let elapsed = now - deployed_at;
    config
        .boundaries(side)
        .into_iter()
        .map(|(offset, _)| offset as i64)
        .find(|offset| elapsed < *offset)
        .map(|offset| offset - elapsed)
}

/// Whether `actor` may perform `action` during `phase`.
///
/// Resolver-exclusive windows admit only the assigned resolver; public
/// windows admit anyone so a vanished resolver cannot strand funds.
pub fn may_act(phase: TimelockPhase, action: Action, actor: Actor) -> bool {
    match (action, phase) {
        (Action::Withdraw, TimelockPhase::ResolverWithdrawal) => actor == Actor::AssignedResolver,
        (Action::Withdraw, TimelockPhase::PublicWithdrawal) => true,
        (Action::Cancel, TimelockPhase::ResolverCancellation) => actor == Actor::AssignedResolver,
        (Action::Cancel, TimelockPhase::PublicCancellation) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: i64 = 1_700_000_000;

    fn config() -> TimelockConfig {
        TimelockConfig {
            src_finality_lock: 10,
            src_resolver_withdrawal: 100,
            src_cancellation: 200,
            src_public_cancellation: 300,
            dst_finality_lock: 5,
            dst_resolver_withdrawal: 50,
            dst_cancellation: 150,
        }
    }

    #[test]
    fn test_not_deployed_is_distinct() {
        let phase = phase_at(&config(), ChainSide::Src, None, T);
        assert_eq!(phase, TimelockPhase::NotDeployed);
        assert_ne!(phase, TimelockPhase::FinalityLock);
    }

    #[test]
    fn test_deployment_instant_is_finality_lock() {
        for side in [ChainSide::Src, ChainSide::Dst] {
            assert_eq!(
                phase_at(&config(), side, Some(T), T),
                TimelockPhase::FinalityLock
            );
        }
    }

    #[test]
    fn test_boundaries_belong_to_later_window() {
        let c = config();
        let src = |offset| phase_at(&c, ChainSide::Src, Some(T), T + offset);
        assert_eq!(src(9), TimelockPhase::FinalityLock);
        assert_eq!(src(10), TimelockPhase::ResolverWithdrawal);
        assert_eq!(src(99), TimelockPhase::ResolverWithdrawal);
        assert_eq!(src(100), TimelockPhase::PublicWithdrawal);
        assert_eq!(src(200), TimelockPhase::ResolverCancellation);
        assert_eq!(src(300), TimelockPhase::PublicCancellation);
        assert_eq!(src(10_000), TimelockPhase::PublicCancellation);
    }

    #[test]
    fn test_dst_has_no_public_cancellation() {
        let c = config();
        assert_eq!(
            phase_at(&c, ChainSide::Dst, Some(T), T + 150),
            TimelockPhase::ResolverCancellation
        );
        assert_eq!(
            phase_at(&c, ChainSide::Dst, Some(T), T + 1_000_000),
            TimelockPhase::ResolverCancellation
        );
    }

    #[test]
    fn test_time_before_deployment_is_finality_lock() {
        // Clock skew between chains can put `now` slightly before T
        assert_eq!(
            phase_at(&config(), ChainSide::Src, Some(T), T - 3),
            TimelockPhase::FinalityLock
        );
    }

    #[test]
    fn test_time_remaining() {
        let c = config();
        assert_eq!(time_remaining(&c, ChainSide::Src, Some(T), T), Some(10));
        assert_eq!(time_remaining(&c, ChainSide::Src, Some(T), T + 10), Some(90));
        assert_eq!(time_remaining(&c, ChainSide::Src, Some(T), T + 300), None);
        assert_eq!(time_remaining(&c, ChainSide::Dst, Some(T), T + 149), Some(1));
        assert_eq!(time_remaining(&c, ChainSide::Dst, None, T), None);
    }

    #[test]
    fn test_actor_rules() {
        use TimelockPhase::*;
        assert!(may_act(ResolverWithdrawal, Action::Withdraw, Actor::AssignedResolver));
        assert!(!may_act(ResolverWithdrawal, Action::Withdraw, Actor::Other));
        assert!(may_act(PublicWithdrawal, Action::Withdraw, Actor::Other));
        assert!(!may_act(FinalityLock, Action::Withdraw, Actor::AssignedResolver));
        assert!(!may_act(PublicWithdrawal, Action::Cancel, Actor::AssignedResolver));
        assert!(may_act(ResolverCancellation, Action::Cancel, Actor::AssignedResolver));
        assert!(!may_act(ResolverCancellation, Action::Cancel, Actor::Maker));
        assert!(may_act(PublicCancellation, Action::Cancel, Actor::Maker));
        assert!(!may_act(NotDeployed, Action::Cancel, Actor::AssignedResolver));
    }
}
