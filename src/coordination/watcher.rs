//! Background progress of a single order
//!
//! After the destination escrow is confirmed a watcher settles the order
//! into `waiting_for_secret`, keeps the reveal conditions current and
//! notices when the escrows are withdrawn or cancelled on chain.

use super::engine::CoordinationEngine;
use super::types::{SafetyReport, SideSafety};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::DomainEvent;
use crate::order::{ChainSide, Order, OrderHash, OrderPhase};
use crate::secret::RevealConditions;

use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Poll spacing multiplier once an order has stayed unverified too long
const BACKOFF_FACTOR: u32 = 10;

/// What the watcher does after a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Poll {
    Continue,
    Stop,
}

impl CoordinationEngine {
    pub(super) async fn watch_order(&self, order_hash: OrderHash, settle: bool) {
        if settle {
            sleep(self.config.settle_delay()).await;
        }

        let mut ticker = interval(self.config.verification_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = 0u32;

        loop {
            ticker.tick().await;

            match self.poll_order(&order_hash, &mut attempts).await {
                Ok(Poll::Continue) => {
                    if attempts >= self.config.max_verification_attempts {
                        sleep(self.config.verification_poll_interval() * BACKOFF_FACTOR).await;
                    }
                }
                Ok(Poll::Stop) => break,
                Err(e) if e.is_fatal_for_order() => {
                    if let Err(halt) = self.halt_order(&order_hash, &e.to_string()).await {
                        warn!("Failed to halt order {}: {}", order_hash, halt);
                    }
                    break;
                }
                Err(e) if e.is_retryable() => {
                    debug!("Order {} poll will retry: {}", order_hash, e);
                }
                Err(CoordinatorError::OrderNotFound(_)) => break,
                Err(e) => warn!("Order {} poll failed: {}", order_hash, e),
            }
        }

        debug!("Watcher for order {} exited", order_hash);
    }

    async fn poll_order(&self, order_hash: &OrderHash, attempts: &mut u32) -> CoordinatorResult<Poll> {
        let order = self.load(order_hash).await?;
        if order.phase.is_terminal() || order.is_halted() {
            return Ok(Poll::Stop);
        }

        match order.phase {
            OrderPhase::DstEscrowDeployed => {
                self.settle(&order).await?;
                Ok(Poll::Continue)
            }
            OrderPhase::WaitingForSecret => {
                let report = self.evaluate(&order).await?;
                if report.src.is_withdrawn() && report.dst.is_withdrawn() {
                    self.finish(order_hash, OrderPhase::Completed).await?;
                    return Ok(Poll::Stop);
                }
                if report.safe {
                    *attempts = 0;
                } else {
                    *attempts = attempts.saturating_add(1);
                    if *attempts == self.config.max_verification_attempts {
                        warn!(
                            "Order {} still unverified after {} attempts, polling less often",
                            order_hash, attempts
                        );
                    }
                }
                Ok(Poll::Continue)
            }
            OrderPhase::Recovery => {
                let mut all_cancelled = true;
                for side in order.deployed_sides() {
                    let safety = self.side_safety(&order, side).await;
                    if !safety.is_cancelled() {
                        all_cancelled = false;
                    }
                }
                if all_cancelled {
                    self.finish(order_hash, OrderPhase::Cancelled).await?;
                    return Ok(Poll::Stop);
                }
                Ok(Poll::Continue)
            }
            _ => Ok(Poll::Stop),
        }
    }

    /// Move a freshly deployed order into `waiting_for_secret`
    async fn settle(&self, order: &Order) -> CoordinatorResult<()> {
        let _guard = self.lock_order(&order.order_hash).await;
        let current = self.load(&order.order_hash).await?;
        if current.phase != OrderPhase::DstEscrowDeployed || current.is_halted() {
            return Ok(());
        }

        let mut next = current.clone();
        next.advance(OrderPhase::WaitingForSecret, self.clock.now())?;
        self.commit(&current, next).await?;
        Ok(())
    }

    pub(super) async fn finish(&self, order_hash: &OrderHash, phase: OrderPhase) -> CoordinatorResult<()> {
        let _guard = self.lock_order(order_hash).await;
        let current = self.load(order_hash).await?;
        if current.phase.is_terminal() {
            return Ok(());
        }

        let mut next = current.clone();
        next.advance(phase, self.clock.now())?;
        self.commit(&current, next).await?;

        match phase {
            OrderPhase::Completed => {
                info!("Order {} completed", order_hash);
                self.events.publish(DomainEvent::OrderCompleted {
                    order_hash: *order_hash,
                });
            }
            _ => {
                info!("Order {} recovered, escrows refunded", order_hash);
                self.events.publish(DomainEvent::OrderCancelled {
                    order_hash: *order_hash,
                    reason: current
                        .cancel_reason
                        .unwrap_or_else(|| "escrows cancelled".to_string()),
                });
            }
        }
        Ok(())
    }

    pub(super) async fn side_safety(&self, order: &Order, side: ChainSide) -> SideSafety {
        if order.escrow(side).is_none() {
            return SideSafety::NotDeployed;
        }
        match self.verifier.verify_side(order, side).await {
            Ok(report) if report.verified => SideSafety::Verified { report },
            Ok(report) => SideSafety::Unsafe { report },
            Err(e) => {
                warn!(
                    "Could not verify {} escrow of order {}: {}",
                    side, order.order_hash, e
                );
                SideSafety::Unknown {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Check both escrows, finality and timing, and feed the result to the
    /// secret gate. Conditions only ever turn on in the gate.
    pub(super) async fn evaluate(&self, order: &Order) -> CoordinatorResult<SafetyReport> {
        let src = self.side_safety(order, ChainSide::Src).await;
        let dst = self.side_safety(order, ChainSide::Dst).await;

        let both_deployed = order.src_escrow.is_some() && order.dst_escrow.is_some();
        let finality_reached = both_deployed && self.escrows_final(order).await?;

        let now = self.clock.now();
        let timing_window_open = both_deployed
            && [ChainSide::Src, ChainSide::Dst]
                .into_iter()
                .all(|side| self.side_phase(order, side, now).is_withdrawal());

        let update = RevealConditions {
            escrow_safety_confirmed: src.is_verified() && dst.is_verified(),
            finality_reached,
            resolver_identity_confirmed: src.taker_confirmed() && dst.taker_confirmed(),
            timing_window_open,
        };
        let conditions = if self.gate.contains(&order.order_hash) {
            Some(self.gate.set_conditions(&order.order_hash, update)?)
        } else {
            None
        };

        for (side, safety) in [(ChainSide::Src, &src), (ChainSide::Dst, &dst)] {
            match safety {
                SideSafety::Verified { .. } => self.events.publish(DomainEvent::EscrowVerified {
                    order_hash: order.order_hash,
                    side,
                }),
                SideSafety::Unsafe { report } => {
                    self.events.publish(DomainEvent::VerificationFailed {
                        order_hash: order.order_hash,
                        side,
                        issues: report.issues.clone(),
                    })
                }
                SideSafety::NotDeployed | SideSafety::Unknown { .. } => {}
            }
        }

        let safe = conditions.unwrap_or(update).all_met();
        Ok(SafetyReport {
            order_hash: order.order_hash,
            src,
            dst,
            finality_reached,
            timing_window_open,
            conditions,
            safe,
        })
    }

    /// Both deployment transactions are final. A reorg is returned as an
    /// error; any other failure counts as not final yet.
    async fn escrows_final(&self, order: &Order) -> CoordinatorResult<bool> {
        for side in [ChainSide::Src, ChainSide::Dst] {
            let escrow = match order.escrow(side) {
                Some(escrow) => escrow,
                None => return Ok(false),
            };
            let sender = order
                .resolver_accounts
                .as_ref()
                .map(|accounts| accounts.on(side).to_string())
                .or_else(|| order.resolver.clone())
                .unwrap_or_default();

            let tracker = self.chains.finality(order.chain(side).family)?;
            match tracker.is_finalized(&escrow.tx_hash, &sender).await {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) if e.is_fatal_for_order() => return Err(e),
                Err(e) => {
                    debug!("Finality of {} for order {} unknown: {}", side, order.order_hash, e);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
