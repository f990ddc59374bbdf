//! Order lifecycle state machine
//!
//! Every mutation of an order runs under that order's async lock and is
//! committed with a compare-and-swap on (phase, version). Two transitions
//! on the same order can never both succeed, even across coordinator
//! instances sharing a store; different orders never contend.

use super::clock::{Clock, SystemClock};
use super::tasks::OrderTasks;
use super::types::{
    AuctionParams, DeploymentReport, OrderStatus, RevealResponse, SafetyReport, SideStatus,
    SubmitOrder,
};
use crate::auction::{AuctionBook, AuctionCurve};
use crate::chain::{ChainFamily, ChainRegistry};
use crate::config::{AuctionConfig, CoordinatorConfig, Settings};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{DomainEvent, EventBus};
use crate::metrics;
use crate::order::{
    ChainSide, EscrowDeployment, Order, OrderHash, OrderPhase, OrderTerms, PreparedOrder,
    ResolverAccounts,
};
use crate::partial::FillRecord;
use crate::secret::{RevealOutcome, Secret, SecretGate, SecretRecord, SINGLE_SECRET_INDEX};
use crate::store::OrderStore;
use crate::timelock::{may_act, phase_at, time_remaining, Action, Actor, TimelockConfig, TimelockPhase};
use crate::verifier::SafetyVerifier;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cross-chain swap coordination engine
pub struct CoordinationEngine {
    pub(super) store: Arc<dyn OrderStore>,
    pub(super) chains: Arc<ChainRegistry>,
    pub(super) verifier: SafetyVerifier,
    pub(super) gate: SecretGate,
    auctions: AuctionBook,
    pub(super) events: EventBus,
    pub(super) timelocks: TimelockConfig,
    pub(super) config: CoordinatorConfig,
    auction_config: AuctionConfig,
    locks: DashMap<OrderHash, Arc<Mutex<()>>>,
    pub(super) tasks: OrderTasks,
    pub(super) clock: Arc<dyn Clock>,
    shutdown: RwLock<bool>,
}

impl CoordinationEngine {
    pub fn new(store: Arc<dyn OrderStore>, chains: Arc<ChainRegistry>, settings: &Settings) -> Self {
        let near_factory = settings
            .chains
            .near
            .as_ref()
            .map(|near| near.escrow_factory.clone())
            .unwrap_or_default();

        Self {
            store,
            verifier: SafetyVerifier::new(chains.clone(), near_factory),
            chains,
            gate: SecretGate::new(),
            auctions: AuctionBook::new(),
            events: EventBus::default(),
            timelocks: settings.timelocks,
            config: settings.coordinator.clone(),
            auction_config: settings.auction.clone(),
            locks: DashMap::new(),
            tasks: OrderTasks::new(),
            clock: Arc::new(SystemClock),
            shutdown: RwLock::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn timelocks(&self) -> &TimelockConfig {
        &self.timelocks
    }

    /// Number of orders with a running watcher
    pub fn active_watchers(&self) -> usize {
        self.tasks.len()
    }

    // --- order intake ---

    /// Stage terms for the sign-then-submit flow
    pub async fn prepare_order(&self, terms: OrderTerms) -> CoordinatorResult<PreparedOrder> {
        self.check_terms(&terms)?;
        let prepared = PreparedOrder::new(terms, self.clock.now());
        self.store.stage_prepared(&prepared).await?;
        info!(
            "Staged order {} as {} for signing",
            prepared.order_hash, prepared.id
        );
        Ok(prepared)
    }

    /// Submit a staged order once the maker has signed its hash
    pub async fn submit_prepared(
        &self,
        id: &Uuid,
        signature: Option<String>,
        secrets: Vec<Secret>,
        auction: AuctionParams,
    ) -> CoordinatorResult<Order> {
        let prepared = self
            .store
            .take_prepared(id)
            .await?
            .ok_or_else(|| CoordinatorError::PreparedOrderNotFound(id.to_string()))?;

        let request = SubmitOrder {
            terms: prepared.terms.clone(),
            signature,
            secrets,
            auction,
        };
        match self.submit_order(request).await {
            Ok(order) => Ok(order),
            Err(e) => {
                // A bad signature or secret must not cost the maker the staged order
                if let Err(restage) = self.store.stage_prepared(&prepared).await {
                    warn!("Failed to restage prepared order {}: {}", id, restage);
                }
                Err(e)
            }
        }
    }

    /// Accept a signed order and take custody of its secrets
    pub async fn submit_order(&self, request: SubmitOrder) -> CoordinatorResult<Order> {
        let SubmitOrder {
            terms,
            signature,
            secrets,
            auction,
        } = request;

        self.check_terms(&terms)?;
        if terms.src_chain.family == ChainFamily::Evm {
            let signature = signature.as_deref().ok_or_else(|| {
                CoordinatorError::InvalidSignature("maker signature required".to_string())
            })?;
            terms.verify_signature(signature)?;
        }

        let order_hash = terms.order_hash();
        let fill_parts = terms.allow_partial_fills.then_some(terms.fill_parts);
        let record = SecretRecord::new(order_hash, terms.hashlock, secrets, fill_parts)?;

        let now = self.clock.now();
        let curve = self.build_curve(&auction, now).await?;

        let order = Order::new(terms, signature, now);
        self.store.insert_order(&order).await?;
        self.gate.register(record)?;
        self.auctions.insert(order_hash, curve);

        metrics::record_order_submitted(order.terms.src_chain.family);
        self.events.publish(DomainEvent::OrderSubmitted { order_hash });
        info!(
            "Order {} submitted: {} {} -> {} {}",
            order_hash,
            order.terms.src_chain.family,
            order.terms.src_amount,
            order.terms.dst_chain.family,
            order.terms.dst_amount
        );
        Ok(order)
    }

    fn check_terms(&self, terms: &OrderTerms) -> CoordinatorResult<()> {
        terms.validate()?;
        for chain in [&terms.src_chain, &terms.dst_chain] {
            if !self.chains.supports(chain) {
                return Err(CoordinatorError::InvalidOrder(format!(
                    "unsupported chain {}:{}",
                    chain.family, chain.chain_id
                )));
            }
        }
        if terms.timeout <= self.clock.now() {
            return Err(CoordinatorError::InvalidOrder(
                "order timeout already passed".to_string(),
            ));
        }
        Ok(())
    }

    async fn build_curve(&self, params: &AuctionParams, now: i64) -> CoordinatorResult<AuctionCurve> {
        let duration = params
            .duration_secs
            .unwrap_or(self.auction_config.default_duration_secs);
        let base_fee = match params.original_base_fee {
            Some(fee) => fee,
            None => self.current_base_fee().await.unwrap_or(0),
        };
        let share = self.auction_config.gas_savings_share;

        match &params.points {
            Some(points) => AuctionCurve::new(now, duration, points.clone(), base_fee, share),
            None => AuctionCurve::linear(now, duration, base_fee, share),
        }
    }

    async fn current_base_fee(&self) -> Option<u128> {
        let adapter = self.chains.adapter_for_family(ChainFamily::Evm)?;
        match adapter.get_base_fee().await {
            Ok(fee) => fee,
            Err(e) => {
                warn!("Base fee unavailable: {}", e);
                None
            }
        }
    }

    // --- lifecycle transitions ---

    /// Assign the order to `resolver`. At most one claim ever succeeds.
    pub async fn claim(
        &self,
        order_hash: &OrderHash,
        resolver: &str,
        accounts: ResolverAccounts,
    ) -> CoordinatorResult<Order> {
        if resolver.is_empty() || accounts.src.is_empty() || accounts.dst.is_empty() {
            return Err(CoordinatorError::InvalidOrder(
                "resolver and its accounts on both chains are required".to_string(),
            ));
        }

        let _guard = self.lock_order(order_hash).await;
        let order = self.load(order_hash).await?;
        ensure_not_halted(&order)?;

        if order.phase != OrderPhase::Submitted || order.resolver.is_some() {
            return Err(match &order.resolver {
                Some(current) => CoordinatorError::AlreadyClaimed {
                    order_hash: order_hash.to_string(),
                    resolver: current.clone(),
                },
                None => wrong_phase(&order, "submitted"),
            });
        }

        let now = self.clock.now();
        if now >= order.terms.timeout {
            return Err(CoordinatorError::WindowNotOpen(format!(
                "order {} expired at {}",
                order_hash, order.terms.timeout
            )));
        }
        if let Some(curve) = self.auctions.curve(order_hash) {
            if curve.is_expired(now) {
                return Err(CoordinatorError::WindowNotOpen(format!(
                    "auction for order {} has ended",
                    order_hash
                )));
            }
        }
        let rate = self.auctions.rate_at(order_hash, now);

        let mut next = order.clone();
        next.advance(OrderPhase::Claimed, now)?;
        next.resolver = Some(resolver.to_string());
        next.resolver_accounts = Some(accounts);
        next.claimed_rate = rate;
        let next = self.commit(&order, next).await?;

        self.auctions.remove(order_hash);
        self.events.publish(DomainEvent::OrderClaimed {
            order_hash: *order_hash,
            resolver: resolver.to_string(),
            rate,
        });
        Ok(next)
    }

    /// Record an escrow the assigned resolver deployed.
    ///
    /// Replaying the same deployment is a no-op; a different deployment for
    /// a side that already has one is rejected.
    pub async fn confirm_escrow_deployed(
        self: &Arc<Self>,
        order_hash: &OrderHash,
        resolver: &str,
        side: ChainSide,
        report: DeploymentReport,
    ) -> CoordinatorResult<Order> {
        let _guard = self.lock_order(order_hash).await;
        let order = self.load(order_hash).await?;
        ensure_not_halted(&order)?;
        if !order.is_assigned(resolver) {
            return Err(CoordinatorError::NotAssignedResolver {
                order_hash: order_hash.to_string(),
                caller: resolver.to_string(),
            });
        }

        if let Some(existing) = order.escrow(side) {
            if existing.tx_hash == report.tx_hash && existing.address == report.address {
                debug!(
                    "Repeated {} deployment confirmation for order {} ignored",
                    side, order_hash
                );
                return Ok(order);
            }
            return Err(CoordinatorError::ConflictingDeployment {
                order_hash: order_hash.to_string(),
                side,
                message: format!(
                    "already recorded {} in tx {}",
                    existing.address, existing.tx_hash
                ),
            });
        }

        let (required, next_phase) = match side {
            ChainSide::Src => (OrderPhase::Claimed, OrderPhase::SrcEscrowDeployed),
            ChainSide::Dst => (OrderPhase::SrcEscrowDeployed, OrderPhase::DstEscrowDeployed),
        };
        if order.phase != required {
            return Err(wrong_phase(&order, required.as_str()));
        }
        if report.address.is_empty() || report.tx_hash.is_empty() {
            return Err(CoordinatorError::InvalidOrder(
                "deployment needs an escrow address and transaction hash".to_string(),
            ));
        }

        let deployed_at = self.deployment_time(&order, side, &report).await;
        let deployment = EscrowDeployment {
            address: report.address,
            tx_hash: report.tx_hash,
            block_number: report.block_number,
            deployed_at,
        };

        let mut next = order.clone();
        *next.escrow_mut(side) = Some(deployment.clone());
        next.advance(next_phase, self.clock.now())?;
        let next = self.commit(&order, next).await?;

        if let Ok(tracker) = self.chains.finality(order.chain(side).family) {
            tracker
                .track(&deployment.tx_hash, deployment.block_number)
                .await;
        }
        self.events.publish(DomainEvent::EscrowDeployed {
            order_hash: *order_hash,
            side,
            address: deployment.address,
            tx_hash: deployment.tx_hash,
        });

        if side == ChainSide::Dst {
            self.spawn_watcher(*order_hash, true);
        }
        Ok(next)
    }

    /// Timelock origin: the chain's own record if it has one
    async fn deployment_time(&self, order: &Order, side: ChainSide, report: &DeploymentReport) -> i64 {
        if let Ok(adapter) = self.chains.adapter(order.chain(side)) {
            match adapter
                .get_escrow_state(&report.address, &report.tx_hash)
                .await
            {
                Ok(Some(snapshot)) => {
                    if let Some(deployed_at) = snapshot.deployed_at {
                        return deployed_at;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "Could not read deployment time of {} escrow {}: {}",
                    side, report.address, e
                ),
            }
        }
        report.deployed_at.unwrap_or_else(|| self.clock.now())
    }

    /// Cancel an order.
    ///
    /// Without escrows this needs the order timeout to have passed and ends
    /// in `cancelled`. With escrows every deployed side must be in a
    /// cancellation window, the caller must be allowed to cancel on at least
    /// one of them, and the order moves to `recovery` until the escrows
    /// report cancelled.
    pub async fn cancel(
        self: &Arc<Self>,
        order_hash: &OrderHash,
        caller: &str,
        reason: &str,
    ) -> CoordinatorResult<Order> {
        let _guard = self.lock_order(order_hash).await;
        let order = self.load(order_hash).await?;
        ensure_not_halted(&order)?;

        match order.phase {
            OrderPhase::Completed => {
                return Err(CoordinatorError::OrderCompleted(order_hash.to_string()))
            }
            OrderPhase::Cancelled | OrderPhase::Recovery => {
                return Err(wrong_phase(&order, "cancellable"))
            }
            _ => {}
        }

        let now = self.clock.now();
        let mut next = order.clone();
        next.cancel_reason = Some(reason.to_string());

        let deployed = order.deployed_sides();
        if deployed.is_empty() {
            if now < order.terms.timeout {
                return Err(CoordinatorError::WindowNotOpen(format!(
                    "order {} may be cancelled from {}",
                    order_hash, order.terms.timeout
                )));
            }
            next.advance(OrderPhase::Cancelled, now)?;
            let next = self.commit(&order, next).await?;
            self.events.publish(DomainEvent::OrderCancelled {
                order_hash: *order_hash,
                reason: reason.to_string(),
            });
            return Ok(next);
        }

        let actor = actor_for(&order, caller);
        let mut permitted = false;
        let mut refused = None;
        for side in &deployed {
            let phase = self.side_phase(&order, *side, now);
            if !phase.is_cancellation() {
                return Err(CoordinatorError::WindowNotOpen(format!(
                    "{} escrow of order {} is in {}",
                    side, order_hash, phase
                )));
            }
            if may_act(phase, Action::Cancel, actor) {
                permitted = true;
            } else if refused.is_none() {
                refused = Some((*side, phase));
            }
        }
        if !permitted {
            let (side, phase) = refused.unwrap_or((ChainSide::Src, TimelockPhase::NotDeployed));
            return Err(CoordinatorError::UnauthorizedForWindow {
                caller: caller.to_string(),
                side,
                phase: phase.to_string(),
            });
        }

        next.advance(OrderPhase::Recovery, now)?;
        let next = self.commit(&order, next).await?;
        self.events.publish(DomainEvent::OrderRecovery {
            order_hash: *order_hash,
            reason: reason.to_string(),
        });
        self.spawn_watcher(*order_hash, false);
        Ok(next)
    }

    /// Run the safety checks for an order now and merge them into the gate
    pub async fn verify_order(&self, order_hash: &OrderHash) -> CoordinatorResult<SafetyReport> {
        let order = self.load(order_hash).await?;
        self.evaluate(&order).await
    }

    /// Ask for a secret.
    ///
    /// Only the assigned resolver may ask, only in `waiting_for_secret`, and
    /// never once either escrow has entered a cancellation window.
    pub async fn request_reveal(
        &self,
        order_hash: &OrderHash,
        requestor: &str,
        index: Option<u32>,
    ) -> CoordinatorResult<RevealResponse> {
        let _guard = self.lock_order(order_hash).await;
        let order = self.load(order_hash).await?;
        ensure_not_halted(&order)?;

        match order.phase {
            OrderPhase::Completed => {
                return Err(CoordinatorError::OrderCompleted(order_hash.to_string()))
            }
            OrderPhase::Recovery | OrderPhase::Cancelled => {
                return Err(wrong_phase(&order, OrderPhase::WaitingForSecret.as_str()))
            }
            _ => {}
        }
        if !order.is_assigned(requestor) {
            return Err(CoordinatorError::NotAssignedResolver {
                order_hash: order_hash.to_string(),
                caller: requestor.to_string(),
            });
        }

        let index = match (&order.partial_fill, index) {
            (None, None) | (None, Some(SINGLE_SECRET_INDEX)) => SINGLE_SECRET_INDEX,
            (None, Some(other)) => return Err(CoordinatorError::SecretIndexUsed { index: other }),
            (Some(_), Some(index)) => index,
            (Some(_), None) => {
                return Err(CoordinatorError::InvalidFill(
                    "partial-fill reveal needs a secret index".to_string(),
                ))
            }
        };

        if !self.gate.contains(order_hash) {
            return Err(CoordinatorError::Internal(format!(
                "secrets of order {} are not held by this coordinator",
                order_hash
            )));
        }

        if order.phase != OrderPhase::WaitingForSecret {
            let mut missing = self
                .gate
                .conditions(order_hash)
                .map(|c| c.missing())
                .unwrap_or_default();
            missing.push("waiting_for_secret");
            metrics::record_reveal_refused();
            return Ok(RevealResponse::NotReady { missing });
        }

        let now = self.clock.now();
        for side in order.deployed_sides() {
            let phase = self.side_phase(&order, side, now);
            if phase.is_cancellation() {
                return Err(CoordinatorError::WindowNotOpen(format!(
                    "{} escrow of order {} entered {}",
                    side, order_hash, phase
                )));
            }
        }

        match self.gate.request_reveal(order_hash, requestor, index)? {
            RevealOutcome::Released(secret) => {
                metrics::record_secret_revealed();
                self.events.publish(DomainEvent::SecretRevealed {
                    order_hash: *order_hash,
                    index,
                    requestor: requestor.to_string(),
                });
                Ok(RevealResponse::Released {
                    index,
                    secret,
                    proof: self.gate.proof(order_hash, index),
                })
            }
            RevealOutcome::NotReady { missing } => {
                metrics::record_reveal_refused();
                Ok(RevealResponse::NotReady { missing })
            }
            RevealOutcome::AlreadyRevealed => Ok(RevealResponse::AlreadyRevealed { index }),
        }
    }

    /// Record a partial fill by the assigned resolver and unlock its secret
    pub async fn submit_partial_fill(
        &self,
        order_hash: &OrderHash,
        resolver: &str,
        amount: u128,
        secret_index: u32,
    ) -> CoordinatorResult<FillRecord> {
        let _guard = self.lock_order(order_hash).await;
        let order = self.load(order_hash).await?;
        ensure_not_halted(&order)?;

        if !order.terms.allow_partial_fills {
            return Err(CoordinatorError::PartialFillsNotSupported(
                order_hash.to_string(),
            ));
        }
        if order.phase == OrderPhase::Completed {
            return Err(CoordinatorError::OrderCompleted(order_hash.to_string()));
        }
        if !order.phase.is_progressing() || order.phase == OrderPhase::Submitted {
            return Err(wrong_phase(&order, "claimed or later"));
        }
        if !order.is_assigned(resolver) {
            return Err(CoordinatorError::NotAssignedResolver {
                order_hash: order_hash.to_string(),
                caller: resolver.to_string(),
            });
        }

        let mut state = match order.partial_fill.clone() {
            Some(state) => state,
            None => {
                return Err(self
                    .halt_locked(&order, "partial-fill order has no fill state")
                    .await)
            }
        };
        if let Err(message) = state.check_invariants() {
            return Err(self.halt_locked(&order, message).await);
        }
        if !self.gate.contains(order_hash) {
            return Err(CoordinatorError::Internal(format!(
                "secrets of order {} are not held by this coordinator, fill not recorded",
                order_hash
            )));
        }

        let fill = state.record_fill(resolver, amount, secret_index)?;
        if let Err(message) = state.check_invariants() {
            return Err(self.halt_locked(&order, message).await);
        }

        let mut next = order.clone();
        next.partial_fill = Some(state);
        self.commit(&order, next).await?;

        if let Err(e) = self.gate.authorize_index(order_hash, fill.secret_index) {
            error!(
                "Fill of order {} recorded but secret {} cannot be unlocked: {}",
                order_hash, fill.secret_index, e
            );
        }
        metrics::record_partial_fill();
        self.events.publish(DomainEvent::PartialFillRecorded {
            order_hash: *order_hash,
            resolver: resolver.to_string(),
            amount,
            secret_index: fill.secret_index,
        });
        info!(
            "Order {} filled {} with secret {} ({} cumulative)",
            order_hash, amount, fill.secret_index, fill.cumulative
        );
        Ok(fill)
    }

    /// Clear a halt after manual review and restart automatic processing
    pub async fn resume_order(
        self: &Arc<Self>,
        order_hash: &OrderHash,
        operator: &str,
    ) -> CoordinatorResult<Order> {
        let _guard = self.lock_order(order_hash).await;
        let order = self.load(order_hash).await?;

        let reason = match &order.halted {
            Some(reason) => reason.clone(),
            None => return Ok(order),
        };
        if let Some(state) = &order.partial_fill {
            state
                .check_invariants()
                .map_err(|message| CoordinatorError::InvariantViolation {
                    order_hash: order_hash.to_string(),
                    message,
                })?;
        }

        let mut next = order.clone();
        next.halted = None;
        let next = self.commit(&order, next).await?;
        info!(
            "Order {} resumed by {} (was halted: {})",
            order_hash, operator, reason
        );

        match next.phase {
            OrderPhase::DstEscrowDeployed => self.spawn_watcher(*order_hash, true),
            OrderPhase::WaitingForSecret | OrderPhase::Recovery => {
                self.spawn_watcher(*order_hash, false)
            }
            _ => {}
        }
        Ok(next)
    }

    /// Stop automatic processing of an order
    pub async fn halt_order(&self, order_hash: &OrderHash, reason: &str) -> CoordinatorResult<()> {
        let _guard = self.lock_order(order_hash).await;
        let order = self.load(order_hash).await?;
        if order.is_halted() || order.phase.is_terminal() {
            return Ok(());
        }
        self.halt_locked(&order, reason).await;
        Ok(())
    }

    /// Persist a halt; the caller holds the order lock
    async fn halt_locked(&self, order: &Order, reason: impl Into<String>) -> CoordinatorError {
        let reason = reason.into();
        error!("Halting order {}: {}", order.order_hash, reason);

        let mut next = order.clone();
        next.halted = Some(reason.clone());
        if let Err(e) = self.commit(order, next).await {
            error!(
                "Failed to persist halt of order {}: {}",
                order.order_hash, e
            );
        }

        metrics::record_order_halted();
        self.events.publish(DomainEvent::OrderHalted {
            order_hash: order.order_hash,
            reason: reason.clone(),
        });
        CoordinatorError::InvariantViolation {
            order_hash: order.order_hash.to_string(),
            message: reason,
        }
    }

    // --- queries ---

    pub async fn order_status(&self, order_hash: &OrderHash) -> CoordinatorResult<OrderStatus> {
        let order = self.load(order_hash).await?;
        let now = self.clock.now();
        let side_status = |side: ChainSide| {
            let deployed_at = order.escrow(side).map(|e| e.deployed_at);
            SideStatus {
                phase: phase_at(&self.timelocks, side, deployed_at, now),
                time_remaining: time_remaining(&self.timelocks, side, deployed_at, now),
                escrow: order.escrow(side).cloned(),
            }
        };

        Ok(OrderStatus {
            src: side_status(ChainSide::Src),
            dst: side_status(ChainSide::Dst),
            conditions: self.gate.conditions(order_hash),
            revealed_indices: self.gate.revealed_indices(order_hash),
            available_indices: order.partial_fill.as_ref().map(|s| s.available_indices()),
            current_rate: self.auctions.rate_at(order_hash, now),
            order,
        })
    }

    pub async fn orders_in_phase(&self, phase: OrderPhase) -> CoordinatorResult<Vec<Order>> {
        self.store.list_by_phase(phase).await
    }

    // --- internals shared with the watcher ---

    pub(super) async fn lock_order(&self, order_hash: &OrderHash) -> OrderGuard<'_> {
        let lock = self
            .locks
            .entry(*order_hash)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        OrderGuard {
            guard: Some(lock.lock_owned().await),
            locks: &self.locks,
            order_hash: *order_hash,
        }
    }

    pub(super) async fn load(&self, order_hash: &OrderHash) -> CoordinatorResult<Order> {
        self.store
            .get_order(order_hash)
            .await?
            .ok_or_else(|| CoordinatorError::OrderNotFound(order_hash.to_string()))
    }

    pub(super) fn side_phase(&self, order: &Order, side: ChainSide, now: i64) -> TimelockPhase {
        phase_at(
            &self.timelocks,
            side,
            order.escrow(side).map(|e| e.deployed_at),
            now,
        )
    }

    /// Conditionally write `after` over `before`; the caller holds the
    /// order lock
    pub(super) async fn commit(&self, before: &Order, mut after: Order) -> CoordinatorResult<Order> {
        after.version = before.version + 1;
        after.updated_at = self.clock.now();

        if !self
            .store
            .compare_and_swap(before.phase, before.version, &after)
            .await?
        {
            return Err(self.conflict(before).await);
        }

        if before.phase != after.phase {
            info!(
                "Order {} {} -> {}",
                after.order_hash, before.phase, after.phase
            );
            metrics::record_transition(before.phase, after.phase);
            self.events.publish(DomainEvent::PhaseChanged {
                order_hash: after.order_hash,
                from: before.phase,
                to: after.phase,
            });
            if after.phase.is_terminal() {
                self.release(&after).await;
            }
        }
        Ok(after)
    }

    /// Explain a lost compare-and-swap
    async fn conflict(&self, before: &Order) -> CoordinatorError {
        match self.store.get_order(&before.order_hash).await {
            Ok(Some(current)) => match (&current.resolver, before.phase) {
                (Some(resolver), OrderPhase::Submitted) => CoordinatorError::AlreadyClaimed {
                    order_hash: before.order_hash.to_string(),
                    resolver: resolver.clone(),
                },
                _ => wrong_phase(&current, before.phase.as_str()),
            },
            Ok(None) => CoordinatorError::OrderNotFound(before.order_hash.to_string()),
            Err(e) => e,
        }
    }

    /// Drop everything held for a finished order
    async fn release(&self, order: &Order) {
        let order_hash = order.order_hash;
        self.gate.remove(&order_hash);
        self.auctions.remove(&order_hash);
        for side in order.deployed_sides() {
            if let (Some(escrow), Ok(tracker)) = (
                order.escrow(side),
                self.chains.finality(order.chain(side).family),
            ) {
                tracker.forget(&escrow.tx_hash).await;
            }
        }
        if !WATCHED_ORDER
            .try_with(|watched| *watched == order_hash)
            .unwrap_or(false)
        {
            self.tasks.cancel(&order_hash);
        }
        metrics::record_order_finished(order.updated_at - order.created_at);
    }

    pub(super) fn spawn_watcher(self: &Arc<Self>, order_hash: OrderHash, settle: bool) {
        let engine = Arc::clone(self);
        self.tasks.spawn(order_hash, move |id| {
            WATCHED_ORDER.scope(order_hash, async move {
                engine.watch_order(order_hash, settle).await;
                engine.tasks.finished(&order_hash, id);
            })
        });
    }

    // --- background loop ---

    /// Main coordination loop
    pub async fn run(self: Arc<Self>) -> CoordinatorResult<()> {
        self.resume_watchers().await?;

        let mut base_fee_interval = interval(Duration::from_secs(
            self.config.base_fee_poll_interval_secs.max(1),
        ));
        let mut gauge_interval = interval(Duration::from_secs(
            self.config.health_check_interval_secs.max(1),
        ));

        info!("Coordination engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                _ = base_fee_interval.tick() => {
                    self.poll_base_fee().await;
                }

                _ = gauge_interval.tick() => {
                    if let Err(e) = self.refresh_phase_gauges().await {
                        warn!("Failed to refresh order gauges: {}", e);
                    }
                }
            }
        }

        self.tasks.abort_all();
        info!("Coordination engine stopped");
        Ok(())
    }

    /// Restart watchers for orders left mid-flight by a previous run.
    ///
    /// Secrets are never persisted, so these orders can finish or be
    /// recovered but their secrets cannot be revealed by this instance.
    async fn resume_watchers(self: &Arc<Self>) -> CoordinatorResult<()> {
        for phase in [
            OrderPhase::DstEscrowDeployed,
            OrderPhase::WaitingForSecret,
            OrderPhase::Recovery,
        ] {
            for order in self.store.list_by_phase(phase).await? {
                if order.is_halted() {
                    warn!(
                        "Order {} is halted, not resuming: {:?}",
                        order.order_hash, order.halted
                    );
                    continue;
                }
                if phase != OrderPhase::Recovery && !self.gate.contains(&order.order_hash) {
                    warn!(
                        "Order {} has no secrets on this instance; it can only complete or time out",
                        order.order_hash
                    );
                }
                self.spawn_watcher(order.order_hash, phase == OrderPhase::DstEscrowDeployed);
            }
        }
        Ok(())
    }

    async fn poll_base_fee(&self) {
        if self.auctions.is_empty() {
            return;
        }
        match self.current_base_fee().await {
            Some(fee) => {
                let updated = self.auctions.observe_base_fee(fee, self.clock.now());
                debug!("Base fee {} applied to {} auctions", fee, updated);
            }
            None => debug!("No base fee observation this round"),
        }
    }

    async fn refresh_phase_gauges(&self) -> CoordinatorResult<()> {
        for phase in OrderPhase::ALL {
            let count = self.store.list_by_phase(phase).await?.len();
            metrics::record_phase_count(phase, count);
        }
        Ok(())
    }

    /// Stop the coordination engine
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Coordination engine shutdown initiated");
    }
}

tokio::task_local! {
    /// Set inside an order's own watcher task
    static WATCHED_ORDER: OrderHash;
}

/// Holds an order's lock; the map entry goes away with the last holder
pub(super) struct OrderGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<OrderHash, Arc<Mutex<()>>>,
    order_hash: OrderHash,
}

impl Drop for OrderGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.order_hash, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn ensure_not_halted(order: &Order) -> CoordinatorResult<()> {
    match &order.halted {
        Some(reason) => Err(CoordinatorError::OrderHalted {
            order_hash: order.order_hash.to_string(),
            reason: reason.clone(),
        }),
        None => Ok(()),
    }
}

fn wrong_phase(order: &Order, expected: &str) -> CoordinatorError {
    CoordinatorError::WrongPhase {
        order_hash: order.order_hash.to_string(),
        expected: expected.to_string(),
        actual: order.phase,
    }
}

/// Classify `caller` for the timelock actor rules
fn actor_for(order: &Order, caller: &str) -> Actor {
    let is_resolver = order.is_assigned(caller)
        || order
            .resolver_accounts
            .as_ref()
            .map(|accounts| accounts.src == caller || accounts.dst == caller)
            .unwrap_or(false);
    if is_resolver {
        Actor::AssignedResolver
    } else if order.terms.maker.eq_ignore_ascii_case(caller) {
        Actor::Maker
    } else {
        Actor::Other
    }
}
