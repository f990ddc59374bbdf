//! Durable order storage
//!
//! Every order mutation goes through `compare_and_swap`, a single
//! conditional write keyed by order hash and the phase and version the
//! writer last read. Two writers that read the same state cannot both
//! succeed.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::error::CoordinatorResult;
use crate::order::{Order, OrderHash, OrderPhase, PreparedOrder};

use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get_order(&self, order_hash: &OrderHash) -> CoordinatorResult<Option<Order>>;

    /// Insert a new order; fails with `DuplicateOrder` if the hash exists
    async fn insert_order(&self, order: &Order) -> CoordinatorResult<()>;

    /// Replace the stored order only if it is still at `expected_phase` and
    /// `expected_version`. Returns whether the write was applied.
    async fn compare_and_swap(
        &self,
        expected_phase: OrderPhase,
        expected_version: u64,
        order: &Order,
    ) -> CoordinatorResult<bool>;

    async fn list_by_phase(&self, phase: OrderPhase) -> CoordinatorResult<Vec<Order>>;

    async fn stage_prepared(&self, prepared: &PreparedOrder) -> CoordinatorResult<()>;

    /// Remove and return a staged order
    async fn take_prepared(&self, id: &Uuid) -> CoordinatorResult<Option<PreparedOrder>>;

    async fn health_check(&self) -> CoordinatorResult<()>;
}
