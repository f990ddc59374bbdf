//! In-memory order store

use super::OrderStore;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::order::{Order, OrderHash, OrderPhase, PreparedOrder};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// Store backed by `DashMap`; a shard write lock makes each CAS atomic
#[derive(Default)]
pub struct MemoryStore {
    orders: DashMap<OrderHash, Order>,
    prepared: DashMap<Uuid, PreparedOrder>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn get_order(&self, order_hash: &OrderHash) -> CoordinatorResult<Option<Order>> {
        Ok(self.orders.get(order_hash).map(|o| o.clone()))
    }

    async fn insert_order(&self, order: &Order) -> CoordinatorResult<()> {
        match self.orders.entry(order.order_hash) {
            Entry::Occupied(_) => Err(CoordinatorError::DuplicateOrder {
                order_hash: order.order_hash.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(order.clone());
                Ok(())
            }
        }
    }

    async fn compare_and_swap(
        &self,
        expected_phase: OrderPhase,
        expected_version: u64,
        order: &Order,
    ) -> CoordinatorResult<bool> {
        let mut current = match self.orders.get_mut(&order.order_hash) {
            Some(current) => current,
            None => return Err(CoordinatorError::OrderNotFound(order.order_hash.to_string())),
        };

        if current.phase != expected_phase || current.version != expected_version {
            return Ok(false);
        }
        *current = order.clone();
        Ok(true)
    }

    async fn list_by_phase(&self, phase: OrderPhase) -> CoordinatorResult<Vec<Order>> {
        Ok(self
            .orders
            .iter()
            .filter(|o| o.phase == phase)
            .map(|o| o.clone())
            .collect())
    }

    async fn stage_prepared(&self, prepared: &PreparedOrder) -> CoordinatorResult<()> {
        self.prepared.insert(prepared.id, prepared.clone());
        Ok(())
    }

    async fn take_prepared(&self, id: &Uuid) -> CoordinatorResult<Option<PreparedOrder>> {
        Ok(self.prepared.remove(id).map(|(_, p)| p))
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        Ok(())
    }
}
