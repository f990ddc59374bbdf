//! Domain events emitted by the coordination engine
//!
//! Components never call each other back; they publish typed events on the
//! bus and interested parties subscribe. Events carry no secret values.

use crate::order::{ChainSide, OrderHash, OrderPhase};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    OrderSubmitted {
        order_hash: OrderHash,
    },
    OrderClaimed {
        order_hash: OrderHash,
        resolver: String,
        rate: Option<f64>,
    },
    EscrowDeployed {
        order_hash: OrderHash,
        side: ChainSide,
        address: String,
        tx_hash: String,
    },
    EscrowVerified {
        order_hash: OrderHash,
        side: ChainSide,
    },
    VerificationFailed {
        order_hash: OrderHash,
        side: ChainSide,
        issues: Vec<String>,
    },
    PhaseChanged {
        order_hash: OrderHash,
        from: OrderPhase,
        to: OrderPhase,
    },
    SecretRevealed {
        order_hash: OrderHash,
        index: u32,
        requestor: String,
    },
    PartialFillRecorded {
        order_hash: OrderHash,
        resolver: String,
        amount: u128,
        secret_index: u32,
    },
    OrderCancelled {
        order_hash: OrderHash,
        reason: String,
    },
    OrderRecovery {
        order_hash: OrderHash,
        reason: String,
    },
    OrderCompleted {
        order_hash: OrderHash,
    },
    OrderHalted {
        order_hash: OrderHash,
        reason: String,
    },
}

impl DomainEvent {
    pub fn order_hash(&self) -> OrderHash {
        match self {
            DomainEvent::OrderSubmitted { order_hash }
            | DomainEvent::OrderClaimed { order_hash, .. }
            | DomainEvent::EscrowDeployed { order_hash, .. }
            | DomainEvent::EscrowVerified { order_hash, .. }
            | DomainEvent::VerificationFailed { order_hash, .. }
            | DomainEvent::PhaseChanged { order_hash, .. }
            | DomainEvent::SecretRevealed { order_hash, .. }
            | DomainEvent::PartialFillRecorded { order_hash, .. }
            | DomainEvent::OrderCancelled { order_hash, .. }
            | DomainEvent::OrderRecovery { order_hash, .. }
            | DomainEvent::OrderCompleted { order_hash }
            | DomainEvent::OrderHalted { order_hash, .. } => *order_hash,
        }
    }

    /// Get event name
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::OrderSubmitted { .. } => "OrderSubmitted",
            DomainEvent::OrderClaimed { .. } => "OrderClaimed",
            DomainEvent::EscrowDeployed { .. } => "EscrowDeployed",
            DomainEvent::EscrowVerified { .. } => "EscrowVerified",
            DomainEvent::VerificationFailed { .. } => "VerificationFailed",
            DomainEvent::PhaseChanged { .. } => "PhaseChanged",
            DomainEvent::SecretRevealed { .. } => "SecretRevealed",
            DomainEvent::PartialFillRecorded { .. } => "PartialFillRecorded",
            DomainEvent::OrderCancelled { .. } => "OrderCancelled",
            DomainEvent::OrderRecovery { .. } => "OrderRecovery",
            DomainEvent::OrderCompleted { .. } => "OrderCompleted",
            DomainEvent::OrderHalted { .. } => "OrderHalted",
        }
    }
}

/// Broadcast dispatcher for domain events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: DomainEvent) {
        debug!("Event {} for order {}", event.name(), event.order_hash());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let order_hash = OrderHash([5u8; 32]);

        bus.publish(DomainEvent::OrderSubmitted { order_hash });
        bus.publish(DomainEvent::OrderCompleted { order_hash });

        assert_eq!(rx.recv().await.unwrap().name(), "OrderSubmitted");
        let completed = rx.recv().await.unwrap();
        assert_eq!(completed.order_hash(), order_hash);
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new(4).publish(DomainEvent::OrderSubmitted {
            order_hash: OrderHash([0u8; 32]),
        });
    }

    #[test]
    fn test_serialized_tag() {
        let event = DomainEvent::OrderHalted {
            order_hash: OrderHash([0u8; 32]),
            reason: "phase regressed".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "order_halted");
    }
}
