//! Coordination engine for cross-chain swap orders
//!
//! The coordination engine:
//! 1. Accepts signed orders and takes custody of their secrets
//! 2. Serializes resolver claims and escrow confirmations per order
//! 3. Verifies both escrows and gates secret revelation on the result
//! 4. Watches deployed orders until they complete or are recovered

pub mod clock;
pub mod engine;
pub mod tasks;
pub mod types;
mod watcher;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::CoordinationEngine;
pub use tasks::OrderTasks;
pub use types::{
    AuctionParams, DeploymentReport, OrderStatus, RevealResponse, SafetyReport, SideSafety,
    SideStatus, SubmitOrder,
};
