//! Fusion coordinator - cross-chain HTLC swaps between EVM chains and NEAR
//!
//! The coordinator holds maker secrets, serializes resolver actions on each
//! order, verifies both escrows on chain, and releases a secret only once
//! every reveal condition holds.

pub mod api;
pub mod auction;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod metrics;
pub mod order;
pub mod partial;
pub mod secret;
pub mod store;
pub mod timelock;
pub mod verifier;

pub use coordination::CoordinationEngine;
pub use error::{CoordinatorError, CoordinatorResult};
