//! Error types for the swap coordinator

use crate::order::{ChainSide, OrderPhase};
use thiserror::Error;

/// How a caller should read a failure.
///
/// Resolvers make irreversible on-chain commitments based on our answers, so
/// "not allowed" must never be confused with "not found" or "we broke".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A business rule rejected the request
    Rejected,
    /// The referenced order or staged order does not exist
    NotFound,
    /// Storage, chain or coordinator failure
    Internal,
}

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Order {0} not found")]
    OrderNotFound(String),

    #[error("Prepared order {0} not found")]
    PreparedOrderNotFound(String),

    #[error("Order {order_hash} already exists")]
    DuplicateOrder { order_hash: String },

    #[error("Order {order_hash} is in phase {actual}, expected {expected}")]
    WrongPhase {
        order_hash: String,
        expected: String,
        actual: OrderPhase,
    },

    #[error("Order {order_hash} already claimed by {resolver}")]
    AlreadyClaimed { order_hash: String, resolver: String },

    #[error("{caller} is not the assigned resolver for order {order_hash}")]
    NotAssignedResolver { order_hash: String, caller: String },

    #[error("{caller} may not act on the {side} escrow during {phase}")]
    UnauthorizedForWindow {
        caller: String,
        side: ChainSide,
        phase: String,
    },

    #[error("Timelock window not open: {0}")]
    WindowNotOpen(String),

    #[error("Conflicting deployment for {side} escrow of order {order_hash}: {message}")]
    ConflictingDeployment {
        order_hash: String,
        side: ChainSide,
        message: String,
    },

    #[error("Secret {index} already used or invalid")]
    SecretIndexUsed { index: u32 },

    #[error("Invalid fill: {0}")]
    InvalidFill(String),

    #[error("Order {0} does not allow partial fills")]
    PartialFillsNotSupported(String),

    #[error("Order {0} already completed")]
    OrderCompleted(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid secret: {0}")]
    InvalidSecret(String),

    #[error("Invalid timelock configuration: {0}")]
    InvalidTimelocks(String),

    #[error("Chain {chain} unavailable: {message}")]
    ChainUnavailable { chain: String, message: String },

    #[error("Reorg on {chain}: transaction {tx_hash} no longer included")]
    ReorgDetected { chain: String, tx_hash: String },

    #[error("Chain {0} not configured")]
    ChainNotConfigured(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invariant violated for order {order_hash}: {message}")]
    InvariantViolation { order_hash: String, message: String },

    #[error("Order {order_hash} halted: {reason}")]
    OrderHalted { order_hash: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Classify the error for callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::OrderNotFound(_) | CoordinatorError::PreparedOrderNotFound(_) => {
                ErrorKind::NotFound
            }
            CoordinatorError::ChainUnavailable { .. }
            | CoordinatorError::ChainNotConfigured(_)
            | CoordinatorError::ReorgDetected { .. }
            | CoordinatorError::Database(_)
            | CoordinatorError::Config(_)
            | CoordinatorError::InvariantViolation { .. }
            | CoordinatorError::Internal(_) => ErrorKind::Internal,
            _ => ErrorKind::Rejected,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::ChainUnavailable { .. } | CoordinatorError::Database(_)
        )
    }

    /// Invariant violations and reorged deployments stop all automatic
    /// processing of the order
    pub fn is_fatal_for_order(&self) -> bool {
        matches!(
            self,
            CoordinatorError::InvariantViolation { .. } | CoordinatorError::ReorgDetected { .. }
        )
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::OrderNotFound(_) => "order_not_found",
            CoordinatorError::PreparedOrderNotFound(_) => "prepared_order_not_found",
            CoordinatorError::DuplicateOrder { .. } => "duplicate_order",
            CoordinatorError::WrongPhase { .. } => "wrong_phase",
            CoordinatorError::AlreadyClaimed { .. } => "already_claimed",
            CoordinatorError::NotAssignedResolver { .. } => "not_assigned_resolver",
            CoordinatorError::UnauthorizedForWindow { .. } => "unauthorized_for_window",
            CoordinatorError::WindowNotOpen(_) => "window_not_open",
            CoordinatorError::ConflictingDeployment { .. } => "conflicting_deployment",
            CoordinatorError::SecretIndexUsed { .. } => "secret_index_used",
            CoordinatorError::InvalidFill(_) => "invalid_fill",
            CoordinatorError::PartialFillsNotSupported(_) => "partial_fills_not_supported",
            CoordinatorError::OrderCompleted(_) => "order_completed",
            CoordinatorError::InvalidOrder(_) => "invalid_order",
            CoordinatorError::InvalidSignature(_) => "invalid_signature",
            CoordinatorError::InvalidSecret(_) => "invalid_secret",
            CoordinatorError::InvalidTimelocks(_) => "invalid_timelocks",
            CoordinatorError::ChainUnavailable { .. } => "chain_unavailable",
            CoordinatorError::ReorgDetected { .. } => "reorg_detected",
            CoordinatorError::ChainNotConfigured(_) => "chain_not_configured",
            CoordinatorError::Database(_) => "database_error",
            CoordinatorError::Config(_) => "config_error",
            CoordinatorError::InvariantViolation { .. } => "invariant_violation",
            CoordinatorError::OrderHalted { .. } => "order_halted",
            CoordinatorError::Internal(_) => "internal_error",
        }
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            CoordinatorError::OrderNotFound("0xab".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CoordinatorError::SecretIndexUsed { index: 2 }.kind(),
            ErrorKind::Rejected
        );
        assert_eq!(
            CoordinatorError::ChainUnavailable {
                chain: "evm".into(),
                message: "timeout".into()
            }
            .kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_secret_index_message() {
        let err = CoordinatorError::SecretIndexUsed { index: 2 };
        assert_eq!(err.to_string(), "Secret 2 already used or invalid");
    }

    #[test]
    fn test_invariant_violation_is_fatal() {
        let err = CoordinatorError::InvariantViolation {
            order_hash: "0x01".into(),
            message: "phase regressed".into(),
        };
        assert!(err.is_fatal_for_order());
        assert!(!err.is_retryable());
    }
}
