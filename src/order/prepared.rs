//! Prepared orders for the sign-then-submit flow

use super::{OrderHash, OrderTerms};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terms staged before the maker signs them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedOrder {
    pub id: Uuid,
    pub terms: OrderTerms,
    /// The digest the maker must sign (EIP-191 over these bytes)
    pub order_hash: OrderHash,
    pub created_at: i64,
}

impl PreparedOrder {
    pub fn new(terms: OrderTerms, now: i64) -> Self {
        let order_hash = terms.order_hash();
        Self {
            id: Uuid::new_v4(),
            terms,
            order_hash,
            created_at: now,
        }
    }
}
