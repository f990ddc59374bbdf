//! Secret revelation gate
//!
//! The gate is the only holder of secret values. It hands a secret out only
//! when every reveal condition is true, and only once per secret index.
//! Conditions are monotone: an update can set a condition, never clear it.

use super::{Hashlock, Secret};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::order::OrderHash;
use crate::partial::{MerkleProof, MerkleTree};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Index used for orders that carry a single secret
pub const SINGLE_SECRET_INDEX: u32 = 0;

/// The four conditions that must all hold before a secret is released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealConditions {
    pub escrow_safety_confirmed: bool,
    pub finality_reached: bool,
    pub resolver_identity_confirmed: bool,
    pub timing_window_open: bool,
}

impl RevealConditions {
    pub fn all_met(&self) -> bool {
        self.escrow_safety_confirmed
            && self.finality_reached
            && self.resolver_identity_confirmed
            && self.timing_window_open
    }

    /// OR-merge: true stays true
    pub fn merge(&mut self, update: &RevealConditions) {
        self.escrow_safety_confirmed |= update.escrow_safety_confirmed;
        self.finality_reached |= update.finality_reached;
        self.resolver_identity_confirmed |= update.resolver_identity_confirmed;
        self.timing_window_open |= update.timing_window_open;
    }

    /// Names of the conditions still false
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.escrow_safety_confirmed {
            missing.push("escrow_safety_confirmed");
        }
        if !self.finality_reached {
            missing.push("finality_reached");
        }
        if !self.resolver_identity_confirmed {
            missing.push("resolver_identity_confirmed");
        }
        if !self.timing_window_open {
            missing.push("timing_window_open");
        }
        missing
    }
}

/// Result of a reveal request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevealOutcome {
    Released(Secret),
    NotReady { missing: Vec<&'static str> },
    AlreadyRevealed,
}

#[derive(Debug, Clone)]
enum SecretSet {
    Single(Secret),
    /// Indices 1..=N+1, leaf `i - 1` of the tree holds index `i`
    Indexed { secrets: Vec<Secret>, tree: MerkleTree },
}

/// Everything the gate knows about one order
#[derive(Debug, Clone)]
pub struct SecretRecord {
    pub order_hash: OrderHash,
    pub hashlock: Hashlock,
    secrets: SecretSet,
    pub conditions: RevealConditions,
    /// Partial-fill indices a recorded fill has unlocked
    authorized: BTreeSet<u32>,
    /// index -> requestor
    revealed: BTreeMap<u32, String>,
}

impl SecretRecord {
    /// Bind secrets to an order, checking them against its hashlock
    pub fn new(
        order_hash: OrderHash,
        hashlock: Hashlock,
        secrets: Vec<Secret>,
        fill_parts: Option<u32>,
    ) -> CoordinatorResult<Self> {
        let set = match fill_parts {
            None => {
                let secret = match secrets.as_slice() {
                    [single] => *single,
                    _ => {
                        return Err(CoordinatorError::InvalidSecret(format!(
                            "expected exactly one secret, got {}",
                            secrets.len()
                        )))
                    }
                };
                if secret.hashlock() != hashlock {
                    return Err(CoordinatorError::InvalidSecret(
                        "secret does not match hashlock".to_string(),
                    ));
                }
                SecretSet::Single(secret)
            }
            Some(parts) => {
                let expected = parts as usize + 1;
                if secrets.len() != expected {
                    return Err(CoordinatorError::InvalidSecret(format!(
                        "expected {} secrets for {} parts, got {}",
                        expected,
                        parts,
                        secrets.len()
                    )));
                }
                let leaves: Vec<Hashlock> = secrets.iter().map(|s| s.hashlock()).collect();
                let tree = MerkleTree::build(&leaves);
                if tree.root() != hashlock {
                    return Err(CoordinatorError::InvalidSecret(
                        "merkle root of secrets does not match hashlock".to_string(),
                    ));
                }
                SecretSet::Indexed { secrets, tree }
            }
        };

        Ok(Self {
            order_hash,
            hashlock,
            secrets: set,
            conditions: RevealConditions::default(),
            authorized: BTreeSet::new(),
            revealed: BTreeMap::new(),
        })
    }

    fn secret_at(&self, index: u32) -> Option<Secret> {
        match &self.secrets {
            SecretSet::Single(secret) if index == SINGLE_SECRET_INDEX => Some(*secret),
            SecretSet::Single(_) => None,
            SecretSet::Indexed { secrets, .. } => {
                if index == 0 {
                    None
                } else {
                    secrets.get(index as usize - 1).copied()
                }
            }
        }
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self.secrets, SecretSet::Indexed { .. })
    }

    pub fn is_revealed(&self, index: u32) -> bool {
        self.revealed.contains_key(&index)
    }

    pub fn revealed_indices(&self) -> Vec<u32> {
        self.revealed.keys().copied().collect()
    }
}

/// Holds one `SecretRecord` per order
pub struct SecretGate {
    records: DashMap<OrderHash, SecretRecord>,
}

impl SecretGate {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Register an order's secrets
    pub fn register(&self, record: SecretRecord) -> CoordinatorResult<()> {
        let order_hash = record.order_hash;
        if self.records.contains_key(&order_hash) {
            return Err(CoordinatorError::DuplicateOrder {
                order_hash: order_hash.to_string(),
            });
        }
        self.records.insert(order_hash, record);
        debug!("Registered secrets for order {}", order_hash);
        Ok(())
    }

    /// Merge condition updates into the record; returns the merged set
    pub fn set_conditions(
        &self,
        order_hash: &OrderHash,
        update: RevealConditions,
    ) -> CoordinatorResult<RevealConditions> {
        let mut record = self
            .records
            .get_mut(order_hash)
            .ok_or_else(|| CoordinatorError::OrderNotFound(order_hash.to_string()))?;
        record.conditions.merge(&update);
        Ok(record.conditions)
    }

    pub fn conditions(&self, order_hash: &OrderHash) -> Option<RevealConditions> {
        self.records.get(order_hash).map(|r| r.conditions)
    }

    /// Allow a partial-fill index to be revealed once its fill is recorded
    pub fn authorize_index(&self, order_hash: &OrderHash, index: u32) -> CoordinatorResult<()> {
        let mut record = self
            .records
            .get_mut(order_hash)
            .ok_or_else(|| CoordinatorError::OrderNotFound(order_hash.to_string()))?;
        if record.secret_at(index).is_none() || !record.is_indexed() {
            return Err(CoordinatorError::SecretIndexUsed { index });
        }
        record.authorized.insert(index);
        Ok(())
    }

    /// Release the secret at `index` if, and only if, all conditions hold
    /// and it has not been released before.
    pub fn request_reveal(
        &self,
        order_hash: &OrderHash,
        requestor: &str,
        index: u32,
    ) -> CoordinatorResult<RevealOutcome> {
        let mut record = self
            .records
            .get_mut(order_hash)
            .ok_or_else(|| CoordinatorError::OrderNotFound(order_hash.to_string()))?;

        let secret = record
            .secret_at(index)
            .ok_or(CoordinatorError::SecretIndexUsed { index })?;

        if record.is_revealed(index) {
            return Ok(RevealOutcome::AlreadyRevealed);
        }

        if !record.conditions.all_met() {
            let missing = record.conditions.missing();
            warn!(
                "Reveal for order {} index {} refused, missing {:?}",
                order_hash, index, missing
            );
            return Ok(RevealOutcome::NotReady { missing });
        }

        if record.is_indexed() && !record.authorized.contains(&index) {
            return Err(CoordinatorError::InvalidFill(format!(
                "secret {} has no recorded fill",
                index
            )));
        }

        record.revealed.insert(index, requestor.to_string());
        info!(
            "Secret {} of order {} released to {}",
            index, order_hash, requestor
        );
        Ok(RevealOutcome::Released(secret))
    }

    pub fn is_revealed(&self, order_hash: &OrderHash, index: u32) -> bool {
        self.records
            .get(order_hash)
            .map(|r| r.is_revealed(index))
            .unwrap_or(false)
    }

    pub fn revealed_indices(&self, order_hash: &OrderHash) -> Vec<u32> {
        self.records
            .get(order_hash)
            .map(|r| r.revealed_indices())
            .unwrap_or_default()
    }

    /// Merkle proof for a revealed partial-fill secret
    pub fn proof(&self, order_hash: &OrderHash, index: u32) -> Option<MerkleProof> {
        let record = self.records.get(order_hash)?;
        if !record.is_revealed(index) {
            return None;
        }
        match &record.secrets {
            SecretSet::Indexed { tree, .. } => tree.proof(index),
            SecretSet::Single(_) => None,
        }
    }

    pub fn contains(&self, order_hash: &OrderHash) -> bool {
        self.records.contains_key(order_hash)
    }

    /// Drop the record of a finished order
    pub fn remove(&self, order_hash: &OrderHash) {
        self.records.remove(order_hash);
    }
}

impl Default for SecretGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_true() -> RevealConditions {
        RevealConditions {
            escrow_safety_confirmed: true,
            finality_reached: true,
            resolver_identity_confirmed: true,
            timing_window_open: true,
        }
    }

    fn single_gate() -> (SecretGate, OrderHash, Secret) {
        let secret = Secret([3u8; 32]);
        let order_hash = OrderHash([1u8; 32]);
        let gate = SecretGate::new();
        gate.register(SecretRecord::new(order_hash, secret.hashlock(), vec![secret], None).unwrap())
            .unwrap();
        (gate, order_hash, secret)
    }

    #[test]
    fn test_secret_must_match_hashlock() {
        let err = SecretRecord::new(
            OrderHash([1u8; 32]),
            Secret([4u8; 32]).hashlock(),
            vec![Secret([3u8; 32])],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidSecret(_)));
    }

    #[test]
    fn test_not_ready_until_all_conditions() {
        let (gate, order_hash, secret) = single_gate();

        let partial = RevealConditions {
            escrow_safety_confirmed: true,
            finality_reached: true,
            timing_window_open: true,
            resolver_identity_confirmed: false,
        };
        gate.set_conditions(&order_hash, partial).unwrap();
        let outcome = gate
            .request_reveal(&order_hash, "resolver.near", SINGLE_SECRET_INDEX)
            .unwrap();
        assert_eq!(
            outcome,
            RevealOutcome::NotReady {
                missing: vec!["resolver_identity_confirmed"]
            }
        );

        gate.set_conditions(&order_hash, all_true()).unwrap();
        let outcome = gate
            .request_reveal(&order_hash, "resolver.near", SINGLE_SECRET_INDEX)
            .unwrap();
        assert_eq!(outcome, RevealOutcome::Released(secret));
    }

    #[test]
    fn test_released_exactly_once() {
        let (gate, order_hash, _) = single_gate();
        gate.set_conditions(&order_hash, all_true()).unwrap();
        assert!(matches!(
            gate.request_reveal(&order_hash, "r", SINGLE_SECRET_INDEX).unwrap(),
            RevealOutcome::Released(_)
        ));
        assert_eq!(
            gate.request_reveal(&order_hash, "r", SINGLE_SECRET_INDEX).unwrap(),
            RevealOutcome::AlreadyRevealed
        );
    }

    #[test]
    fn test_conditions_are_monotone() {
        let (gate, order_hash, _) = single_gate();
        gate.set_conditions(&order_hash, all_true()).unwrap();
        let merged = gate
            .set_conditions(&order_hash, RevealConditions::default())
            .unwrap();
        assert!(merged.all_met());
    }

    #[test]
    fn test_indexed_secret_needs_recorded_fill() {
        let secrets: Vec<Secret> = (1..=5u8).map(|i| Secret([i; 32])).collect();
        let leaves: Vec<Hashlock> = secrets.iter().map(|s| s.hashlock()).collect();
        let root = MerkleTree::build(&leaves).root();
        let order_hash = OrderHash([2u8; 32]);

        let gate = SecretGate::new();
        gate.register(SecretRecord::new(order_hash, root, secrets.clone(), Some(4)).unwrap())
            .unwrap();
        gate.set_conditions(&order_hash, all_true()).unwrap();

        assert!(gate.request_reveal(&order_hash, "r", 2).is_err());
        gate.authorize_index(&order_hash, 2).unwrap();
        assert_eq!(
            gate.request_reveal(&order_hash, "r", 2).unwrap(),
            RevealOutcome::Released(secrets[1])
        );

        let proof = gate.proof(&order_hash, 2).unwrap();
        assert!(proof.verify(&secrets[1].hashlock(), &root));
        assert!(gate.proof(&order_hash, 3).is_none());
    }

    #[test]
    fn test_wrong_secret_count_for_parts() {
        let secrets: Vec<Secret> = (1..=3u8).map(|i| Secret([i; 32])).collect();
        let err = SecretRecord::new(OrderHash([2u8; 32]), Hashlock([0u8; 32]), secrets, Some(4))
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidSecret(_)));
    }
}
