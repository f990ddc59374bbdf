//! Merkle tree over partial-fill secret hashes
//!
//! Matches the escrow contracts: a node at an even position hashes
//! `sha256(node || sibling)`, at an odd position `sha256(sibling || node)`.
//! A level with an odd count pairs its last node with itself.

use crate::secret::Hashlock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Proof that a secret hash sits at a given index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Secret index (1-based); the leaf position is `index - 1`
    pub index: u32,
    pub siblings: Vec<Hashlock>,
}

impl MerkleProof {
    pub fn verify(&self, leaf: &Hashlock, root: &Hashlock) -> bool {
        if self.index == 0 {
            return false;
        }
        let mut node = leaf.0;
        let mut position = self.index - 1;
        for sibling in &self.siblings {
            node = if position % 2 == 0 {
                hash_pair(&node, &sibling.0)
            } else {
                hash_pair(&sibling.0, &node)
            };
            position /= 2;
        }
        node == root.0
    }
}

/// Full tree kept by the coordinator for proof generation
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] are the leaves, the last level is the root
    levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    pub fn build(leaves: &[Hashlock]) -> Self {
        let mut levels = vec![leaves.iter().map(|l| l.0).collect::<Vec<_>>()];
        if levels[0].is_empty() {
            levels[0].push([0u8; 32]);
        }

        while levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let next = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_pair(left, right),
                    [single] => hash_pair(single, single),
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            levels.push(next);
        }

        Self { levels }
    }

    pub fn root(&self) -> Hashlock {
        Hashlock(self.levels[self.levels.len() - 1][0])
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Proof for secret `index` (1-based)
    pub fn proof(&self, index: u32) -> Option<MerkleProof> {
        if index == 0 || index as usize > self.leaf_count() {
            return None;
        }

        let mut position = index as usize - 1;
        let mut siblings = Vec::with_capacity(self.levels.len() - 1);
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if position % 2 == 0 {
                level.get(position + 1).unwrap_or(&level[position])
            } else {
                &level[position - 1]
            };
            siblings.push(Hashlock(*sibling));
            position /= 2;
        }

        Some(MerkleProof { index, siblings })
    }
}
