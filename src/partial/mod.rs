//! Partial fills over an N+1 indexed secret space
//!
//! An order split into N parts carries N+1 secrets. Secret `i` (i <= N)
//! authorizes cumulative fills up to i/N of the order; secret N+1 is reserved
//! for the fill that completes it. The secret hashes form a Merkle tree whose
//! root is the order's hashlock.

mod allocator;
mod merkle;

pub use allocator::{required_secret_index, FillRecord, PartialFillState};
pub use merkle::{MerkleProof, MerkleTree};
