//! Secrets, hashlocks and the revelation gate

mod gate;

pub use gate::{RevealConditions, RevealOutcome, SecretGate, SecretRecord, SINGLE_SECRET_INDEX};

use crate::error::{CoordinatorError, CoordinatorResult};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

fn parse_bytes32(s: &str, what: &str) -> CoordinatorResult<[u8; 32]> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(raw)
        .map_err(|e| CoordinatorError::InvalidSecret(format!("bad {} hex: {}", what, e)))?;
    bytes
        .try_into()
        .map_err(|_| CoordinatorError::InvalidSecret(format!("{} must be 32 bytes", what)))
}

/// Commitment bound into both escrows
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hashlock(pub [u8; 32]);

impl Hashlock {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashlock({})", self)
    }
}

impl FromStr for Hashlock {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_bytes32(s, "hashlock").map(Hashlock)
    }
}

impl Serialize for Hashlock {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hashlock {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hashlock::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A preimage. Debug output is redacted.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Secret(pub [u8; 32]);

impl Secret {
    pub fn hashlock(&self) -> Hashlock {
        hash_secret(&self.0)
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl FromStr for Secret {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_bytes32(s, "secret").map(Secret)
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Secret::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// SHA-256 hashlock of a secret, as both escrow families compute it
pub fn hash_secret(secret: &[u8]) -> Hashlock {
    let digest = Sha256::digest(secret);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Hashlock(out)
}
