//! Identifiers: participant addresses, content references, transaction handles

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A 20-byte participant address (ledger account)
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Derive a stable address from a label (simulation and tests)
    pub fn from_label(label: &str) -> Self {
        let digest = blake3::hash(label.as_bytes());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest.as_bytes()[..20]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Content-derived identifier of an immutable blob
///
/// Base58 encoding of the blake3 digest, so identical bytes always map to
/// the same reference.
#[derive(
    Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct ContentRef(String);

impl ContentRef {
    /// Wrap an existing reference string (as read from the ledger)
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Compute the reference for a blob
    pub fn for_bytes(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        Self(bs58::encode(digest.as_bytes()).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URI form recorded alongside model commits
    pub fn uri(&self) -> String {
        format!("content://{}", self.0)
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentRef({})", self.0)
    }
}

/// Handle of a confirmed ledger transaction
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHandle {
    /// Transaction hash as reported by the ledger
    pub tx_hash: String,
    /// Block the transaction was included in
    pub block: u64,
}
