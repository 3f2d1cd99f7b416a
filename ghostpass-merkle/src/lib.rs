//! Merkle commitment over a sale's winning attempts. The leaf schema and the
//! tree shape are part of the public protocol: anyone holding the winner list
//! can recompute the committed root from public data.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub type Hash32 = [u8; 32];

pub const COMMIT_MAGIC: &str = "GPSCOMMIT";
pub const COMMIT_VERSION: &str = "v1";

/// One winner, in the canonical field order. Optional fields render as the
/// empty string so a fallback-mode winner (null buyer hash) still has a
/// stable serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleLeaf {
    pub final_rank: u32,
    pub txid: String,
    pub accepting_block_hash: Option<String>,
    pub accepting_blue_score: Option<u64>,
    pub buyer_addr_hash: Option<String>,
}

impl MerkleLeaf {
    /// `"{finalRank}|{txid}|{acceptingBlockHash||''}|{acceptingBlueScore||''}|{buyerAddrHash||''}"`
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.final_rank,
            self.txid,
            self.accepting_block_hash.as_deref().unwrap_or(""),
            self.accepting_blue_score
                .map(|s| s.to_string())
                .unwrap_or_default(),
            self.buyer_addr_hash.as_deref().unwrap_or(""),
        )
    }

    pub fn hash(&self) -> Hash32 {
        Sha256::digest(self.canonical().as_bytes()).into()
    }
}

/// Root of the empty winner set: the hash of the empty string. Degenerate but
/// defined, so an empty allocation still has a recomputable commitment.
pub fn empty_root() -> Hash32 {
    Sha256::digest(b"").into()
}

fn parent(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofStep {
    /// Sibling hash, hex.
    pub sibling: String,
    /// Which side the sibling sits on when folding toward the root.
    pub position: Position,
}

/// Bottom-up binary tree over leaf hashes. At every level children are
/// concatenated as raw 32-byte pairs; an odd trailing child is paired with
/// itself.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash32>>,
}

impl MerkleTree {
    pub fn build(leaves: &[Hash32]) -> Self {
        if leaves.is_empty() {
            return Self { levels: Vec::new() };
        }
        let mut levels = vec![leaves.to_vec()];
        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let current = &levels[levels.len() - 1];
            let mut next = Vec::with_capacity((current.len() + 1) / 2);
            for pair in current.chunks(2) {
                let right = pair.get(1).unwrap_or(&pair[0]);
                next.push(parent(&pair[0], right));
            }
            levels.push(next);
        }
        Self { levels }
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn root(&self) -> Hash32 {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or_else(empty_root)
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root())
    }

    /// Proof for the leaf at `index`: sibling steps from the leaf level to
    /// just below the root. `None` when the index is out of range.
    pub fn proof(&self, index: usize) -> Option<Vec<ProofStep>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut steps = Vec::new();
        let mut pos = index;
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let sibling_index = pos ^ 1;
            // An odd tail is duplicated, so its sibling is itself.
            let sibling = level.get(sibling_index).unwrap_or(&level[pos]);
            let position = if sibling_index < pos {
                Position::Left
            } else {
                Position::Right
            };
            steps.push(ProofStep {
                sibling: hex::encode(sibling),
                position,
            });
            pos /= 2;
        }
        Some(steps)
    }
}

/// Folds a leaf hash through a proof and compares against the root.
pub fn verify_inclusion(leaf: &Hash32, proof: &[ProofStep], root: &Hash32) -> bool {
    let mut current = *leaf;
    for step in proof {
        let sibling: Hash32 = match hex::decode(&step.sibling)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
        {
            Some(hash) => hash,
            None => return false,
        };
        current = match step.position {
            Position::Left => parent(&sibling, &current),
            Position::Right => parent(&current, &sibling),
        };
    }
    current == *root
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommitError {
    #[error("commit payload is not valid hex")]
    Hex,
    #[error("commit payload is not utf-8")]
    Utf8,
    #[error("commit payload has {0} segments, expected 4")]
    Segments(usize),
    #[error("commit payload header mismatch")]
    Header,
}

/// The payload anchored on-chain: `GPSCOMMIT|v1|<saleId>|<merkleRoot-hex>`,
/// transported as hex-encoded UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPayload {
    pub sale_id: String,
    pub merkle_root: String,
}

impl CommitPayload {
    pub fn to_wire(&self) -> String {
        format!(
            "{COMMIT_MAGIC}|{COMMIT_VERSION}|{}|{}",
            self.sale_id, self.merkle_root
        )
    }

    pub fn encode_hex(&self) -> String {
        hex::encode(self.to_wire().as_bytes())
    }

    pub fn parse_hex(raw: &str) -> Result<Self, CommitError> {
        let bytes = hex::decode(raw).map_err(|_| CommitError::Hex)?;
        let text = String::from_utf8(bytes).map_err(|_| CommitError::Utf8)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, CommitError> {
        let parts: Vec<&str> = text.split('|').collect();
        if parts.len() != 4 {
            return Err(CommitError::Segments(parts.len()));
        }
        if parts[0] != COMMIT_MAGIC || parts[1] != COMMIT_VERSION {
            return Err(CommitError::Header);
        }
        Ok(Self {
            sale_id: parts[2].to_string(),
            merkle_root: parts[3].to_string(),
        })
    }
}
