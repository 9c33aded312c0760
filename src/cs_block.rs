//! Blocks and their content address
//!
//! A block's `hash` is `blake3(canonical_encode(height, transactions, previous_hash,
//! creator, timestamp, nonce))`. The encoding is fixed-width little-endian with the
//! transaction count in front of the transactions, so no two different blocks share
//! an encoding.

use crate::cs_interface::{
    BlockHash, Height, NodeId, SimTime, Transaction, GENESIS_PREVIOUS_HASH, SYSTEM_NODE,
};

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub height: Height,
    pub transactions: Vec<Transaction>,
    pub previous_hash: BlockHash,
    pub creator: NodeId,
    pub timestamp: SimTime,
    pub nonce: u64,

    // Not part of the encoding (it is the digest of it)
    pub hash: BlockHash,
}

impl Block {
    /// Candidate block with nonce 0 and a matching hash
    pub fn new(
        height: Height,
        transactions: Vec<Transaction>,
        previous_hash: BlockHash,
        creator: NodeId,
        timestamp: SimTime,
    ) -> Self {
        let mut block = Self {
            height,
            transactions,
            previous_hash,
            creator,
            timestamp,
            nonce: 0,
            hash: [0u8; 32],
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Height 0: no transactions, sentinel parent, system creator, time 0.
    /// Identical on every node.
    pub fn genesis() -> Self {
        Self::new(0, Vec::new(), GENESIS_PREVIOUS_HASH, SYSTEM_NODE, 0)
    }

    pub fn calculate_hash(&self) -> BlockHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.height.to_le_bytes());
        hasher.update(&(self.transactions.len() as u64).to_le_bytes());
        for tx in &self.transactions {
            hasher.update(&tx.id.to_le_bytes());
            hasher.update(&tx.sender.to_le_bytes());
            hasher.update(&tx.recipient.to_le_bytes());
            hasher.update(&tx.amount.to_le_bytes());
        }
        hasher.update(&self.previous_hash);
        hasher.update(&self.creator.to_le_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&self.nonce.to_le_bytes());

        *hasher.finalize().as_bytes()
    }

    /// Stored hash matches the content
    pub fn hash_matches(&self) -> bool {
        self.hash == self.calculate_hash()
    }
}

/// Number of leading zero hex digits of a hash
pub fn leading_zero_digits(hash: &BlockHash) -> u32 {
    let mut zeros = 0;
    for byte in hash {
        if *byte == 0 {
            zeros += 2;
        } else {
            if byte >> 4 == 0 {
                zeros += 1;
            }
            break;
        }
    }
    zeros
}

pub fn meets_difficulty(hash: &BlockHash, difficulty: u32) -> bool {
    leading_zero_digits(hash) >= difficulty
}

/// Brute-force nonce search: 0, 1, 2, ... until the hash has `difficulty`
/// leading zero hex digits. Unbounded; runs to completion once started.
pub fn mine(mut candidate: Block, difficulty: u32) -> Block {
    candidate.nonce = 0;
    candidate.hash = candidate.calculate_hash();

    while !meets_difficulty(&candidate.hash, difficulty) {
        candidate.nonce += 1;
        candidate.hash = candidate.calculate_hash();
    }

    candidate
}
