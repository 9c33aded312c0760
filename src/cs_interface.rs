use crate::cs_block::Block;

// all the same numeric type of some size to allow casting/interop
pub type NodeId = u64;
pub type TxId = u64;
pub type Height = u64;

/// Simulated time in milliseconds
pub type SimTime = u64;

/// blake3 digest of a block's canonical encoding
pub type BlockHash = [u8; 32];

/// `previous_hash` of the genesis block
pub const GENESIS_PREVIOUS_HASH: BlockHash = [0u8; 32];

/// Creator of the genesis block (no real node carries this id)
pub const SYSTEM_NODE: NodeId = NodeId::MAX;

/// Transfer of coins between two nodes.
///
/// Identity is the `id`: two transactions with the same id are the same
/// transaction, whatever the other fields say.
#[derive(Clone, Copy, Debug)]
pub struct Transaction {
    pub id: TxId,
    pub sender: NodeId,
    pub recipient: NodeId,
    pub amount: u64,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transaction {}

impl std::hash::Hash for Transaction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    NewTx { tx: Transaction },
    /// Full snapshot of the sender's chain at send time
    GossipChain { chain: Vec<Block> },
}

#[derive(Clone, Debug)]
pub struct MessageEnvelope {
    pub sender: NodeId,
    pub receiver: NodeId,
    /// send time
    pub time: SimTime,
    pub deliver_at: SimTime,
    pub message: Message,
}

/// Outgoing side of the network as seen by a node.
///
/// Implementations copy the message per recipient; the caller keeps ownership
/// of whatever it passed in.
pub trait Transport {
    fn broadcast(&mut self, sender: NodeId, message: &Message);

    fn send_direct(&mut self, sender: NodeId, recipient: NodeId, message: &Message);
}

// ============================================================================
// Event Logging System
// ============================================================================

/// Events emitted by nodes for debugging and analysis
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Block produced by this node and appended to its chain
    BlockMined {
        height: Height,
        nonce: u64,
        algorithm: &'static str,
    },
    /// A better peer chain was chosen and a reorg is about to be attempted
    ReorgStart {
        old_height: Height,
        peer_height: Height,
    },
    /// Reorg applied
    ReorgComplete {
        old_height: Height,
        new_height: Height,
        orphaned: usize,
    },
    /// Reorg would have rewritten finalized history
    ReorgRejectedFinality {
        finalized_height: Option<Height>,
        fork_point: Option<Height>,
    },
    FinalityUpdate {
        previous_final_height: Option<Height>,
        new_final_height: Height,
    },
    /// Fatal invariant violation; finality is halted for this node
    FinalityError { reason: String, height: Height },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::BlockMined { .. } => "BLOCK_MINED",
            Event::ReorgStart { .. } => "REORG_START",
            Event::ReorgComplete { .. } => "REORG_COMPLETE",
            Event::ReorgRejectedFinality { .. } => "REORG_REJECTED_FINALITY",
            Event::FinalityUpdate { .. } => "FINALITY_UPDATE",
            Event::FinalityError { .. } => "FINALITY_ERROR",
        }
    }
}

/// Trait for consuming events from the nodes
pub trait EventSink {
    fn log(&mut self, time: SimTime, node: NodeId, event: Event);
}

/// No-op event sink (zero overhead)
pub struct NoOpSink;

impl EventSink for NoOpSink {
    #[inline(always)]
    fn log(&mut self, _time: SimTime, _node: NodeId, _event: Event) {}
}

/// Short hex prefix of a hash, for log lines
pub fn short_hash(hash: &BlockHash) -> String {
    hash[..5].iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn hash_hex(hash: &BlockHash) -> String {
    blake3::Hash::from(*hash).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashSet;

    #[test]
    fn test_transaction_identity_is_id() {
        let a = Transaction {
            id: 7,
            sender: 1,
            recipient: 2,
            amount: 3,
        };
        let b = Transaction {
            id: 7,
            sender: 4,
            recipient: 5,
            amount: 6,
        };
        let c = Transaction { id: 8, ..a };

        assert_eq!(a, b, "same id must compare equal");
        assert_ne!(a, c, "same content, different id must differ");

        let set: HashSet<Transaction> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_hash_formatting() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        hash[1] = 0x01;

        assert_eq!(short_hash(&hash), "ab01000000");
        assert_eq!(hash_hex(&hash).len(), 64);
        assert!(hash_hex(&hash).starts_with("ab01"));
    }
}
