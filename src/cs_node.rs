use std::rc::Rc;

use hashbrown::HashSet;
use log::{debug, error, warn};

use crate::cs_block::Block;
use crate::cs_consensus::{Consensus, ForkChoice};
use crate::cs_finality::{FinalityAdvance, FinalityError, FinalityLedger};
use crate::cs_interface::{
    short_hash, Event, EventSink, Height, Message, MessageEnvelope, NodeId, NoOpSink, SimTime,
    Transaction, Transport, TxId,
};
use crate::cs_mempool::CsMemPool;

/// Per-node tunables
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct NodeConfig {
    /// Blocks below `head - k_finality` are final
    pub k_finality: u64,
    /// Maximum transactions per produced block
    pub block_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            k_finality: 4,
            block_capacity: 2,
        }
    }
}

/// What `receive_chain` did with a peer chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainUpdate {
    /// Local chain kept (peer invalid, inferior or identical)
    Kept,
    /// Peer chain adopted
    Adopted {
        old_height: Height,
        new_height: Height,
        orphaned: usize,
    },
    /// Peer chain would rewrite finalized history
    RejectedFinality { fork_point: Option<Height> },
}

pub struct CsNode {
    node_id: NodeId,
    balance: u64,
    consensus: Rc<dyn Consensus>,
    config: NodeConfig,
    chain: Vec<Block>,
    // ids of every transaction in `chain`
    chain_txs: HashSet<TxId>,
    mem_pool: CsMemPool,
    ledger: FinalityLedger,
    tx_counter: u64,
    head_changed_at: SimTime,
    event_sink: Box<dyn EventSink>,
}

impl CsNode {
    /// Create a new node with default NoOpSink (zero overhead)
    pub fn new(
        node_id: NodeId,
        balance: u64,
        consensus: Rc<dyn Consensus>,
        config: NodeConfig,
    ) -> Self {
        Self::new_with_sink(node_id, balance, consensus, config, Box::new(NoOpSink))
    }

    /// Create a new node with a custom event sink for debugging/analysis
    pub fn new_with_sink(
        node_id: NodeId,
        balance: u64,
        consensus: Rc<dyn Consensus>,
        config: NodeConfig,
        event_sink: Box<dyn EventSink>,
    ) -> Self {
        Self {
            node_id,
            balance,
            consensus,
            config,
            chain: vec![Block::genesis()],
            chain_txs: HashSet::new(),
            mem_pool: CsMemPool::new(),
            ledger: FinalityLedger::new(config.k_finality),
            tx_counter: 0,
            head_changed_at: 0,
            event_sink,
        }
    }

    pub fn get_node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }

    pub fn get_chain_head(&self) -> &Block {
        // never empty: starts with genesis and is only ever replaced by a valid chain
        &self.chain[self.chain.len() - 1]
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn mempool(&self) -> &CsMemPool {
        &self.mem_pool
    }

    pub fn mempool_len(&self) -> usize {
        self.mem_pool.len()
    }

    pub fn finalized_height(&self) -> Option<Height> {
        self.ledger.finalized_height()
    }

    pub fn finalized_hash(&self, height: Height) -> Option<&[u8; 32]> {
        self.ledger.finalized_hash(height)
    }

    pub fn finality_fault(&self) -> Option<&FinalityError> {
        self.ledger.fault()
    }

    /// Time the head last changed (own block or adopted chain)
    pub fn head_changed_at(&self) -> SimTime {
        self.head_changed_at
    }

    pub fn consensus(&self) -> &dyn Consensus {
        &*self.consensus
    }

    /// Mint a transaction from this node, admit it locally and announce it.
    pub fn create_and_broadcast_transaction(
        &mut self,
        recipient: NodeId,
        amount: u64,
        transport: &mut dyn Transport,
    ) -> Transaction {
        let tx = Transaction {
            id: self.next_tx_id(),
            sender: self.node_id,
            recipient,
            amount,
        };

        self.receive_transaction(tx);
        transport.broadcast(self.node_id, &Message::NewTx { tx });

        tx
    }

    // Blake3(node || counter), first 8 bytes
    fn next_tx_id(&mut self) -> TxId {
        self.tx_counter += 1;

        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.node_id.to_le_bytes());
        hasher.update(&self.tx_counter.to_le_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; 8];
        id.copy_from_slice(&hash.as_bytes()[0..8]);
        TxId::from_le_bytes(id)
    }

    /// Admit `tx` unless it is finalized, already in the chain, or already
    /// pending. Returns true if it was added.
    pub fn receive_transaction(&mut self, tx: Transaction) -> bool {
        if self.ledger.is_finalized(&tx.id) || self.chain_txs.contains(&tx.id) {
            debug!("node {} ignoring settled tx {:x}", self.node_id, tx.id);
            return false;
        }
        self.mem_pool.insert(tx)
    }

    /// Produce one block from the oldest pending transactions, if any.
    ///
    /// On success the block is appended, gossiped as a full chain snapshot and
    /// finality is re-checked.
    pub fn tick(
        &mut self,
        time: SimTime,
        transport: &mut dyn Transport,
    ) -> Result<Option<Block>, FinalityError> {
        if self.mem_pool.is_empty() {
            return Ok(None);
        }

        let transactions = self.mem_pool.oldest(self.config.block_capacity);
        let block = self.consensus.produce_block(
            self.get_chain_head(),
            transactions,
            self.node_id,
            time,
        );

        self.mem_pool.remove_included(&block.transactions);
        self.chain_txs
            .extend(block.transactions.iter().map(|tx| tx.id));
        self.chain.push(block.clone());
        self.head_changed_at = time;

        debug!(
            "t={} node {} mined block {} ({}) nonce {}",
            time,
            self.node_id,
            block.height,
            short_hash(&block.hash),
            block.nonce
        );
        self.event_sink.log(
            time,
            self.node_id,
            Event::BlockMined {
                height: block.height,
                nonce: block.nonce,
                algorithm: self.consensus.algorithm(),
            },
        );

        transport.broadcast(
            self.node_id,
            &Message::GossipChain {
                chain: self.chain.clone(),
            },
        );

        self.check_and_update_finality(time)?;

        Ok(Some(block))
    }

    /// Fork-choice against a peer chain, reorging if the peer wins.
    ///
    /// A reorg whose fork point lies below the finalized height is refused.
    /// Otherwise transactions from the discarded blocks go back to the
    /// mempool unless the new chain already has them or they are finalized.
    pub fn receive_chain(
        &mut self,
        peer_chain: &[Block],
        time: SimTime,
    ) -> Result<ChainUpdate, FinalityError> {
        let choice = self
            .consensus
            .validate_and_resolve_chain(&self.chain, peer_chain);

        let peer_tip = match (choice, peer_chain.last()) {
            (ForkChoice::Peer, Some(tip)) if tip.hash != self.get_chain_head().hash => tip,
            _ => {
                debug!(
                    "node {} keeps its chain (height {}) over peer height {}",
                    self.node_id,
                    self.get_chain_head().height,
                    peer_chain.len().saturating_sub(1)
                );
                return Ok(ChainUpdate::Kept);
            }
        };

        let old_height = self.get_chain_head().height;
        let peer_height = peer_tip.height;
        self.event_sink.log(
            time,
            self.node_id,
            Event::ReorgStart {
                old_height,
                peer_height,
            },
        );

        let agreeing = self
            .chain
            .iter()
            .zip(peer_chain)
            .take_while(|(mine, theirs)| mine.hash == theirs.hash)
            .count();
        let fork_point = (agreeing as Height).checked_sub(1);

        let finalized_height = self.ledger.finalized_height();
        if fork_point < finalized_height {
            warn!(
                "t={} node {} rejects reorg: fork point {:?} below finalized height {:?}",
                time, self.node_id, fork_point, finalized_height
            );
            self.event_sink.log(
                time,
                self.node_id,
                Event::ReorgRejectedFinality {
                    finalized_height,
                    fork_point,
                },
            );
            return Ok(ChainUpdate::RejectedFinality { fork_point });
        }

        let orphaned: Vec<Transaction> = self.chain[agreeing..]
            .iter()
            .flat_map(|block| block.transactions.iter().copied())
            .collect();
        let orphaned_count = orphaned.len();

        self.chain = peer_chain.to_vec();
        self.chain_txs = self
            .chain
            .iter()
            .flat_map(|block| block.transactions.iter().map(|tx| tx.id))
            .collect();
        self.mem_pool
            .rebuild(orphaned, &self.chain_txs, self.ledger.finalized_txs());
        self.head_changed_at = time;

        debug!(
            "t={} node {} reorg complete: height {} -> {} ({}), {} orphaned txs",
            time,
            self.node_id,
            old_height,
            peer_height,
            short_hash(&peer_tip.hash),
            orphaned_count
        );
        self.event_sink.log(
            time,
            self.node_id,
            Event::ReorgComplete {
                old_height,
                new_height: peer_height,
                orphaned: orphaned_count,
            },
        );

        self.check_and_update_finality(time)?;

        Ok(ChainUpdate::Adopted {
            old_height,
            new_height: peer_height,
            orphaned: orphaned_count,
        })
    }

    /// Advance finality to `head - k_finality`.
    ///
    /// A conflict or double spend is fatal: it is logged, emitted as a
    /// `FinalityError` event and returned; the ledger then stays halted.
    pub fn check_and_update_finality(
        &mut self,
        time: SimTime,
    ) -> Result<Option<FinalityAdvance>, FinalityError> {
        match self.ledger.advance(&self.chain) {
            Ok(Some(advance)) => {
                debug!(
                    "t={} node {} finalized chain up to height {}",
                    time, self.node_id, advance.new
                );
                self.event_sink.log(
                    time,
                    self.node_id,
                    Event::FinalityUpdate {
                        previous_final_height: advance.previous,
                        new_final_height: advance.new,
                    },
                );
                Ok(Some(advance))
            }
            Ok(None) => Ok(None),
            Err(FinalityError::Halted(cause)) => Err(FinalityError::Halted(cause)),
            Err(e) => {
                error!("t={} node {} INVARIANT FAIL: {}", time, self.node_id, e);
                self.event_sink.log(
                    time,
                    self.node_id,
                    Event::FinalityError {
                        reason: e.to_string(),
                        height: e.height(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Gossip the current chain without producing a block (resync after a heal)
    pub fn announce_chain(&self, transport: &mut dyn Transport) {
        transport.broadcast(
            self.node_id,
            &Message::GossipChain {
                chain: self.chain.clone(),
            },
        );
    }

    /// Dispatch a delivered network message
    pub fn handle_message(
        &mut self,
        msg: &MessageEnvelope,
        time: SimTime,
    ) -> Result<(), FinalityError> {
        match &msg.message {
            Message::NewTx { tx } => {
                self.receive_transaction(*tx);
            }
            Message::GossipChain { chain } => {
                self.receive_chain(chain, time)?;
            }
        }
        Ok(())
    }
}
