//! Finality ledger
//!
//! Heights at or below `finalized_height` are permanent for a node. The ledger
//! records the finalized hash per height and every finalized transaction id;
//! a conflicting hash or a transaction finalized twice is a fatal invariant
//! violation. The first violation latches: the ledger never advances again.

use std::collections::BTreeMap;
use std::fmt;

use hashbrown::HashSet;

use crate::cs_block::Block;
use crate::cs_interface::{short_hash, BlockHash, Height, TxId};

/// Fatal finality failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalityError {
    /// Height already finalized with a different hash
    Conflict {
        height: Height,
        recorded: BlockHash,
        found: BlockHash,
    },
    /// Transaction id already finalized in an earlier block
    DoubleSpend { height: Height, tx: TxId },
    /// An earlier failure stopped finality for this node
    Halted(Box<FinalityError>),
}

impl FinalityError {
    pub fn height(&self) -> Height {
        match self {
            FinalityError::Conflict { height, .. } => *height,
            FinalityError::DoubleSpend { height, .. } => *height,
            FinalityError::Halted(cause) => cause.height(),
        }
    }
}

impl fmt::Display for FinalityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalityError::Conflict {
                height,
                recorded,
                found,
            } => write!(
                f,
                "finality conflict at height {}: recorded {} but chain has {}",
                height,
                short_hash(recorded),
                short_hash(found)
            ),
            FinalityError::DoubleSpend { height, tx } => write!(
                f,
                "double spend of tx {:x} in finalized block {}",
                tx, height
            ),
            FinalityError::Halted(cause) => write!(f, "finality halted: {}", cause),
        }
    }
}

impl std::error::Error for FinalityError {}

/// A successful advance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalityAdvance {
    pub previous: Option<Height>,
    pub new: Height,
}

pub struct FinalityLedger {
    k_finality: u64,
    /// `None` until the first height is finalized
    finalized_height: Option<Height>,
    finalized_blocks: BTreeMap<Height, BlockHash>,
    finalized_txs: HashSet<TxId>,
    fault: Option<FinalityError>,
}

impl FinalityLedger {
    pub fn new(k_finality: u64) -> Self {
        Self {
            k_finality,
            finalized_height: None,
            finalized_blocks: BTreeMap::new(),
            finalized_txs: HashSet::new(),
            fault: None,
        }
    }

    pub fn finalized_height(&self) -> Option<Height> {
        self.finalized_height
    }

    pub fn finalized_hash(&self, height: Height) -> Option<&BlockHash> {
        self.finalized_blocks.get(&height)
    }

    pub fn finalized_txs(&self) -> &HashSet<TxId> {
        &self.finalized_txs
    }

    pub fn is_finalized(&self, tx: &TxId) -> bool {
        self.finalized_txs.contains(tx)
    }

    pub fn fault(&self) -> Option<&FinalityError> {
        self.fault.as_ref()
    }

    /// Finalize everything at least `k_finality` blocks below the head.
    ///
    /// `Ok(None)` when nothing new is final. On error nothing past the failing
    /// height is recorded and `finalized_height` stays where it was.
    pub fn advance(&mut self, chain: &[Block]) -> Result<Option<FinalityAdvance>, FinalityError> {
        if let Some(fault) = &self.fault {
            return Err(FinalityError::Halted(Box::new(fault.clone())));
        }

        if chain.is_empty() {
            return Ok(None);
        }
        // chain[h].height == h for any valid chain
        let head_height = (chain.len() - 1) as Height;

        let new_final = match head_height.checked_sub(self.k_finality) {
            Some(h) => h,
            None => return Ok(None),
        };
        if Some(new_final) <= self.finalized_height {
            return Ok(None);
        }

        let start = self.finalized_height.map_or(0, |h| h + 1);
        for height in start..=new_final {
            let block = &chain[height as usize];

            if let Some(recorded) = self.finalized_blocks.get(&height) {
                if *recorded != block.hash {
                    return Err(self.latch(FinalityError::Conflict {
                        height,
                        recorded: *recorded,
                        found: block.hash,
                    }));
                }
            }

            for tx in &block.transactions {
                if !self.finalized_txs.insert(tx.id) {
                    return Err(self.latch(FinalityError::DoubleSpend { height, tx: tx.id }));
                }
            }

            self.finalized_blocks.insert(height, block.hash);
        }

        let previous = self.finalized_height;
        self.finalized_height = Some(new_final);

        Ok(Some(FinalityAdvance {
            previous,
            new: new_final,
        }))
    }

    fn latch(&mut self, error: FinalityError) -> FinalityError {
        self.fault = Some(error.clone());
        error
    }

    #[cfg(test)]
    pub(crate) fn record_for_test(&mut self, height: Height, hash: BlockHash) {
        self.finalized_blocks.insert(height, hash);
    }
}
