// track pending transactions, oldest first

use hashbrown::HashSet;
use indexmap::IndexMap;

use crate::cs_interface::{Transaction, TxId};

pub struct CsMemPool {
    // insertion order == age
    pending: IndexMap<TxId, Transaction>,
}

impl CsMemPool {
    pub fn new() -> Self {
        Self {
            pending: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: &TxId) -> bool {
        self.pending.contains_key(id)
    }

    /// Returns false if the transaction is already pending
    pub fn insert(&mut self, tx: Transaction) -> bool {
        if self.pending.contains_key(&tx.id) {
            return false;
        }
        self.pending.insert(tx.id, tx);
        true
    }

    /// Up to `capacity` of the oldest pending transactions
    pub fn oldest(&self, capacity: usize) -> Vec<Transaction> {
        self.pending.values().take(capacity).copied().collect()
    }

    /// Drop transactions that made it into a block, keeping the order of the rest
    pub fn remove_included(&mut self, included: &[Transaction]) {
        for tx in included {
            self.pending.shift_remove(&tx.id);
        }
    }

    /// After a reorg: `(pending ∪ orphaned) − in_chain − finalized`.
    ///
    /// Previously pending transactions keep their age; orphaned ones queue
    /// behind them in chain order.
    pub fn rebuild(
        &mut self,
        orphaned: Vec<Transaction>,
        in_chain: &HashSet<TxId>,
        finalized: &HashSet<TxId>,
    ) {
        for tx in orphaned {
            self.insert(tx);
        }
        self.pending
            .retain(|id, _| !in_chain.contains(id) && !finalized.contains(id));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.pending.values()
    }
}

impl Default for CsMemPool {
    fn default() -> Self {
        Self::new()
    }
}
