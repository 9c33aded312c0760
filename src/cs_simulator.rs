// Simulation Runner

use std::cell::Ref;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::cs_consensus::{Consensus, HybridStakePoW, ProofOfWork, Stake};
use crate::cs_event_sinks::{
    CollectorEventSink, EventTypeCounts, LoggingEventSink, MultiEventSink, SharedSink,
};
use crate::cs_finality::FinalityError;
use crate::cs_interface::{hash_hex, BlockHash, Height, NodeId, SimTime};
use crate::cs_network::Network;
use crate::cs_node::CsNode;
use crate::cs_sim_config::{ConsensusConfig, ScheduledAction, ScheduledEvent, SimConfig};

/// Per-node state at the end of a run
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSummary {
    pub node: NodeId,
    pub balance: u64,
    pub height: Height,
    pub head_hash: BlockHash,
    pub finalized_height: Option<Height>,
    pub mempool_len: usize,
}

/// Outcome of a simulation run
#[derive(Debug, Clone)]
pub struct SimResult {
    pub seed_used: [u8; 32],
    pub end_time: SimTime,
    pub nodes: Vec<NodeSummary>,
    /// Number of different head hashes across all nodes; 1 means consensus
    pub distinct_heads: usize,
    pub transactions_created: usize,
    pub messages_delivered: usize,
    pub events: EventTypeCounts,
    /// First fatal finality failure per node
    pub faults: Vec<(NodeId, String)>,
}

impl SimResult {
    pub fn consensus_reached(&self) -> bool {
        self.distinct_heads == 1
    }
}

impl fmt::Display for SimResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Simulation finished at {}ms ---", self.end_time)?;
        for node in &self.nodes {
            let finalized = match node.finalized_height {
                Some(h) => h.to_string(),
                None => "-".to_string(),
            };
            writeln!(
                f,
                "  - Node N{}: height={} final={} mempool={} head={}...",
                node.node,
                node.height,
                finalized,
                node.mempool_len,
                &hash_hex(&node.head_hash)[..15]
            )?;
        }

        writeln!(f, "--- Consensus check ---")?;
        if self.consensus_reached() {
            writeln!(
                f,
                "Consensus reached: all {} nodes agree on the same chain head.",
                self.nodes.len()
            )?;
        } else {
            writeln!(f, "Consensus failed: {} different chain heads.", self.distinct_heads)?;
            let mut heads: BTreeMap<BlockHash, usize> = BTreeMap::new();
            for node in &self.nodes {
                *heads.entry(node.head_hash).or_insert(0) += 1;
            }
            for (hash, count) in heads {
                writeln!(
                    f,
                    "  - Hash {}... is the head for {} node(s).",
                    &hash_hex(&hash)[..15],
                    count
                )?;
            }
        }

        writeln!(
            f,
            "txs={} messages={} mined={} reorgs={} rejected_reorgs={} finality_updates={}",
            self.transactions_created,
            self.messages_delivered,
            self.events.block_mined,
            self.events.reorg_complete,
            self.events.reorg_rejected_finality,
            self.events.finality_update
        )?;
        for (node, reason) in &self.faults {
            writeln!(f, "  !! N{} finality halted: {}", node, reason)?;
        }
        writeln!(f, "seed: {}", hex_seed(&self.seed_used))
    }
}

pub fn hex_seed(seed: &[u8; 32]) -> String {
    seed.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Simulation runner that executes the chain simulation
pub struct SimRunner {
    config: SimConfig,
    rng: StdRng,
    seed_used: [u8; 32],
    network: Network,
    nodes: BTreeMap<NodeId, CsNode>,
    node_ids: Vec<NodeId>,
    stakes: Vec<Stake>,
    schedule: VecDeque<ScheduledEvent>,
    events: SharedSink<CollectorEventSink>,
    faults: BTreeMap<NodeId, FinalityError>,

    /// Time of the next tick
    time: SimTime,
    tick_count: u64,
    transactions_created: usize,
    messages_delivered: usize,
}

impl SimRunner {
    /// Create a new simulation runner with the given configuration
    pub fn new(config: SimConfig) -> Self {
        let seed = config.seed.unwrap_or_else(|| {
            let mut seed = [0u8; 32];
            rand::thread_rng().fill(&mut seed);
            seed
        });

        let mut rng = StdRng::from_seed(seed);
        let network = Network::new(config.network_config(), StdRng::from_seed(rng.gen()));

        let consensus: Rc<dyn Consensus> = match config.consensus {
            ConsensusConfig::ProofOfWork { difficulty } => Rc::new(ProofOfWork::new(difficulty)),
            ConsensusConfig::Hybrid {
                light_difficulty, ..
            } => Rc::new(HybridStakePoW::new(light_difficulty)),
        };

        let events = SharedSink::new(CollectorEventSink::new());
        let node_ids: Vec<NodeId> = (0..config.num_nodes as NodeId).collect();

        let mut runner = Self {
            stakes: node_ids
                .iter()
                .map(|id| Stake {
                    node: *id,
                    balance: config.balances.balance_of(*id),
                })
                .collect(),
            schedule: Self::sorted_schedule(&config.schedule),
            config,
            rng,
            seed_used: seed,
            network,
            nodes: BTreeMap::new(),
            node_ids,
            events,
            faults: BTreeMap::new(),
            time: 0,
            tick_count: 0,
            transactions_created: 0,
            messages_delivered: 0,
        };

        for stake in runner.stakes.clone() {
            let mut sink = MultiEventSink::new();
            sink.add_sink(Box::new(runner.events.clone()));
            sink.add_sink(Box::new(LoggingEventSink::new(
                runner.config.enable_event_logging,
            )));

            let node = CsNode::new_with_sink(
                stake.node,
                stake.balance,
                consensus.clone(),
                runner.config.node_config(),
                Box::new(sink),
            );
            runner.network.add_node(stake.node);
            runner.nodes.insert(stake.node, node);
        }

        info!(
            "created {} nodes running {} (seed {})",
            runner.nodes.len(),
            consensus.algorithm(),
            hex_seed(&seed)
        );

        runner
    }

    fn sorted_schedule(schedule: &[ScheduledEvent]) -> VecDeque<ScheduledEvent> {
        let mut sorted = schedule.to_vec();
        // stable: same-time events keep their file order
        sorted.sort_by_key(|e| e.at_ms);
        sorted.into()
    }

    /// Run main and settle phases to completion, deliver everything still in
    /// flight, and return results. Continues from wherever `run_until` stopped.
    pub fn run(&mut self) -> SimResult {
        let end = self.config.duration_ms + self.config.settle_ms;
        self.run_until(end);
        self.drain();

        self.build_result()
    }

    /// Process every tick with time `< end`
    pub fn run_until(&mut self, end: SimTime) {
        while self.time < end {
            self.step(self.time);
            self.time += self.tick_ms();
        }
    }

    fn tick_ms(&self) -> SimTime {
        self.config.tick_ms.max(1)
    }

    fn step(&mut self, t: SimTime) {
        // 1. Scheduled network events
        while self.schedule.front().map_or(false, |e| e.at_ms <= t) {
            if let Some(event) = self.schedule.pop_front() {
                self.apply_scheduled(event.action);
            }
        }

        // 2. Advance the clock; due messages wait until the new transaction is out
        let delivered = self.network.tick(t - self.network.time());

        // 3. Random transactions to keep the network busy
        if self.injecting_at(t) {
            self.inject_transaction();
        }

        // 4. Process message delivery
        self.messages_delivered += delivered.len();
        for envelope in &delivered {
            if let Some(node) = self.nodes.get_mut(&envelope.receiver) {
                let result = node.handle_message(envelope, t);
                self.record_fault(envelope.receiver, result);
            }
        }

        // 5. Trigger node actions (block production)
        match self.config.consensus {
            ConsensusConfig::ProofOfWork { .. } => self.pow_step(t),
            ConsensusConfig::Hybrid {
                leader_timeout_ms, ..
            } => self.hybrid_step(t, leader_timeout_ms),
        }

        self.tick_count += 1;
    }

    fn injecting_at(&self, t: SimTime) -> bool {
        let txs = &self.config.transactions;
        t > 0
            && t < self.config.duration_ms
            && txs.interval_ms > 0
            && t % txs.interval_ms == 0
            && txs.stop_at_ms.map_or(true, |stop| t <= stop)
    }

    fn inject_transaction(&mut self) {
        if self.node_ids.len() < 2 {
            return;
        }

        let sender = self.node_ids[self.rng.gen_range(0..self.node_ids.len())];
        let others: Vec<NodeId> = self
            .node_ids
            .iter()
            .copied()
            .filter(|n| *n != sender)
            .collect();
        let recipient = match others.choose(&mut self.rng) {
            Some(r) => *r,
            None => return,
        };

        let txs = &self.config.transactions;
        let (low, high) = (
            txs.amount_min.min(txs.amount_max),
            txs.amount_min.max(txs.amount_max),
        );
        let amount = self.rng.gen_range(low..=high);

        if let Some(node) = self.nodes.get_mut(&sender) {
            let tx = node.create_and_broadcast_transaction(recipient, amount, &mut self.network);
            debug!(
                "t={} tx {:x}: N{} -> N{} amount {}",
                self.time, tx.id, sender, recipient, amount
            );
            self.transactions_created += 1;
        }
    }

    // One uniformly random miner per tick
    fn pow_step(&mut self, t: SimTime) {
        let miner = match self.node_ids.choose(&mut self.rng) {
            Some(m) => *m,
            None => return,
        };
        if let Some(node) = self.nodes.get_mut(&miner) {
            let result = node.tick(t, &mut self.network);
            self.record_fault(miner, result);
        }
    }

    /// One candidate per tick, round-robin. It produces a block only if it is
    /// the elected leader for its own head and attempt; the attempt grows by
    /// one for every `leader_timeout_ms` its head has not moved.
    fn hybrid_step(&mut self, t: SimTime, leader_timeout_ms: SimTime) {
        if self.node_ids.is_empty() {
            return;
        }
        let candidate = self.node_ids[(self.tick_count % self.node_ids.len() as u64) as usize];

        let node = match self.nodes.get_mut(&candidate) {
            Some(node) => node,
            None => return,
        };

        let waited = t.saturating_sub(node.head_changed_at());
        let attempt = waited / leader_timeout_ms.max(1);
        let head = node.get_chain_head();

        let leader = HybridStakePoW::get_leader(&head.hash, &self.stakes, attempt);
        if leader != Some(candidate) {
            return;
        }
        if attempt > 0 {
            debug!(
                "t={} backup leader for height {}: attempt {} elects N{}",
                t,
                head.height + 1,
                attempt,
                candidate
            );
        }

        let result = node.tick(t, &mut self.network);
        self.record_fault(candidate, result);
    }

    fn apply_scheduled(&mut self, action: ScheduledAction) {
        match action {
            ScheduledAction::Partition { groups } => self.network.partition(&groups),
            ScheduledAction::Heal => {
                self.network.heal();
                // both sides announce their chains so fork-choice can settle
                for node in self.nodes.values() {
                    node.announce_chain(&mut self.network);
                }
            }
        }
    }

    fn record_fault<T>(&mut self, node: NodeId, result: Result<T, FinalityError>) {
        match result {
            Ok(_) | Err(FinalityError::Halted(_)) => {}
            Err(e) => {
                warn!("N{} stopped finalizing: {}", node, e);
                self.faults.entry(node).or_insert(e);
            }
        }
    }

    /// Deliver everything still in flight without producing new blocks
    fn drain(&mut self) {
        while self.network.in_flight() > 0 {
            let t = self.time;
            let delivered = self.network.tick(t - self.network.time());
            self.messages_delivered += delivered.len();
            for envelope in &delivered {
                if let Some(node) = self.nodes.get_mut(&envelope.receiver) {
                    let result = node.handle_message(envelope, t);
                    self.record_fault(envelope.receiver, result);
                }
            }
            self.time += self.tick_ms();
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn seed_used(&self) -> [u8; 32] {
        self.seed_used
    }

    pub fn time(&self) -> SimTime {
        self.time
    }

    pub fn node(&self, id: NodeId) -> Option<&CsNode> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &CsNode> {
        self.nodes.values()
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn events(&self) -> Ref<'_, CollectorEventSink> {
        self.events.borrow()
    }

    pub fn export_events_csv(&self, path: &str) -> std::io::Result<()> {
        self.events.borrow().export_to_csv(path)
    }

    fn build_result(&self) -> SimResult {
        let nodes: Vec<NodeSummary> = self
            .nodes
            .values()
            .map(|node| {
                let head = node.get_chain_head();
                NodeSummary {
                    node: node.get_node_id(),
                    balance: node.balance(),
                    height: head.height,
                    head_hash: head.hash,
                    finalized_height: node.finalized_height(),
                    mempool_len: node.mempool_len(),
                }
            })
            .collect();

        let distinct_heads = nodes
            .iter()
            .map(|n| n.head_hash)
            .collect::<BTreeSet<_>>()
            .len();

        SimResult {
            seed_used: self.seed_used,
            end_time: self.time,
            nodes,
            distinct_heads,
            transactions_created: self.transactions_created,
            messages_delivered: self.messages_delivered,
            events: self.events.borrow().count_by_type(),
            faults: self
                .faults
                .iter()
                .map(|(node, e)| (*node, e.to_string()))
                .collect(),
        }
    }
}
