//! Discrete-event message delivery
//!
//! Messages are value-copied at send time and queued by `(deliver_at, sequence)`,
//! where `deliver_at = now + latency` with the latency drawn uniformly from the
//! inclusive `[latency_min, latency_max]` range. The sequence number makes
//! same-time deliveries FIFO.
//!
//! Partitions only gate *new* sends. Messages already queued when `partition` or
//! `heal` is called are delivered to their original recipient unchanged.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap};

use log::info;
use rand::rngs::StdRng;
use rand::Rng;

use crate::cs_interface::{Message, MessageEnvelope, NodeId, SimTime, Transport};

/// Network behaviour configuration
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct NetworkConfig {
    pub latency_min: SimTime,
    pub latency_max: SimTime,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency_min: 50,
            latency_max: 200,
        }
    }
}

struct QueuedMessage {
    deliver_at: SimTime,
    sequence: u64,
    envelope: MessageEnvelope,
}

impl QueuedMessage {
    fn key(&self) -> (SimTime, u64) {
        (self.deliver_at, self.sequence)
    }
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

pub struct Network {
    config: NetworkConfig,
    rng: StdRng,
    nodes: BTreeSet<NodeId>,
    queue: BinaryHeap<Reverse<QueuedMessage>>,
    time: SimTime,
    sequence: u64,
    partition: Option<Vec<BTreeSet<NodeId>>>,
}

impl Network {
    pub fn new(config: NetworkConfig, rng: StdRng) -> Self {
        Self {
            config,
            rng,
            nodes: BTreeSet::new(),
            queue: BinaryHeap::new(),
            time: 0,
            sequence: 0,
            partition: None,
        }
    }

    pub fn add_node(&mut self, node: NodeId) {
        self.nodes.insert(node);
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }

    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Messages sent but not yet delivered
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    pub fn is_partitioned(&self) -> bool {
        self.partition.is_some()
    }

    /// Split the network into isolated groups of node ids.
    ///
    /// Groups are expected to be disjoint; a node listed twice belongs to the
    /// first group naming it. Nodes not listed anywhere stay reachable by all.
    pub fn partition(&mut self, groups: &[Vec<NodeId>]) {
        let groups: Vec<BTreeSet<NodeId>> = groups
            .iter()
            .map(|g| g.iter().copied().collect())
            .collect();

        info!("t={} network partitioned: {:?}", self.time, groups);
        self.partition = Some(groups);
    }

    pub fn heal(&mut self) {
        info!("t={} network healed", self.time);
        self.partition = None;
    }

    /// Can a message sent now from `sender` reach `recipient`?
    pub fn reachable(&self, sender: &NodeId, recipient: &NodeId) -> bool {
        match &self.partition {
            None => true,
            Some(groups) => match groups.iter().find(|g| g.contains(sender)) {
                // unlisted sender: no partition applies to it
                None => true,
                Some(group) => group.contains(recipient),
            },
        }
    }

    /// Advance the clock by `elapsed` and return every message now due, in
    /// `(deliver_at, sequence)` order.
    pub fn tick(&mut self, elapsed: SimTime) -> Vec<MessageEnvelope> {
        self.time += elapsed;

        let mut delivered = Vec::new();
        while let Some(Reverse(next)) = self.queue.peek() {
            if next.deliver_at > self.time {
                break;
            }
            if let Some(Reverse(queued)) = self.queue.pop() {
                delivered.push(queued.envelope);
            }
        }

        delivered
    }

    fn sample_latency(&mut self) -> SimTime {
        let low = self.config.latency_min.min(self.config.latency_max);
        let high = self.config.latency_min.max(self.config.latency_max);
        self.rng.gen_range(low..=high)
    }

    fn enqueue(&mut self, sender: NodeId, receiver: NodeId, message: Message) {
        let deliver_at = self.time + self.sample_latency();
        let sequence = self.sequence;
        self.sequence += 1;

        self.queue.push(Reverse(QueuedMessage {
            deliver_at,
            sequence,
            envelope: MessageEnvelope {
                sender,
                receiver,
                time: self.time,
                deliver_at,
                message,
            },
        }));
    }
}

impl Transport for Network {
    fn broadcast(&mut self, sender: NodeId, message: &Message) {
        let recipients: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| **n != sender && self.reachable(&sender, n))
            .copied()
            .collect();

        for receiver in recipients {
            self.enqueue(sender, receiver, message.clone());
        }
    }

    fn send_direct(&mut self, sender: NodeId, recipient: NodeId, message: &Message) {
        // unknown or unreachable recipient: silently dropped
        if self.nodes.contains(&recipient) && self.reachable(&sender, &recipient) {
            self.enqueue(sender, recipient, message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cs_interface::Transaction;
    use rand::SeedableRng;

    fn network(min: SimTime, max: SimTime, nodes: &[NodeId]) -> Network {
        let mut net = Network::new(
            NetworkConfig {
                latency_min: min,
                latency_max: max,
            },
            StdRng::from_seed([7u8; 32]),
        );
        for n in nodes {
            net.add_node(*n);
        }
        net
    }

    fn tx_msg(id: u64) -> Message {
        Message::NewTx {
            tx: Transaction {
                id,
                sender: 0,
                recipient: 1,
                amount: 1,
            },
        }
    }

    fn tx_id(envelope: &MessageEnvelope) -> u64 {
        match &envelope.message {
            Message::NewTx { tx } => tx.id,
            _ => panic!("unexpected message"),
        }
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let mut net = network(10, 10, &[0, 1, 2]);
        net.broadcast(0, &tx_msg(1));

        let delivered = net.tick(10);
        let receivers: Vec<NodeId> = delivered.iter().map(|m| m.receiver).collect();
        assert_eq!(receivers, vec![1, 2]);
        assert!(delivered.iter().all(|m| m.sender == 0));
    }

    #[test]
    fn test_latency_within_bounds_and_not_early() {
        let mut net = network(50, 200, &[0, 1, 2, 3]);
        for i in 0..20 {
            net.broadcast(0, &tx_msg(i));
        }
        assert_eq!(net.in_flight(), 60);

        assert!(net.tick(49).is_empty(), "nothing may arrive before latency_min");

        let mut delivered = Vec::new();
        for _ in 0..151 {
            delivered.extend(net.tick(1));
        }
        assert_eq!(delivered.len(), 60, "everything arrives by latency_max");
        for m in &delivered {
            let latency = m.deliver_at - m.time;
            assert!((50..=200).contains(&latency));
        }
        assert_eq!(net.in_flight(), 0);
    }

    #[test]
    fn test_delivery_ordered_by_time_then_sequence() {
        let mut net = network(1, 100, &[0, 1]);
        for i in 0..50 {
            net.send_direct(0, 1, &tx_msg(i));
        }

        let delivered = net.tick(100);
        assert_eq!(delivered.len(), 50);
        for pair in delivered.windows(2) {
            assert!(pair[0].deliver_at <= pair[1].deliver_at);
            if pair[0].deliver_at == pair[1].deliver_at {
                assert!(tx_id(&pair[0]) < tx_id(&pair[1]), "same-time delivery must be FIFO");
            }
        }
    }

    #[test]
    fn test_same_time_messages_are_fifo() {
        let mut net = network(20, 20, &[0, 1]);
        for i in 0..5 {
            net.send_direct(0, 1, &tx_msg(i));
        }

        let ids: Vec<u64> = net.tick(20).iter().map(tx_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_send_direct_unknown_recipient_is_noop() {
        let mut net = network(10, 10, &[0, 1]);
        net.send_direct(0, 99, &tx_msg(1));
        assert_eq!(net.in_flight(), 0);
        assert!(net.tick(100).is_empty());
    }

    #[test]
    fn test_partition_isolates_groups() {
        let mut net = network(10, 10, &[0, 1, 2, 3, 4]);
        net.partition(&[vec![0, 1], vec![2, 3, 4]]);

        net.broadcast(0, &tx_msg(1));
        net.broadcast(3, &tx_msg(2));
        net.send_direct(1, 2, &tx_msg(3));

        let delivered = net.tick(10);
        for m in &delivered {
            let same_side = (m.sender <= 1) == (m.receiver <= 1);
            assert!(same_side, "{} -> {} crossed the partition", m.sender, m.receiver);
        }
        assert_eq!(delivered.len(), 1 + 2);
    }

    #[test]
    fn test_unlisted_sender_reaches_everyone() {
        let mut net = network(10, 10, &[0, 1, 2, 3, 4]);
        net.partition(&[vec![0, 1], vec![2, 3]]);

        assert!(net.reachable(&4, &0));
        assert!(net.reachable(&4, &2));
        // listed sender cannot reach the unlisted node
        assert!(!net.reachable(&0, &4));

        net.broadcast(4, &tx_msg(1));
        assert_eq!(net.tick(10).len(), 4);
    }

    #[test]
    fn test_heal_restores_cross_group_delivery() {
        let mut net = network(10, 10, &[0, 1, 2]);
        net.partition(&[vec![0], vec![1, 2]]);
        net.broadcast(0, &tx_msg(1));
        assert!(net.tick(10).is_empty());

        net.heal();
        assert!(!net.is_partitioned());
        net.broadcast(0, &tx_msg(2));
        assert_eq!(net.tick(10).len(), 2);
    }

    #[test]
    fn test_queued_messages_survive_partition() {
        let mut net = network(100, 100, &[0, 1, 2]);
        net.broadcast(0, &tx_msg(1));

        // partition declared while the messages are in flight
        net.partition(&[vec![0], vec![1, 2]]);
        let delivered = net.tick(100);
        assert_eq!(delivered.len(), 2, "already queued messages are not dropped");
        assert_eq!(delivered[0].receiver, 1);
        assert_eq!(delivered[1].receiver, 2);
    }

    #[test]
    fn test_heal_does_not_release_dropped_sends() {
        let mut net = network(100, 100, &[0, 1]);
        net.partition(&[vec![0], vec![1]]);
        net.broadcast(0, &tx_msg(1));

        net.heal();
        assert!(net.tick(500).is_empty(), "sends refused under partition stay refused");
    }

    #[test]
    fn test_message_is_copied_at_send() {
        let mut net = network(10, 10, &[0, 1]);
        let mut message = tx_msg(1);
        net.send_direct(0, 1, &message);

        if let Message::NewTx { tx } = &mut message {
            tx.amount = 999;
        }

        let delivered = net.tick(10);
        match &delivered[0].message {
            Message::NewTx { tx } => assert_eq!(tx.amount, 1),
            _ => panic!("unexpected message"),
        }
    }

    #[test]
    fn test_same_seed_same_schedule() {
        let run = || {
            let mut net = network(50, 200, &[0, 1, 2, 3]);
            for i in 0..10 {
                net.broadcast(i % 4, &tx_msg(i));
            }
            net.tick(200)
                .iter()
                .map(|m| (m.receiver, m.deliver_at, tx_id(m)))
                .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }
}
