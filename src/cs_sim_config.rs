// Simulation Configuration

use std::collections::BTreeMap;

use crate::cs_interface::{NodeId, SimTime};
use crate::cs_network::NetworkConfig;
use crate::cs_node::NodeConfig;

/// Main simulation configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub num_nodes: usize,
    pub balances: BalanceConfig,
    pub latency_min_ms: SimTime,
    pub latency_max_ms: SimTime,
    /// Simulated time per tick
    pub tick_ms: SimTime,
    /// Length of the main phase (transactions, schedule, mining)
    pub duration_ms: SimTime,
    /// Quiet phase after the main phase: no new transactions, mining continues
    pub settle_ms: SimTime,
    /// Random seed for reproducibility (set from the command line, not YAML)
    #[serde(skip)]
    pub seed: Option<[u8; 32]>,
    pub consensus: ConsensusConfig,
    pub k_finality: u64,
    pub block_capacity: usize,
    pub transactions: TransactionConfig,
    pub schedule: Vec<ScheduledEvent>,
    /// Forward node events to the log
    pub enable_event_logging: bool,
    pub csv_output_path: Option<String>,
}

/// Stake / balance assignment
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub starting_balance: u64,
    pub overrides: BTreeMap<NodeId, u64>,
}

impl BalanceConfig {
    pub fn balance_of(&self, node: NodeId) -> u64 {
        self.overrides
            .get(&node)
            .copied()
            .unwrap_or(self.starting_balance)
    }
}

/// Which consensus strategy every node shares
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ConsensusConfig {
    /// One uniformly random miner per tick, full difficulty
    ProofOfWork { difficulty: u32 },
    /// Stake-elected leader, light difficulty. The leader attempt moves on
    /// every `leader_timeout_ms` without a head change.
    Hybrid {
        light_difficulty: u32,
        leader_timeout_ms: SimTime,
    },
}

/// Transaction generation configuration
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// One transaction every `interval_ms` (never at t = 0)
    pub interval_ms: SimTime,
    pub amount_min: u64,
    pub amount_max: u64,
    /// Last injection time; `None` injects for the whole main phase
    pub stop_at_ms: Option<SimTime>,
}

/// A network event at a fixed simulation time
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct ScheduledEvent {
    pub at_ms: SimTime,
    pub action: ScheduledAction,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ScheduledAction {
    Partition { groups: Vec<Vec<NodeId>> },
    Heal,
}

impl SimConfig {
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            latency_min: self.latency_min_ms,
            latency_max: self.latency_max_ms,
        }
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            k_finality: self.k_finality,
            block_capacity: self.block_capacity,
        }
    }

    /// Five PoW miners on a healthy network
    pub fn pow_scenario() -> Self {
        Self::default()
    }

    /// Five hybrid nodes split {N0,N1} / {N2,N3,N4} from 1s to 5s.
    ///
    /// `k_finality` is deep enough that the branch built by either side
    /// during the split is never finalized before the heal.
    pub fn partition_scenario() -> Self {
        Self {
            balances: BalanceConfig {
                starting_balance: 100,
                overrides: [(0, 200)].into_iter().collect(),
            },
            duration_ms: 9_000,
            consensus: ConsensusConfig::Hybrid {
                light_difficulty: 2,
                leader_timeout_ms: 1_000,
            },
            k_finality: 24,
            transactions: TransactionConfig {
                interval_ms: 300,
                stop_at_ms: Some(8_000),
                ..TransactionConfig::default()
            },
            schedule: vec![
                ScheduledEvent {
                    at_ms: 1_000,
                    action: ScheduledAction::Partition {
                        groups: vec![vec![0, 1], vec![2, 3, 4]],
                    },
                },
                ScheduledEvent {
                    at_ms: 5_000,
                    action: ScheduledAction::Heal,
                },
            ],
            ..Self::default()
        }
    }
}

// ============================================================================
// Default Configurations
// ============================================================================

impl Default for SimConfig {
    fn default() -> Self {
        let network = NetworkConfig::default();
        let node = NodeConfig::default();
        Self {
            num_nodes: 5,
            balances: BalanceConfig::default(),
            latency_min_ms: network.latency_min,
            latency_max_ms: network.latency_max,
            tick_ms: 10,
            duration_ms: 5_000,
            settle_ms: 3_000,
            seed: None,
            consensus: ConsensusConfig::default(),
            k_finality: node.k_finality,
            block_capacity: node.block_capacity,
            transactions: TransactionConfig::default(),
            schedule: Vec::new(),
            enable_event_logging: false,
            csv_output_path: None,
        }
    }
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            starting_balance: 100,
            overrides: BTreeMap::new(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig::ProofOfWork { difficulty: 3 }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            amount_min: 1,
            amount_max: 5,
            stop_at_ms: None,
        }
    }
}
