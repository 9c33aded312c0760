//! # chainsim - discrete-event blockchain simulation
//!
//! A small network of nodes, each holding its own chain, mempool and finality
//! ledger, exchanging transactions and full-chain gossip over a simulated
//! network with random latency, partitions and heals. Two interchangeable
//! consensus strategies decide how blocks are produced and which fork wins:
//! plain proof of work, and a hybrid where a stake-weighted leader (computed
//! locally from the chain head) produces light proof-of-work blocks.
//!
//! ## Core Components
//!
//! - **Network**: time-ordered message queue with per-message latency and partitions
//! - **Consensus**: chain validation, fork-choice, block production, leader election
//! - **CsNode**: chain + mempool + finality, reorgs bounded by finalized history
//! - **SimRunner**: the scheduler loop driving everything from one seeded RNG
//!
//! ```no_run
//! use cs_rust::{SimConfig, SimRunner};
//!
//! let mut config = SimConfig::partition_scenario();
//! config.seed = Some([7u8; 32]);
//!
//! let result = SimRunner::new(config).run();
//! println!("{}", result);
//! ```
//!
//! Nodes never own the network: every operation that sends takes a
//! `&mut dyn Transport`, which the `Network` implements. Structured events go
//! to an `EventSink` (see `cs_event_sinks`).

pub mod cs_block;
pub mod cs_consensus;
pub mod cs_event_sinks;
pub mod cs_finality;
pub mod cs_interface;
pub mod cs_mempool;
pub mod cs_network;
pub mod cs_node;
pub mod cs_sim_config;
pub mod cs_simulator;

// Re-export commonly used types
pub use cs_block::Block;
pub use cs_consensus::{Consensus, ForkChoice, HybridStakePoW, ProofOfWork, Stake};
pub use cs_finality::FinalityError;
pub use cs_interface::{
    BlockHash, Event, EventSink, Height, Message, MessageEnvelope, NodeId, NoOpSink, SimTime,
    Transaction, Transport, TxId,
};
pub use cs_network::{Network, NetworkConfig};
pub use cs_node::{ChainUpdate, CsNode, NodeConfig};
pub use cs_sim_config::{ConsensusConfig, SimConfig};
pub use cs_simulator::{SimResult, SimRunner};
