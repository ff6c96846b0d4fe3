//! Node wiring for emberchain.
//!
//! Assembles the pool, consensus engine and sync driver into a running
//! node. Two consensus modes exist: `ibft` runs the full BFT loop on a
//! dedicated thread; `dev` seals blocks at a fixed interval without voting,
//! for one-node integration setups.
//!
//! The chain and executor here are in-memory: persistent storage and the
//! EVM proper are external collaborators, and this crate provides the
//! transfer-level world state that dev mode and the test suites run
//! against.

mod chain;
mod config;
mod dev;
mod node;
mod telemetry;
mod timers;
mod transport;

pub use chain::{InMemoryChain, SimpleExecutor};
pub use config::{ConsensusMode, NodeConfig};
pub use dev::DevSealer;
pub use node::{Node, SyncerAdapter};
pub use telemetry::init_tracing;
pub use timers::{TimerId, TimerManager};
pub use transport::GossipHub;
