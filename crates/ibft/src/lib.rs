//! IBFT consensus engine.
//!
//! This crate implements the Istanbul BFT state machine that drives proposer
//! election, block proposal, prepare/commit voting, locking, and round-change
//! recovery.
//!
//! # Architecture
//!
//! The engine is a synchronous state machine. [`Ibft::run_cycle`] dispatches
//! to one explicit state function per state:
//!
//! - `AcceptState` → proposer builds and broadcasts a proposal; validators
//!   wait for it, verify it, and vote
//! - `ValidateState` → collect prepare and commit votes, lock on prepare
//!   quorum, finalize on commit quorum
//! - `RoundChangeState` → coordinate round advancement after timeouts or
//!   verification errors
//! - `SyncState` → follow the chain through the sync driver until caught up
//!
//! All waiting flows through the [`MessageQueue`] with an explicit deadline,
//! so timeouts and cancellation are testable without a runtime scheduler.
//! I/O happens behind capability traits ([`BlockchainInterface`],
//! [`TxPoolInterface`], [`SyncerInterface`], [`Transport`], [`Transition`])
//! whose test doubles are plain values.

mod engine;
mod mechanism;
mod msg_queue;
mod packer;
mod state;
mod traits;

pub use engine::{Ibft, IbftParams};
pub use mechanism::{
    get_ibft_forks, ConsensusMechanism, ForkError, HookType, IbftFork, Mechanism,
    MechanismError, MechanismParams, MechanismType, PoAMechanism, PoSMechanism,
};
pub use msg_queue::{MessageQueue, WaitOutcome};
pub use packer::{write_transactions, PackOutcome};
pub use state::{ConsensusState, IbftError, IbftState, SharedState};
pub use traits::{
    BlockchainInterface, ChainError, ExecutorFactory, SyncPeer, SyncerInterface, Transition,
    TransitionError, Transport, TransportError, TxPoolInterface,
};
