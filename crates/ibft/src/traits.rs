//! Capability interfaces the engine is constructed with.
//!
//! The blockchain, pool, syncer, transport, and executor are runtime
//! collaborators injected at construction. Test doubles implement the same
//! traits as plain values; there are no back-pointers between the engine and
//! its collaborators.

use ember_messages::ConsensusMessage;
use ember_txpool::TxPool;
use ember_types::{Address, Block, Header, Transaction, ValidatorSet};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the blockchain collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// A candidate block failed verification.
    #[error("block verification failed: {0}")]
    Verification(String),
    /// Writing a finalized block failed.
    #[error("block write failed: {0}")]
    WriteFailed(String),
    /// The requested header does not exist.
    #[error("unknown block {0}")]
    UnknownBlock(u64),
}

/// Read and write access to the canonical chain.
pub trait BlockchainInterface: Send + Sync {
    /// The current head header.
    fn header(&self) -> Header;

    /// A header by number.
    fn get_header_by_number(&self, number: u64) -> Option<Header>;

    /// Write a finalized block to the chain. Serialized through a single
    /// writer by the implementation.
    fn write_block(&self, block: &Block) -> Result<(), ChainError>;

    /// Verify a candidate block against the current chain state without
    /// committing anything.
    fn verify_potential_block(&self, block: &Block) -> Result<(), ChainError>;

    /// The gas limit a block at `number` must carry, derived from its
    /// parent under the bounded-delta rule.
    fn calculate_gas_limit(&self, number: u64) -> Result<u64, ChainError>;

    /// The validator set effective at `number`, rotated at epoch
    /// boundaries from header-embedded data.
    fn validator_set(&self, number: u64) -> ValidatorSet;
}

/// The pool operations the engine drives.
pub trait TxPoolInterface: Send + Sync {
    /// Stable snapshot of every sender's executable run.
    fn pending(&self) -> HashMap<Address, Vec<Arc<Transaction>>>;

    /// Remove a non-executable transaction (cascades to the sender's
    /// higher nonces).
    fn drop_transaction(&self, tx: &Transaction);

    /// Shelve a sender's executable run after an executor mismatch.
    fn demote_all_promoted(&self, sender: &Address, correct_nonce: u64);

    /// Remove a transaction after block inclusion.
    fn remove_executed(&self, tx: &Transaction);

    /// Re-base expected nonces from the state implied by the last header.
    fn reset_with_headers(&self, headers: &[Header]);
}

impl TxPoolInterface for ember_txpool::TxPool {
    fn pending(&self) -> HashMap<Address, Vec<Arc<Transaction>>> {
        TxPool::pending(self)
    }

    fn drop_transaction(&self, tx: &Transaction) {
        TxPool::drop_transaction(self, tx)
    }

    fn demote_all_promoted(&self, sender: &Address, correct_nonce: u64) {
        TxPool::demote_all_promoted(self, sender, correct_nonce)
    }

    fn remove_executed(&self, tx: &Transaction) {
        TxPool::remove_executed(self, tx)
    }

    fn reset_with_headers(&self, headers: &[Header]) {
        TxPool::reset_with_headers(self, headers)
    }
}

/// Errors from the gossip transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Consensus message gossip. The transport is expected to deliver the
/// node's own messages back to it.
pub trait Transport: Send + Sync {
    /// Broadcast a consensus message to all validators.
    fn gossip(&self, message: &ConsensusMessage) -> Result<(), TransportError>;
}

/// A sync peer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPeer {
    /// Opaque peer identifier.
    pub id: u64,
    /// The peer's advertised head number.
    pub number: u64,
}

/// The sync driver operations the engine's sync state uses.
pub trait SyncerInterface: Send + Sync {
    /// The best available peer, by advertised head.
    fn best_peer(&self) -> Option<SyncPeer>;

    /// Bulk-sync with a peer, invoking `handler` for every block applied
    /// to the local chain.
    fn bulk_sync_with_peer(
        &self,
        peer: &SyncPeer,
        handler: &mut dyn FnMut(&Block),
    ) -> Result<(), ChainError>;

    /// Subscribe to new-head announcements from a peer, writing each into
    /// the local chain. `handler` returns `true` to stop watching.
    fn watch_sync_with_peer(
        &self,
        peer: &SyncPeer,
        handler: &mut dyn FnMut(&Block) -> bool,
        block_timeout: Duration,
    );

    /// Announce a sealed block to peers.
    fn broadcast(&self, block: &Block);
}

/// Per-transaction outcomes the executor reports while packing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// This transaction does not fit in the remaining block gas.
    #[error("gas limit reached for the current block")]
    GasLimitReached,
    /// Sender-wide inconsistency (e.g. stale nonce run); the sender should
    /// be demoted and retried from `correct_nonce`.
    #[error("transaction recoverable, sender nonce should be {correct_nonce}")]
    Recoverable {
        /// The sender nonce world state actually expects.
        correct_nonce: u64,
    },
    /// The transaction can never execute (bad signature or nonce at apply
    /// time); it and its followers should be dropped.
    #[error("transaction not executable: {0}")]
    NotExecutable(String),
}

/// One in-flight block execution.
///
/// Success and revert-with-receipt both count as written; the executor
/// handles receipts internally and the packer only sees `Ok`.
pub trait Transition {
    /// Apply a transaction to the in-flight block.
    fn write(&mut self, tx: &Transaction) -> Result<(), TransitionError>;

    /// Record a failed receipt for a transaction that is being dropped
    /// without execution (single transaction over the protocol gas limit).
    fn write_failed_receipt(&mut self, tx: &Transaction) -> Result<(), TransitionError>;

    /// Gas consumed so far by written transactions.
    fn gas_used(&self) -> u64;
}

/// Creates [`Transition`]s over an immutable parent-state snapshot.
pub trait ExecutorFactory: Send + Sync {
    /// Begin executing the block described by `header` on top of `parent`.
    fn begin(&self, parent: &Header, header: &Header) -> Box<dyn Transition>;
}
