//! Pool lifecycle events.

use ember_types::{Address, Hash};

/// Events emitted by the pool, observable through
/// [`TxPool::subscribe`](crate::TxPool::subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// A transaction entered the pool.
    Added {
        /// Transaction hash.
        hash: Hash,
        /// Sender address.
        sender: Address,
    },
    /// A shelved transaction became executable.
    Promoted {
        /// Transaction hash.
        hash: Hash,
    },
    /// An executable transaction was shelved again.
    Demoted {
        /// Transaction hash.
        hash: Hash,
    },
    /// A transaction was removed as non-executable.
    Dropped {
        /// Transaction hash.
        hash: Hash,
    },
    /// A transaction was evicted to make room for a better-paying one.
    Evicted {
        /// Transaction hash.
        hash: Hash,
    },
    /// A transaction left the pool after block inclusion.
    Executed {
        /// Transaction hash.
        hash: Hash,
    },
}
