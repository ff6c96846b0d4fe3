//! Operator surface over the pool.
//!
//! The RPC layer proper is an external collaborator; this facade is what it
//! binds to. It surfaces the admission error taxonomy unchanged and enforces
//! caller deadlines.

use crate::event::PoolEvent;
use crate::pool::{PoolError, TxOrigin, TxPool};
use ember_types::{Hash, Transaction};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

/// Pool occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Executable transactions across all senders.
    pub pending_length: usize,
    /// Shelved transactions across all senders.
    pub enqueued_length: usize,
    /// Configured slot capacity.
    pub max_slots: u64,
    /// Slots currently consumed.
    pub current_slots: u64,
}

/// Operator handle for a pool.
#[derive(Clone)]
pub struct PoolOperator {
    pool: Arc<TxPool>,
}

impl PoolOperator {
    /// Wrap a pool.
    pub fn new(pool: Arc<TxPool>) -> Self {
        Self { pool }
    }

    /// Submit a transaction. If `deadline` elapses before admission
    /// completes the call aborts with [`PoolError::DeadlineExceeded`].
    pub fn add_txn(
        &self,
        tx: Transaction,
        origin: TxOrigin,
        deadline: Option<Instant>,
    ) -> Result<Hash, PoolError> {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(PoolError::DeadlineExceeded);
        }
        self.pool.add_with_deadline(tx, origin, deadline)
    }

    /// Current pool occupancy.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            pending_length: self.pool.pending_len(),
            enqueued_length: self.pool.enqueued_len(),
            max_slots: self.pool.max_slots(),
            current_slots: self.pool.current_slots(),
        }
    }

    /// Stream of pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool.subscribe()
    }
}
