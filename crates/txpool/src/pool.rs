//! Global pool state: admission, promotion, demotion, drop, pending view.

use crate::account::{AccountQueue, EnqueueOutcome};
use crate::event::PoolEvent;
use ember_types::{Address, Hash, Header, Transaction, TX_MAX_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Capacity of the event broadcast channel. Slow subscribers lag rather
/// than block admission.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Admission errors surfaced to submitters.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Nonce already passed by world state.
    #[error("nonce too low")]
    NonceTooLow,
    /// Sender balance cannot cover `value + gas * gas_price`.
    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,
    /// Gossip-origin transaction priced below the configured floor.
    #[error("transaction underpriced")]
    UnderPriceFloor,
    /// Pool is at capacity and nothing cheaper can be evicted.
    #[error("transaction pool is full")]
    PoolFull,
    /// Encoded size exceeds the per-transaction limit.
    #[error("oversized data")]
    OversizedData,
    /// Signature does not verify for the claimed sender.
    #[error("invalid transaction signature")]
    InvalidSignature,
    /// The caller's deadline lapsed before admission completed.
    #[error("deadline exceeded before admission completed")]
    DeadlineExceeded,
}

/// Where a transaction came from. Local submissions bypass the price floor;
/// gossip does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOrigin {
    /// Submitted through the local operator surface.
    Local,
    /// Received from peer gossip.
    Gossip,
}

/// Account state the pool reads from the world state.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountInfo {
    /// Next expected transaction nonce.
    pub nonce: u64,
    /// Spendable balance.
    pub balance: u128,
}

/// Read-only world state access, resolved against a specific header.
pub trait StateLookup: Send + Sync {
    /// Account state as implied by `header`.
    fn account(&self, header: &Header, address: &Address) -> AccountInfo;
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity in slots; one slot covers `TX_SLOT_SIZE` encoded bytes.
    pub max_slots: u64,
    /// Gossip-origin gas-price floor; zero disables the floor.
    pub price_limit: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_slots: 4096,
            price_limit: 0,
        }
    }
}

struct PoolEntry {
    tx: Arc<Transaction>,
    origin: TxOrigin,
}

struct PoolInner {
    /// Per-sender queues.
    accounts: HashMap<Address, AccountQueue>,
    /// Hash index over every queued transaction.
    all: HashMap<Hash, PoolEntry>,
    /// Slots consumed by everything in `all`.
    current_slots: u64,
    /// Header whose implied world state admission checks run against.
    head: Header,
}

/// The transaction pool.
///
/// Safe for concurrent producers; mutators serialize on the inner lock and
/// `pending()` returns a snapshot.
pub struct TxPool {
    config: PoolConfig,
    state: Arc<dyn StateLookup>,
    inner: Mutex<PoolInner>,
    events: broadcast::Sender<PoolEvent>,
}

impl TxPool {
    /// Create a pool reading world state through `state`, rooted at `head`.
    pub fn new(config: PoolConfig, state: Arc<dyn StateLookup>, head: Header) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            state,
            inner: Mutex::new(PoolInner {
                accounts: HashMap::new(),
                all: HashMap::new(),
                current_slots: 0,
                head,
            }),
            events,
        }
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Add a transaction to the pool.
    ///
    /// Re-submitting a known transaction is an idempotent no-op returning
    /// the existing hash.
    pub fn add(&self, tx: Transaction, origin: TxOrigin) -> Result<Hash, PoolError> {
        self.add_with_deadline(tx, origin, None)
    }

    /// Add a transaction, aborting if `deadline` passes before the pool
    /// lock is acquired.
    pub fn add_with_deadline(
        &self,
        tx: Transaction,
        origin: TxOrigin,
        deadline: Option<Instant>,
    ) -> Result<Hash, PoolError> {
        let hash = tx.hash();

        // Stateless checks happen before taking the lock.
        if tx.size() > TX_MAX_SIZE {
            return Err(PoolError::OversizedData);
        }
        if !tx.verify_signature() {
            return Err(PoolError::InvalidSignature);
        }
        if origin == TxOrigin::Gossip
            && self.config.price_limit > 0
            && tx.gas_price < self.config.price_limit
        {
            return Err(PoolError::UnderPriceFloor);
        }

        let mut inner = match deadline {
            Some(deadline) => self
                .inner
                .try_lock_until(deadline)
                .ok_or(PoolError::DeadlineExceeded)?,
            None => self.inner.lock(),
        };

        if inner.all.contains_key(&hash) {
            trace!(tx = ?hash, "duplicate submission, returning existing hash");
            return Ok(hash);
        }

        let account = self.state.account(&inner.head, &tx.from);
        if tx.cost() > account.balance {
            return Err(PoolError::InsufficientFunds);
        }

        let queue_nonce = inner
            .accounts
            .get(&tx.from)
            .map(|q| q.next_nonce())
            .unwrap_or(account.nonce);
        if tx.nonce < queue_nonce {
            return Err(PoolError::NonceTooLow);
        }

        // Make room before enqueueing.
        let needed = tx.slots();
        if inner.current_slots + needed > self.config.max_slots {
            self.evict_for(&mut inner, &tx, needed)?;
        }

        let tx = Arc::new(tx);
        let sender = tx.from;
        let queue = inner
            .accounts
            .entry(sender)
            .or_insert_with(|| AccountQueue::new(account.nonce));

        match queue.enqueue(Arc::clone(&tx)) {
            EnqueueOutcome::NonceTooLow => return Err(PoolError::NonceTooLow),
            // Same nonce, different hash: first writer wins.
            EnqueueOutcome::Duplicate => return Err(PoolError::NonceTooLow),
            EnqueueOutcome::Pending | EnqueueOutcome::Future => {}
        }
        let promoted = queue.promote();

        inner.current_slots += needed;
        inner.all.insert(hash, PoolEntry {
            tx: Arc::clone(&tx),
            origin,
        });

        debug!(
            tx = ?hash,
            sender = ?sender,
            nonce = tx.nonce,
            slots = inner.current_slots,
            "transaction admitted"
        );

        let _ = self.events.send(PoolEvent::Added { hash, sender });
        for tx in promoted {
            let _ = self.events.send(PoolEvent::Promoted { hash: tx.hash() });
        }
        Ok(hash)
    }

    /// Look up a pooled transaction by hash.
    pub fn get(&self, hash: &Hash) -> Option<Arc<Transaction>> {
        self.inner.lock().all.get(hash).map(|e| Arc::clone(&e.tx))
    }

    /// Stable snapshot of every sender's executable run, nonce-ascending.
    pub fn pending(&self) -> HashMap<Address, Vec<Arc<Transaction>>> {
        let inner = self.inner.lock();
        inner
            .accounts
            .iter()
            .filter(|(_, q)| q.pending_len() > 0)
            .map(|(addr, q)| (*addr, q.pending().cloned().collect()))
            .collect()
    }

    /// Move a sender's executable run back to future and re-base its
    /// expected nonce. Used when the executor reports a sender-wide
    /// inconsistency.
    pub fn demote_all_promoted(&self, sender: &Address, correct_nonce: u64) {
        let mut inner = self.inner.lock();
        let Some(queue) = inner.accounts.get_mut(sender) else {
            return;
        };
        let (demoted, dropped) = queue.demote_all(correct_nonce);
        warn!(
            sender = ?sender,
            correct_nonce,
            demoted = demoted.len(),
            dropped = dropped.len(),
            "demoting sender after executor mismatch"
        );
        for tx in &dropped {
            Self::unindex(&mut inner, tx);
        }
        drop(inner);
        for tx in demoted {
            let _ = self.events.send(PoolEvent::Demoted { hash: tx.hash() });
        }
        for tx in dropped {
            let _ = self.events.send(PoolEvent::Dropped { hash: tx.hash() });
        }
    }

    /// Remove a transaction proven non-executable, along with the sender's
    /// higher-nonce transactions (they are unreachable behind it).
    pub fn drop_transaction(&self, tx: &Transaction) {
        let mut inner = self.inner.lock();
        let Some(queue) = inner.accounts.get_mut(&tx.from) else {
            return;
        };
        let removed = queue.truncate_from(tx.nonce);
        if queue.is_empty() {
            inner.accounts.remove(&tx.from);
        }
        for tx in &removed {
            Self::unindex(&mut inner, tx);
        }
        debug!(tx = ?tx.hash(), cascade = removed.len(), "dropped non-executable transaction");
        drop(inner);
        for tx in removed {
            let _ = self.events.send(PoolEvent::Dropped { hash: tx.hash() });
        }
    }

    /// Remove a transaction after block inclusion and advance the sender's
    /// expected nonce past it.
    pub fn remove_executed(&self, tx: &Transaction) {
        let mut inner = self.inner.lock();
        let mut removed = Vec::new();
        if let Some(queue) = inner.accounts.get_mut(&tx.from) {
            if queue.next_nonce() == tx.nonce {
                removed.extend(queue.pop_executable());
            } else {
                // Included out from under us (e.g. via another node's
                // block); fall back to a re-base at the included nonce + 1.
                let (_, dropped) = queue.reset(tx.nonce + 1);
                removed.extend(dropped);
            }
            if queue.is_empty() {
                inner.accounts.remove(&tx.from);
            }
        }
        for tx in &removed {
            Self::unindex(&mut inner, tx);
        }
        drop(inner);
        for tx in removed {
            let _ = self.events.send(PoolEvent::Executed { hash: tx.hash() });
        }
    }

    /// Re-base every sender's expected nonce from the world state implied
    /// by the last of `headers`, then re-run promotion. Idempotent.
    pub fn reset_with_headers(&self, headers: &[Header]) {
        let Some(head) = headers.last() else {
            return;
        };
        let mut inner = self.inner.lock();
        inner.head = head.clone();

        let senders: Vec<Address> = inner.accounts.keys().copied().collect();
        let mut all_promoted = Vec::new();
        let mut all_dropped = Vec::new();
        for sender in senders {
            let info = self.state.account(&inner.head, &sender);
            let Some(queue) = inner.accounts.get_mut(&sender) else {
                continue;
            };
            let (promoted, dropped) = queue.reset(info.nonce);
            if queue.is_empty() {
                inner.accounts.remove(&sender);
            }
            for tx in &dropped {
                Self::unindex(&mut inner, tx);
            }
            all_promoted.extend(promoted);
            all_dropped.extend(dropped);
        }

        debug!(
            head = head.number,
            promoted = all_promoted.len(),
            dropped = all_dropped.len(),
            "pool re-based on new head"
        );
        drop(inner);
        for tx in all_promoted {
            let _ = self.events.send(PoolEvent::Promoted { hash: tx.hash() });
        }
        for tx in all_dropped {
            let _ = self.events.send(PoolEvent::Executed { hash: tx.hash() });
        }
    }

    /// Total executable transactions across all senders.
    pub fn pending_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.accounts.values().map(|q| q.pending_len()).sum()
    }

    /// Total shelved transactions across all senders.
    pub fn enqueued_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.accounts.values().map(|q| q.future_len()).sum()
    }

    /// Slots currently consumed.
    pub fn current_slots(&self) -> u64 {
        self.inner.lock().current_slots
    }

    /// Configured slot capacity.
    pub fn max_slots(&self) -> u64 {
        self.config.max_slots
    }

    /// Evict enough strictly-cheaper transactions to make room for `tx`.
    ///
    /// Candidates are each sender's queue tail (so nonce runs stay intact);
    /// the cheapest goes first, and at equal price a gossip transaction is
    /// evicted before a local one.
    fn evict_for(
        &self,
        inner: &mut PoolInner,
        tx: &Transaction,
        needed: u64,
    ) -> Result<(), PoolError> {
        while inner.current_slots + needed > self.config.max_slots {
            let victim = inner
                .accounts
                .iter()
                .filter_map(|(addr, q)| {
                    // Tail of the queue: last future entry, else last pending.
                    let tail = q.all().last()?;
                    Some((*addr, Arc::clone(tail)))
                })
                .filter(|(_, candidate)| candidate.gas_price < tx.gas_price)
                .filter(|(_, candidate)| candidate.hash() != tx.hash())
                .min_by_key(|(addr, candidate)| {
                    let origin = inner
                        .all
                        .get(&candidate.hash())
                        .map(|e| e.origin)
                        .unwrap_or(TxOrigin::Gossip);
                    // Gossip sorts before local at equal price: local wins.
                    let origin_rank = match origin {
                        TxOrigin::Gossip => 0u8,
                        TxOrigin::Local => 1u8,
                    };
                    (candidate.gas_price, origin_rank, *addr)
                });

            let Some((sender, victim)) = victim else {
                return Err(PoolError::PoolFull);
            };

            let Some(queue) = inner.accounts.get_mut(&sender) else {
                return Err(PoolError::PoolFull);
            };
            let removed = queue.truncate_from(victim.nonce);
            if queue.is_empty() {
                inner.accounts.remove(&sender);
            }
            for tx in &removed {
                Self::unindex(inner, tx);
                let _ = self.events.send(PoolEvent::Evicted { hash: tx.hash() });
            }
            debug!(victim = ?victim.hash(), sender = ?sender, "evicted under slot pressure");
        }
        Ok(())
    }

    fn unindex(inner: &mut PoolInner, tx: &Transaction) {
        if inner.all.remove(&tx.hash()).is_some() {
            inner.current_slots = inner.current_slots.saturating_sub(tx.slots());
        }
    }
}

impl std::fmt::Debug for TxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TxPool")
            .field("senders", &inner.accounts.len())
            .field("transactions", &inner.all.len())
            .field("current_slots", &inner.current_slots)
            .field("max_slots", &self.config.max_slots)
            .finish()
    }
}
