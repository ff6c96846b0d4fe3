//! Per-sender transaction queue with nonce gap handling.

use ember_types::Transaction;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of enqueueing a transaction into an account queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Joined the executable pending run.
    Pending,
    /// Shelved with a nonce gap; promoted once the gap fills.
    Future,
    /// Nonce already passed by world state.
    NonceTooLow,
    /// A transaction with this nonce is already queued.
    Duplicate,
}

/// Ordered per-sender state.
///
/// Invariants:
/// - `pending` is a contiguous nonce run starting at `next_nonce`
/// - `future` holds only nonces strictly beyond the pending tail + 1
/// - no nonce appears in both maps
#[derive(Debug, Default)]
pub struct AccountQueue {
    /// Next nonce expected at the head of the pending run.
    next_nonce: u64,
    /// Executable transactions, contiguous from `next_nonce`.
    pending: BTreeMap<u64, Arc<Transaction>>,
    /// Gapped transactions waiting on missing nonces.
    future: BTreeMap<u64, Arc<Transaction>>,
}

impl AccountQueue {
    /// Create a queue for a sender whose world-state nonce is `next_nonce`.
    pub fn new(next_nonce: u64) -> Self {
        Self {
            next_nonce,
            pending: BTreeMap::new(),
            future: BTreeMap::new(),
        }
    }

    /// The next nonce expected from world state.
    pub fn next_nonce(&self) -> u64 {
        self.next_nonce
    }

    /// One past the highest pending nonce.
    fn pending_tail(&self) -> u64 {
        self.next_nonce + self.pending.len() as u64
    }

    /// Number of executable transactions.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of shelved transactions.
    pub fn future_len(&self) -> usize {
        self.future.len()
    }

    /// Whether the queue holds no transactions at all.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.future.is_empty()
    }

    /// The executable run in nonce order.
    pub fn pending(&self) -> impl Iterator<Item = &Arc<Transaction>> {
        self.pending.values()
    }

    /// All queued transactions, pending first.
    pub fn all(&self) -> impl Iterator<Item = &Arc<Transaction>> {
        self.pending.values().chain(self.future.values())
    }

    /// The queued transaction with the given nonce, if any.
    pub fn get(&self, nonce: u64) -> Option<&Arc<Transaction>> {
        self.pending.get(&nonce).or_else(|| self.future.get(&nonce))
    }

    /// Enqueue a transaction, placing it by nonce.
    ///
    /// Contiguous nonces extend the pending run (and may pull shelved
    /// followers in behind them); gapped nonces go to the future queue.
    pub fn enqueue(&mut self, tx: Arc<Transaction>) -> EnqueueOutcome {
        let nonce = tx.nonce;
        if nonce < self.next_nonce {
            return EnqueueOutcome::NonceTooLow;
        }
        if self.pending.contains_key(&nonce) || self.future.contains_key(&nonce) {
            return EnqueueOutcome::Duplicate;
        }
        if nonce == self.pending_tail() {
            self.pending.insert(nonce, tx);
            EnqueueOutcome::Pending
        } else {
            self.future.insert(nonce, tx);
            EnqueueOutcome::Future
        }
    }

    /// Move future entries whose nonces became contiguous with the pending
    /// tail. Returns the promoted transactions in nonce order.
    pub fn promote(&mut self) -> Vec<Arc<Transaction>> {
        let mut promoted = Vec::new();
        while let Some(tx) = self.future.remove(&self.pending_tail()) {
            self.pending.insert(tx.nonce, Arc::clone(&tx));
            promoted.push(tx);
        }
        promoted
    }

    /// Take the lowest-nonce pending transaction, advancing the expected
    /// nonce past it.
    pub fn pop_executable(&mut self) -> Option<Arc<Transaction>> {
        let (nonce, tx) = self.pending.pop_first()?;
        self.next_nonce = nonce + 1;
        Some(tx)
    }

    /// Move the whole pending run back to future and re-base the expected
    /// nonce. Entries the new nonce already covers are dropped and returned
    /// alongside the demoted set as `(demoted, dropped)`.
    pub fn demote_all(&mut self, correct_nonce: u64) -> (Vec<Arc<Transaction>>, Vec<Arc<Transaction>>) {
        let mut demoted = Vec::new();
        for (nonce, tx) in std::mem::take(&mut self.pending) {
            self.future.insert(nonce, Arc::clone(&tx));
            demoted.push(tx);
        }
        self.next_nonce = correct_nonce;
        let dropped = self.prune_below(correct_nonce);
        demoted.retain(|tx| tx.nonce >= correct_nonce);
        (demoted, dropped)
    }

    /// Re-base on a fresh world-state nonce: drop everything the state has
    /// passed, then promote whatever became contiguous. Returns
    /// `(promoted, dropped)`.
    pub fn reset(&mut self, new_next_nonce: u64) -> (Vec<Arc<Transaction>>, Vec<Arc<Transaction>>) {
        if new_next_nonce < self.next_nonce {
            // A reorg moved the state backwards; pending stays as-is and the
            // stale run below the old base is already gone.
            self.next_nonce = new_next_nonce;
            return (Vec::new(), Vec::new());
        }
        self.next_nonce = new_next_nonce;
        let dropped = self.prune_below(new_next_nonce);
        // Anything left in pending must still be contiguous from the new
        // base; otherwise it re-shelves.
        let mut stale: Vec<_> = Vec::new();
        let mut expected = self.next_nonce;
        for (&nonce, _) in self.pending.iter() {
            if nonce != expected {
                stale.push(nonce);
            } else {
                expected += 1;
            }
        }
        for nonce in stale {
            if let Some(tx) = self.pending.remove(&nonce) {
                self.future.insert(nonce, tx);
            }
        }
        (self.promote(), dropped)
    }

    /// Remove the transaction with `nonce` and everything queued behind it.
    /// Returns the removed transactions in nonce order.
    pub fn truncate_from(&mut self, nonce: u64) -> Vec<Arc<Transaction>> {
        let mut removed: Vec<Arc<Transaction>> = self
            .pending
            .split_off(&nonce)
            .into_values()
            .collect();
        removed.extend(self.future.split_off(&nonce).into_values());
        removed
    }

    fn prune_below(&mut self, nonce: u64) -> Vec<Arc<Transaction>> {
        let keep_pending = self.pending.split_off(&nonce);
        let mut dropped: Vec<Arc<Transaction>> =
            std::mem::replace(&mut self.pending, keep_pending)
                .into_values()
                .collect();
        let keep_future = self.future.split_off(&nonce);
        dropped.extend(
            std::mem::replace(&mut self.future, keep_future).into_values(),
        );
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::{Address, KeyPair};

    fn tx(key: &KeyPair, nonce: u64) -> Arc<Transaction> {
        Arc::new(Transaction::signed(
            key,
            nonce,
            100,
            21_000,
            Some(Address::ZERO),
            1,
            vec![],
        ))
    }

    #[test]
    fn contiguous_nonces_extend_pending() {
        let key = KeyPair::from_seed([1u8; 32]);
        let mut q = AccountQueue::new(0);
        assert_eq!(q.enqueue(tx(&key, 0)), EnqueueOutcome::Pending);
        assert_eq!(q.enqueue(tx(&key, 1)), EnqueueOutcome::Pending);
        assert_eq!(q.pending_len(), 2);
    }

    #[test]
    fn gapped_nonce_is_shelved_and_promoted_when_filled() {
        let key = KeyPair::from_seed([1u8; 32]);
        let mut q = AccountQueue::new(0);
        assert_eq!(q.enqueue(tx(&key, 0)), EnqueueOutcome::Pending);
        assert_eq!(q.enqueue(tx(&key, 2)), EnqueueOutcome::Future);
        assert_eq!(q.pending_len(), 1);
        assert_eq!(q.future_len(), 1);

        assert_eq!(q.enqueue(tx(&key, 1)), EnqueueOutcome::Pending);
        let promoted = q.promote();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].nonce, 2);
        assert_eq!(q.pending_len(), 3);
        assert_eq!(q.future_len(), 0);
    }

    #[test]
    fn stale_nonce_is_rejected() {
        let key = KeyPair::from_seed([1u8; 32]);
        let mut q = AccountQueue::new(5);
        assert_eq!(q.enqueue(tx(&key, 4)), EnqueueOutcome::NonceTooLow);
    }

    #[test]
    fn duplicate_nonce_is_rejected() {
        let key = KeyPair::from_seed([1u8; 32]);
        let mut q = AccountQueue::new(0);
        q.enqueue(tx(&key, 0));
        assert_eq!(q.enqueue(tx(&key, 0)), EnqueueOutcome::Duplicate);
    }

    #[test]
    fn pop_executable_advances_expected_nonce() {
        let key = KeyPair::from_seed([1u8; 32]);
        let mut q = AccountQueue::new(0);
        q.enqueue(tx(&key, 0));
        q.enqueue(tx(&key, 1));
        let popped = q.pop_executable().unwrap();
        assert_eq!(popped.nonce, 0);
        assert_eq!(q.next_nonce(), 1);
        assert_eq!(q.pending_len(), 1);
    }

    #[test]
    fn reset_drops_passed_nonces_and_promotes() {
        let key = KeyPair::from_seed([1u8; 32]);
        let mut q = AccountQueue::new(0);
        q.enqueue(tx(&key, 0));
        q.enqueue(tx(&key, 1));
        q.enqueue(tx(&key, 3));

        let (promoted, dropped) = q.reset(2);
        assert_eq!(dropped.len(), 2); // nonces 0, 1
        assert!(promoted.is_empty()); // 3 still has a gap at 2
        assert_eq!(q.future_len(), 1);

        let (promoted, dropped) = q.reset(3);
        assert!(dropped.is_empty());
        assert_eq!(promoted.len(), 1);
        assert_eq!(q.pending_len(), 1);
    }

    #[test]
    fn reset_is_idempotent() {
        let key = KeyPair::from_seed([1u8; 32]);
        let mut q = AccountQueue::new(0);
        q.enqueue(tx(&key, 2));
        q.reset(1);
        let before = (q.next_nonce(), q.pending_len(), q.future_len());
        q.reset(1);
        assert_eq!(before, (q.next_nonce(), q.pending_len(), q.future_len()));
    }

    #[test]
    fn demote_moves_pending_to_future() {
        let key = KeyPair::from_seed([1u8; 32]);
        let mut q = AccountQueue::new(0);
        q.enqueue(tx(&key, 0));
        q.enqueue(tx(&key, 1));

        let (demoted, dropped) = q.demote_all(1);
        assert_eq!(dropped.len(), 1); // nonce 0 is below the corrected base
        assert_eq!(demoted.len(), 1); // nonce 1 survives, shelved
        assert_eq!(q.pending_len(), 0);
        assert_eq!(q.future_len(), 1);
        assert_eq!(q.next_nonce(), 1);
    }

    #[test]
    fn truncate_from_removes_tail() {
        let key = KeyPair::from_seed([1u8; 32]);
        let mut q = AccountQueue::new(0);
        q.enqueue(tx(&key, 0));
        q.enqueue(tx(&key, 1));
        q.enqueue(tx(&key, 2));
        q.enqueue(tx(&key, 4));

        let removed = q.truncate_from(1);
        assert_eq!(removed.len(), 3); // 1, 2 from pending; 4 from future
        assert_eq!(q.pending_len(), 1);
        assert_eq!(q.future_len(), 0);
    }
}
