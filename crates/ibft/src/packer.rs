//! Greedy multi-sender block packing.

use crate::traits::{Transition, TransitionError};
use ember_types::{Address, Transaction};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What packing decided for each transaction it touched.
#[derive(Debug, Default)]
pub struct PackOutcome {
    /// Written into the block, in execution order.
    pub included: Vec<Arc<Transaction>>,
    /// Proven non-executable; the pool should drop these (and their
    /// senders' higher nonces).
    pub dropped: Vec<Arc<Transaction>>,
    /// Senders the executor reported as inconsistent, with the nonce to
    /// re-base them on.
    pub demoted: Vec<(Address, u64)>,
}

/// One sender's current head in the candidate heap.
struct Candidate {
    gas_price: u64,
    sender: Address,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.gas_price == other.gas_price && self.sender == other.sender
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on gas price; sender address breaks ties
        // deterministically.
        self.gas_price
            .cmp(&other.gas_price)
            .then_with(|| self.sender.cmp(&other.sender))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pack transactions into the in-flight block, greedy across senders.
///
/// A max-heap keyed by (gas price, sender) holds each sender's head, its
/// lowest-nonce pending transaction. The top candidate is applied through
/// the executor:
///
/// - written (success or revert-with-receipt): include it, advance that
///   sender's head
/// - gas-limit-reached: skip the sender for the rest of this block, keeping
///   the transaction pooled, unless it can never fit any block, in which
///   case it gets a failed receipt and is dropped
/// - not executable: drop it (the pool cascades the sender's higher nonces)
/// - recoverable inconsistency: demote the sender
///
/// Packing a cheaper sender after a too-big head is the point: when sender
/// A's next transaction cannot fit, B's cheaper one may still maximize
/// block utilization.
pub fn write_transactions(
    block_gas_limit: u64,
    pending: HashMap<Address, Vec<Arc<Transaction>>>,
    transition: &mut dyn Transition,
) -> PackOutcome {
    let mut outcome = PackOutcome::default();

    // Per-sender cursor into its pending run.
    let mut runs: HashMap<Address, (Vec<Arc<Transaction>>, usize)> = pending
        .into_iter()
        .filter(|(_, txs)| !txs.is_empty())
        .map(|(sender, txs)| (sender, (txs, 0)))
        .collect();

    let mut heap: BinaryHeap<Candidate> = runs
        .iter()
        .map(|(sender, (txs, _))| Candidate {
            gas_price: txs[0].gas_price,
            sender: *sender,
        })
        .collect();

    while let Some(candidate) = heap.pop() {
        let Some((txs, cursor)) = runs.get_mut(&candidate.sender) else {
            continue;
        };
        let tx = Arc::clone(&txs[*cursor]);

        match transition.write(&tx) {
            Ok(()) => {
                trace!(tx = ?tx.hash(), sender = ?tx.from, nonce = tx.nonce, "packed");
                outcome.included.push(tx);
                *cursor += 1;
                if let Some(next) = txs.get(*cursor) {
                    heap.push(Candidate {
                        gas_price: next.gas_price,
                        sender: candidate.sender,
                    });
                }
            }
            Err(TransitionError::GasLimitReached) => {
                if tx.exceeds_block_gas_limit(block_gas_limit) {
                    // Can never fit any block. Record the failure and let
                    // the pool drop it; its followers are unreachable.
                    warn!(tx = ?tx.hash(), gas = tx.gas, block_gas_limit, "transaction over block gas limit, dropping");
                    if let Err(e) = transition.write_failed_receipt(&tx) {
                        warn!(tx = ?tx.hash(), error = %e, "failed receipt write failed");
                    }
                    outcome.dropped.push(tx);
                } else {
                    // Fits a block, just not the space left in this one.
                    trace!(tx = ?tx.hash(), "no room in this block, sender skipped");
                }
                // Either way the sender's head is done for this block.
            }
            Err(TransitionError::Recoverable { correct_nonce }) => {
                debug!(sender = ?tx.from, correct_nonce, "sender inconsistent, demoting");
                outcome.demoted.push((tx.from, correct_nonce));
            }
            Err(TransitionError::NotExecutable(reason)) => {
                debug!(tx = ?tx.hash(), %reason, "not executable, dropping");
                outcome.dropped.push(tx);
            }
        }
    }

    debug!(
        included = outcome.included.len(),
        dropped = outcome.dropped.len(),
        demoted = outcome.demoted.len(),
        "block packing finished"
    );
    outcome
}
