//! Per-sequence consensus state.

use ember_messages::{ConsensusMessage, MessageKind};
use ember_types::{Address, Block, ValidatorSet, View};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// The engine's coarse state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IbftState {
    /// Waiting for (or building) the round's proposal.
    Accept = 0,
    /// Collecting prepare and commit votes.
    Validate = 1,
    /// Coordinating a round change.
    RoundChange = 2,
    /// Following the chain until caught up.
    Sync = 3,
}

impl std::fmt::Display for IbftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IbftState::Accept => "AcceptState",
            IbftState::Validate => "ValidateState",
            IbftState::RoundChange => "RoundChangeState",
            IbftState::Sync => "SyncState",
        };
        f.write_str(name)
    }
}

/// Shared, atomically-readable engine state.
///
/// The consensus thread owns all other state, but the coarse state is
/// observable (and settable) from outside: the sync watcher and shutdown
/// paths need to steer a blocked state function off its loop.
#[derive(Debug, Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    /// New shared state starting in [`IbftState::Sync`].
    pub fn new() -> Self {
        SharedState(Arc::new(AtomicU8::new(IbftState::Sync as u8)))
    }

    /// Read the current state.
    pub fn get(&self) -> IbftState {
        match self.0.load(Ordering::SeqCst) {
            0 => IbftState::Accept,
            1 => IbftState::Validate,
            2 => IbftState::RoundChange,
            _ => IbftState::Sync,
        }
    }

    /// Transition to a new state.
    pub fn set(&self, state: IbftState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Consensus-level verification errors. Each transitions the engine to
/// round change (or sync, for write failures).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IbftError {
    /// Proposal height does not match the current sequence.
    #[error("proposed block height does not match the sequence")]
    IncorrectBlockHeight,
    /// The proposal failed potential-block verification.
    #[error("block verification failed")]
    BlockVerificationFailed,
    /// A locked node received a proposal that is not its locked block.
    #[error("proposal does not match the locked block")]
    LockedBlockMismatch,
    /// The proposal came from a validator that is not this view's proposer.
    #[error("message sender is not the expected proposer")]
    ProposerMismatch,
    /// Building a candidate block failed.
    #[error("failed to build a candidate block: {0}")]
    BlockBuildFailed(String),
    /// Writing the finalized block failed; the sequence must reconcile
    /// through sync.
    #[error("failed to write finalized block: {0}")]
    WriteBlockFailed(String),
}

/// Everything the engine tracks within one sequence.
///
/// Invariants:
/// - at most one message per (sender, kind, view) survives dedup
/// - `locked` implies `block` is present
/// - entering a new sequence clears every message set
#[derive(Default)]
pub struct ConsensusState {
    /// Current view.
    pub view: View,
    /// Validator set for the current sequence.
    pub validators: ValidatorSet,
    /// Candidate block, if a proposal has been made or accepted.
    pub block: Option<Block>,
    /// Sticky per-sequence flag binding this node to its candidate.
    pub locked: bool,
    /// Last verification error; drives the round-change entry path.
    pub err: Option<IbftError>,

    /// Prepare votes by sender. A vote only counts toward the view it was
    /// cast for: insertion rejects other views and every round advance
    /// clears the tally.
    prepared: HashMap<Address, ConsensusMessage>,
    /// Commit votes by sender, scoped to the current view like `prepared`.
    committed: HashMap<Address, ConsensusMessage>,
    /// Round-change votes by round, then sender.
    round_messages: BTreeMap<u64, HashMap<Address, ConsensusMessage>>,
}

impl ConsensusState {
    /// Fresh state at the first view of `sequence`.
    pub fn new(sequence: u64) -> Self {
        Self {
            view: View::round_zero(sequence),
            ..Default::default()
        }
    }

    /// Number of distinct prepare votes.
    pub fn num_prepared(&self) -> usize {
        self.prepared.len()
    }

    /// Number of distinct commit votes.
    pub fn num_committed(&self) -> usize {
        self.committed.len()
    }

    /// The collected commit messages.
    pub fn committed(&self) -> impl Iterator<Item = &ConsensusMessage> {
        self.committed.values()
    }

    /// Record a prepare vote from a known validator for the current view.
    /// Votes for any other view are discarded; duplicates replace.
    pub fn add_prepared(&mut self, message: ConsensusMessage) {
        if message.view != self.view || !self.validators.contains(&message.from) {
            return;
        }
        self.prepared.insert(message.from, message);
    }

    /// Record a commit vote from a known validator for the current view.
    /// Votes for any other view are discarded; duplicates replace.
    pub fn add_committed(&mut self, message: ConsensusMessage) {
        if message.view != self.view || !self.validators.contains(&message.from) {
            return;
        }
        self.committed.insert(message.from, message);
    }

    /// Record a round-change vote, returning how many distinct senders have
    /// asked for that round.
    pub fn add_round_message(&mut self, message: ConsensusMessage) -> usize {
        if message.kind() != MessageKind::RoundChange || !self.validators.contains(&message.from) {
            return 0;
        }
        let round = message.view.round;
        let senders = self.round_messages.entry(round).or_default();
        senders.insert(message.from, message);
        senders.len()
    }

    /// The highest round above the current one backed by a weak certificate
    /// (`f + 1` distinct senders).
    pub fn max_round(&self) -> Option<u64> {
        let threshold = self.validators.max_faulty() + 1;
        self.round_messages
            .iter()
            .rev()
            .find(|(round, senders)| **round > self.view.round && senders.len() >= threshold)
            .map(|(round, _)| *round)
    }

    /// Advance round bookkeeping: drop round-change votes below `round`
    /// and clear the prepare/commit tallies. Votes only ever count toward
    /// the round they were cast in, and the candidate may change across
    /// rounds, so the tallies must never leak into the new round.
    pub fn clean_round(&mut self, round: u64) {
        self.round_messages = self.round_messages.split_off(&round);
        self.prepared.clear();
        self.committed.clear();
    }

    /// Bind to the candidate block.
    pub fn lock(&mut self) {
        debug_assert!(self.block.is_some(), "locking without a candidate");
        self.locked = true;
    }

    /// Release the candidate block and the lock.
    pub fn unlock(&mut self) {
        self.block = None;
        self.locked = false;
    }

    /// Enter a new sequence: reset the view to round zero and clear every
    /// message set and error. Locking is handled separately.
    pub fn new_sequence(&mut self, sequence: u64) {
        self.view = View::round_zero(sequence);
        self.prepared.clear();
        self.committed.clear();
        self.round_messages.clear();
        self.err = None;
    }
}

impl std::fmt::Debug for ConsensusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusState")
            .field("view", &self.view)
            .field("locked", &self.locked)
            .field("prepared", &self.prepared.len())
            .field("committed", &self.committed.len())
            .field("err", &self.err)
            .finish()
    }
}
