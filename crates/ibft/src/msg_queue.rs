//! Per-view deduplicated consensus message buffering.
//!
//! Messages are addressable by (sender, kind, view). Messages behind the
//! current sequence are discarded; messages ahead of it are buffered
//! (bounded) and replayed on sequence advance. Within a sequence, messages
//! for higher rounds stay buffered and become eligible when the round
//! advances.

use crate::state::IbftState;
use ember_messages::{ConsensusMessage, MessageKind};
use ember_types::{Address, View};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::time::Instant;
use tracing::trace;

/// Upper bound on buffered messages. The oldest buffered message is evicted
/// beyond this; a correct validator will rebroadcast.
const MAX_BUFFERED: usize = 2048;

/// Result of waiting on the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// An eligible message arrived.
    Message(ConsensusMessage),
    /// The deadline passed (or a forced timeout fired) with nothing
    /// eligible.
    Timeout,
    /// The queue is closed and drained.
    Closed,
}

#[derive(Default)]
struct QueueInner {
    messages: VecDeque<ConsensusMessage>,
    seen: HashSet<(Address, MessageKind, View)>,
    closed: bool,
    forced_timeout: bool,
}

/// Consensus message queue shared between the transport and the engine.
#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl MessageQueue {
    /// New empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a message. Duplicates by (sender, kind, view) are dropped.
    pub fn push(&self, message: ConsensusMessage) {
        let mut inner = self.inner.lock();
        let key = (message.from, message.kind(), message.view);
        if !inner.seen.insert(key) {
            trace!(from = ?message.from, kind = ?message.kind(), "duplicate consensus message");
            return;
        }
        if inner.messages.len() >= MAX_BUFFERED {
            if let Some(evicted) = inner.messages.pop_front() {
                inner
                    .seen
                    .remove(&(evicted.from, evicted.kind(), evicted.view));
            }
        }
        inner.messages.push_back(message);
        self.cond.notify_all();
    }

    /// Close the queue. Waiters drain remaining eligible messages and then
    /// observe [`WaitOutcome::Closed`].
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cond.notify_all();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Force the next [`wait`](Self::wait) to observe a timeout. Test hook
    /// mirroring a round-deadline expiry.
    pub fn force_timeout(&self) {
        self.inner.lock().forced_timeout = true;
        self.cond.notify_all();
    }

    /// Discard bookkeeping and messages that can no longer be delivered for
    /// `view` (older sequences, or lower rounds within the sequence).
    pub fn prune(&self, view: View) {
        let mut inner = self.inner.lock();
        inner.messages.retain(|m| !is_stale(m, view));
        inner
            .seen
            .retain(|(_, kind, msg_view)| !is_stale_key(*kind, *msg_view, view));
    }

    /// Wait for the next message eligible in `state` at `view`.
    ///
    /// Returns [`WaitOutcome::Timeout`] once `deadline` passes,
    /// [`WaitOutcome::Closed`] when the queue is closed and nothing
    /// eligible remains.
    pub fn wait(&self, state: IbftState, view: View, deadline: Instant) -> WaitOutcome {
        let mut inner = self.inner.lock();
        loop {
            // Stale messages are discarded on the way through.
            inner.messages.retain(|m| !is_stale(m, view));

            if let Some(pos) = inner
                .messages
                .iter()
                .position(|m| is_eligible(m, state, view))
            {
                let message = inner.messages.remove(pos).expect("position just found");
                return WaitOutcome::Message(message);
            }

            if inner.forced_timeout {
                inner.forced_timeout = false;
                return WaitOutcome::Timeout;
            }
            if inner.closed {
                return WaitOutcome::Closed;
            }
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return WaitOutcome::Timeout;
            }
        }
    }
}

/// A message is stale when no future state at or after `view` can use it.
fn is_stale(message: &ConsensusMessage, view: View) -> bool {
    is_stale_key(message.kind(), message.view, view)
}

fn is_stale_key(_kind: MessageKind, msg_view: View, view: View) -> bool {
    if msg_view.sequence != view.sequence {
        return msg_view.sequence < view.sequence;
    }
    msg_view.round < view.round
}

/// Which messages each state consumes.
fn is_eligible(message: &ConsensusMessage, state: IbftState, view: View) -> bool {
    if message.view.sequence != view.sequence {
        return false;
    }
    match state {
        IbftState::Accept => {
            message.kind() == MessageKind::Preprepare && message.view.round == view.round
        }
        IbftState::Validate => {
            matches!(message.kind(), MessageKind::Prepare | MessageKind::Commit)
                && message.view.round == view.round
        }
        IbftState::RoundChange => {
            message.kind() == MessageKind::RoundChange && message.view.round >= view.round
        }
        IbftState::Sync => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_messages::MessagePayload;
    use ember_types::{Hash, KeyPair};
    use std::time::Duration;

    fn past_deadline() -> Instant {
        Instant::now() - Duration::from_millis(1)
    }

    fn msg(seed: u8, view: View, payload: MessagePayload) -> ConsensusMessage {
        ConsensusMessage::signed(&KeyPair::from_seed([seed; 32]), view, payload)
    }

    #[test]
    fn deduplicates_by_sender_kind_view() {
        let queue = MessageQueue::new();
        let view = View::new(1, 0);
        queue.push(msg(1, view, MessagePayload::RoundChange));
        queue.push(msg(1, view, MessagePayload::RoundChange));
        queue.close();

        let first = queue.wait(IbftState::RoundChange, view, past_deadline());
        assert!(matches!(first, WaitOutcome::Message(_)));
        let second = queue.wait(IbftState::RoundChange, view, past_deadline());
        assert_eq!(second, WaitOutcome::Closed);
    }

    #[test]
    fn stale_sequence_is_discarded() {
        let queue = MessageQueue::new();
        queue.push(msg(1, View::new(1, 0), MessagePayload::RoundChange));
        queue.close();
        assert_eq!(
            queue.wait(IbftState::RoundChange, View::new(2, 0), past_deadline()),
            WaitOutcome::Closed
        );
    }

    #[test]
    fn future_sequence_is_buffered_until_advance() {
        let queue = MessageQueue::new();
        let future = View::new(3, 0);
        queue.push(msg(1, future, MessagePayload::Prepare { digest: Hash::ZERO }));

        // Not eligible now.
        queue.force_timeout();
        assert_eq!(
            queue.wait(IbftState::Validate, View::new(2, 0), past_deadline()),
            WaitOutcome::Timeout
        );

        // Eligible after the sequence advances.
        assert!(matches!(
            queue.wait(IbftState::Validate, future, past_deadline()),
            WaitOutcome::Message(_)
        ));
    }

    #[test]
    fn higher_round_waits_for_round_advance() {
        let queue = MessageQueue::new();
        let seq = 1;
        queue.push(msg(
            1,
            View::new(seq, 2),
            MessagePayload::Preprepare {
                proposal: Box::default(),
            },
        ));

        queue.force_timeout();
        assert_eq!(
            queue.wait(IbftState::Accept, View::new(seq, 0), past_deadline()),
            WaitOutcome::Timeout
        );
        assert!(matches!(
            queue.wait(IbftState::Accept, View::new(seq, 2), past_deadline()),
            WaitOutcome::Message(_)
        ));
    }

    #[test]
    fn round_change_above_current_round_is_delivered() {
        let queue = MessageQueue::new();
        queue.push(msg(1, View::new(1, 5), MessagePayload::RoundChange));
        assert!(matches!(
            queue.wait(IbftState::RoundChange, View::new(1, 1), past_deadline()),
            WaitOutcome::Message(_)
        ));
    }

    #[test]
    fn states_only_see_their_kinds() {
        let queue = MessageQueue::new();
        let view = View::new(1, 0);
        queue.push(msg(1, view, MessagePayload::Prepare { digest: Hash::ZERO }));

        queue.force_timeout();
        assert_eq!(
            queue.wait(IbftState::Accept, view, past_deadline()),
            WaitOutcome::Timeout
        );
        assert!(matches!(
            queue.wait(IbftState::Validate, view, past_deadline()),
            WaitOutcome::Message(_)
        ));
    }

    #[test]
    fn forced_timeout_fires_once() {
        let queue = MessageQueue::new();
        let view = View::new(1, 0);
        queue.force_timeout();
        assert_eq!(
            queue.wait(IbftState::Accept, view, past_deadline()),
            WaitOutcome::Timeout
        );
        queue.close();
        assert_eq!(
            queue.wait(IbftState::Accept, view, past_deadline()),
            WaitOutcome::Closed
        );
    }
}
