//! In-process gossip transport.
//!
//! The real wire transport is an external collaborator; this hub gives
//! every joined engine the same semantics: broadcast reaches all members,
//! including the sender itself.

use ember_ibft::{MessageQueue, Transport, TransportError};
use ember_messages::ConsensusMessage;
use parking_lot::Mutex;
use std::sync::Arc;

/// Fan-out hub connecting engines running in the same process.
#[derive(Default)]
pub struct GossipHub {
    queues: Mutex<Vec<Arc<MessageQueue>>>,
}

impl GossipHub {
    /// New empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join an engine's message queue to the hub.
    pub fn join(&self, queue: Arc<MessageQueue>) {
        self.queues.lock().push(queue);
    }
}

impl Transport for GossipHub {
    fn gossip(&self, message: &ConsensusMessage) -> Result<(), TransportError> {
        message
            .verify()
            .map_err(|e| TransportError(e.to_string()))?;
        for queue in self.queues.lock().iter() {
            queue.push(message.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_ibft::{IbftState, WaitOutcome};
    use ember_messages::MessagePayload;
    use ember_types::{KeyPair, View};
    use std::time::Instant;

    #[test]
    fn broadcast_reaches_every_member_including_sender() {
        let hub = GossipHub::new();
        let a = Arc::new(MessageQueue::new());
        let b = Arc::new(MessageQueue::new());
        hub.join(Arc::clone(&a));
        hub.join(Arc::clone(&b));

        let key = KeyPair::from_seed([1u8; 32]);
        let msg = ConsensusMessage::signed(&key, View::new(1, 0), MessagePayload::RoundChange);
        hub.gossip(&msg).unwrap();

        for queue in [a, b] {
            assert!(matches!(
                queue.wait(IbftState::RoundChange, View::new(1, 0), Instant::now()),
                WaitOutcome::Message(_)
            ));
        }
    }
}
