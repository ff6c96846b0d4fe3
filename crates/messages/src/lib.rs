//! Network messages for the consensus protocol.

mod consensus;

pub use consensus::{ConsensusMessage, MessageError, MessageKind, MessagePayload};
