//! Consensus messages exchanged between validators.
//!
//! Four kinds flow over gossip: preprepare (carries the proposal block),
//! prepare and commit (carry the block hash, commit also carries a seal),
//! and round change. Every message is signed; the sender address must match
//! the signing key, so identity is established per message rather than per
//! connection.

use ember_types::{Address, Block, Hash, KeyPair, PublicKey, Signature, View};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain tag mixed into every consensus message signature.
const DOMAIN_CONSENSUS: &[u8] = b"ember_consensus:";

/// Errors raised when checking an incoming message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The signature does not verify for the claimed sender.
    #[error("invalid message signature")]
    InvalidSignature,
    /// The signer's public key does not map to the claimed sender address.
    #[error("sender address does not match signing key")]
    SenderMismatch,
}

/// Discriminates message kinds without their payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Proposal broadcast by the round's proposer.
    Preprepare,
    /// First-phase vote on a proposal.
    Prepare,
    /// Second-phase vote carrying a seal over the block hash.
    Commit,
    /// Request to advance to the view's round.
    RoundChange,
}

/// Kind-specific payload of a consensus message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MessagePayload {
    /// The full proposal block.
    Preprepare {
        /// Proposed block for the message's view.
        proposal: Box<Block>,
    },
    /// Hash of the block being prepared.
    Prepare {
        /// Seal hash of the proposal.
        digest: Hash,
    },
    /// Hash plus the sender's seal over it.
    Commit {
        /// Seal hash of the proposal.
        digest: Hash,
        /// Sender's signature over the seal hash, aggregated into the
        /// finalized header as a committed seal.
        seal: Signature,
    },
    /// Round change carries no payload beyond the view.
    RoundChange,
}

impl MessagePayload {
    /// The kind of this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::Preprepare { .. } => MessageKind::Preprepare,
            MessagePayload::Prepare { .. } => MessageKind::Prepare,
            MessagePayload::Commit { .. } => MessageKind::Commit,
            MessagePayload::RoundChange => MessageKind::RoundChange,
        }
    }
}

/// A signed consensus message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    /// View this message belongs to.
    pub view: View,
    /// Sender address.
    pub from: Address,
    /// Kind-specific payload.
    pub payload: MessagePayload,
    /// Sender's public key; its address must equal `from`.
    pub sender_key: PublicKey,
    /// Signature over the signing payload.
    pub signature: Signature,
}

impl ConsensusMessage {
    /// Build and sign a message.
    pub fn signed(key: &KeyPair, view: View, payload: MessagePayload) -> Self {
        let from = key.address();
        let message = signing_bytes(&view, &from, &payload);
        Self {
            view,
            from,
            payload,
            sender_key: key.public_key(),
            signature: key.sign(&message),
        }
    }

    /// The message kind.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Verify the signature and the sender/key binding.
    pub fn verify(&self) -> Result<(), MessageError> {
        if self.sender_key.address() != self.from {
            return Err(MessageError::SenderMismatch);
        }
        let message = signing_bytes(&self.view, &self.from, &self.payload);
        if !self.sender_key.verify(&message, &self.signature) {
            return Err(MessageError::InvalidSignature);
        }
        Ok(())
    }

    /// The proposal digest this message refers to, if any.
    pub fn digest(&self) -> Option<Hash> {
        match &self.payload {
            MessagePayload::Preprepare { proposal } => Some(proposal.header.hash),
            MessagePayload::Prepare { digest } => Some(*digest),
            MessagePayload::Commit { digest, .. } => Some(*digest),
            MessagePayload::RoundChange => None,
        }
    }
}

fn signing_bytes(view: &View, from: &Address, payload: &MessagePayload) -> Vec<u8> {
    #[derive(Serialize)]
    struct Preimage<'a> {
        view: &'a View,
        from: &'a Address,
        payload: &'a MessagePayload,
    }

    let mut bytes = DOMAIN_CONSENSUS.to_vec();
    bytes.extend(
        bincode::serialize(&Preimage {
            view,
            from,
            payload,
        })
        .expect("message pre-image is serializable"),
    );
    bytes
}
