//! Consensus extra data carried in block headers.
//!
//! The header's `extra_data` field encodes the validator set for the epoch,
//! the proposer's seal, and the aggregated commit seals of the finalizing
//! quorum. Committed seals are excluded from the seal-hash pre-image but
//! present in the final sealed header.

use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::hash::{Address, Hash};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed vanity prefix length at the front of `extra_data`.
pub const IBFT_EXTRA_VANITY: usize = 32;

/// Errors decoding header extra data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtraError {
    /// `extra_data` is shorter than the vanity prefix.
    #[error("extra data shorter than {IBFT_EXTRA_VANITY}-byte vanity prefix")]
    MissingVanity,
    /// The payload after the vanity prefix failed to decode.
    #[error("malformed validator extra payload")]
    Malformed,
}

/// A single validator's seal over a block hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedSeal {
    /// Address of the sealing validator.
    pub signer: Address,
    /// Signature over the block's seal hash.
    pub signature: Signature,
}

impl CommittedSeal {
    /// Verify this seal over `block_hash` against the signer's known key.
    pub fn verify(&self, block_hash: &Hash, public_key: &PublicKey) -> bool {
        public_key.address() == self.signer
            && public_key.verify(block_hash.as_bytes(), &self.signature)
    }
}

/// Decoded consensus extra data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ValidatorExtra {
    /// Validator set for the epoch this header belongs to.
    pub validators: Vec<Address>,
    /// Proposer's seal over the header's seal hash.
    pub proposer_seal: Option<CommittedSeal>,
    /// Commit seals collected from the finalizing quorum.
    pub committed_seals: Vec<CommittedSeal>,
}

impl ValidatorExtra {
    /// Extra data carrying only a validator set.
    pub fn new(validators: Vec<Address>) -> Self {
        Self {
            validators,
            proposer_seal: None,
            committed_seals: Vec::new(),
        }
    }

    /// Encode into header `extra_data` bytes (vanity prefix + payload).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; IBFT_EXTRA_VANITY];
        out.extend(bincode::serialize(self).expect("extra payload is serializable"));
        out
    }

    /// Decode from header `extra_data` bytes.
    pub fn decode(extra_data: &[u8]) -> Result<Self, ExtraError> {
        if extra_data.len() < IBFT_EXTRA_VANITY {
            return Err(ExtraError::MissingVanity);
        }
        bincode::deserialize(&extra_data[IBFT_EXTRA_VANITY..]).map_err(|_| ExtraError::Malformed)
    }

    /// Sign the seal hash with the proposer's key and store the seal.
    pub fn write_proposer_seal(&mut self, key: &KeyPair, seal_hash: &Hash) {
        self.proposer_seal = Some(CommittedSeal {
            signer: key.address(),
            signature: key.sign(seal_hash.as_bytes()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let key = KeyPair::from_seed([1u8; 32]);
        let mut extra = ValidatorExtra::new(vec![key.address(), Address::ZERO]);
        extra.write_proposer_seal(&key, &Hash::ZERO);

        let decoded = ValidatorExtra::decode(&extra.encode()).unwrap();
        assert_eq!(extra, decoded);
    }

    #[test]
    fn short_extra_is_rejected() {
        assert_eq!(
            ValidatorExtra::decode(&[0u8; 4]),
            Err(ExtraError::MissingVanity)
        );
    }

    #[test]
    fn committed_seal_verifies_against_signer_key() {
        let key = KeyPair::from_seed([2u8; 32]);
        let hash = Hash::from_bytes([3u8; 32]);
        let seal = CommittedSeal {
            signer: key.address(),
            signature: key.sign(hash.as_bytes()),
        };
        assert!(seal.verify(&hash, &key.public_key()));

        let other = KeyPair::from_seed([4u8; 32]);
        assert!(!seal.verify(&hash, &other.public_key()));
    }
}
