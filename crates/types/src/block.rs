//! Block and header types.

use crate::extra::ValidatorExtra;
use crate::hash::{keccak256, Hash};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

/// Largest allowed single-step gas limit adjustment is `parent / 1024`.
const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;

/// A block header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Header {
    /// Hash of the parent block.
    pub parent_hash: Hash,
    /// Block number. Equals the consensus sequence that produced it.
    pub number: u64,
    /// Unix timestamp (seconds) set by the proposer.
    pub timestamp: u64,
    /// Gas limit for this block.
    pub gas_limit: u64,
    /// Gas consumed by this block's transactions.
    pub gas_used: u64,
    /// Root commitment over the block's transactions. Zero for empty bodies.
    pub tx_root: Hash,
    /// Consensus extra data (validator set, proposer seal, committed seals).
    pub extra_data: Vec<u8>,
    /// Cached header hash. Recomputed with [`Header::compute_hash`].
    pub hash: Hash,
}

impl Header {
    /// Recompute and store the header hash.
    ///
    /// The pre-image excludes committed seals: the hash must be identical
    /// before and after commit seals are aggregated into the header, or
    /// validators could never agree on what they are sealing.
    pub fn compute_hash(&mut self) -> &mut Self {
        self.hash = self.seal_hash();
        self
    }

    /// The hash validators sign: header contents with the proposer seal and
    /// committed seals stripped from the extra data. Both seals are applied
    /// after hashing, so the hash is identical before and after sealing.
    pub fn seal_hash(&self) -> Hash {
        let extra = ValidatorExtra::decode(&self.extra_data)
            .map(|mut e| {
                e.proposer_seal = None;
                e.committed_seals.clear();
                e.encode()
            })
            .unwrap_or_else(|_| self.extra_data.clone());

        #[derive(Serialize)]
        struct Preimage<'a> {
            parent_hash: &'a Hash,
            number: u64,
            timestamp: u64,
            gas_limit: u64,
            gas_used: u64,
            tx_root: &'a Hash,
            extra_data: &'a [u8],
        }

        let bytes = bincode::serialize(&Preimage {
            parent_hash: &self.parent_hash,
            number: self.number,
            timestamp: self.timestamp,
            gas_limit: self.gas_limit,
            gas_used: self.gas_used,
            tx_root: &self.tx_root,
            extra_data: &extra,
        })
        .expect("header pre-image is serializable");

        keccak256(&bytes)
    }
}

/// A full block: header plus transaction body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Block {
    /// The block header.
    pub header: Header,
    /// The transaction body.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The block number.
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// The block hash.
    pub fn hash(&self) -> Hash {
        self.header.hash
    }
}

/// Commitment over a transaction list: the digest of the concatenated
/// transaction hashes, or [`Hash::ZERO`] for an empty body.
pub fn compute_tx_root(transactions: &[Transaction]) -> Hash {
    if transactions.is_empty() {
        return Hash::ZERO;
    }
    let mut preimage = Vec::with_capacity(transactions.len() * 32);
    for tx in transactions {
        preimage.extend_from_slice(tx.hash().as_bytes());
    }
    keccak256(&preimage)
}

/// Compute a child block's gas limit from its parent's.
///
/// The limit moves toward `target` by at most `parent / 1024` per block, so
/// a proposer can never swing the limit abruptly.
pub fn calculate_gas_limit(parent_gas_limit: u64, target: u64) -> u64 {
    let delta = (parent_gas_limit / GAS_LIMIT_BOUND_DIVISOR).max(1);
    if parent_gas_limit < target {
        (parent_gas_limit + delta).min(target)
    } else if parent_gas_limit > target {
        (parent_gas_limit - delta).max(target)
    } else {
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::extra::CommittedSeal;
    use crate::hash::Address;
    use crate::Signature;

    #[test]
    fn gas_limit_converges_to_target() {
        let mut limit = 8_000_000u64;
        let target = 8_100_000u64;
        for _ in 0..20 {
            limit = calculate_gas_limit(limit, target);
        }
        assert!(limit > 8_000_000 && limit <= target);

        let mut limit = target;
        for _ in 0..10_000 {
            limit = calculate_gas_limit(limit, 8_000_000);
        }
        assert_eq!(limit, 8_000_000);
    }

    #[test]
    fn gas_limit_step_is_bounded() {
        let parent = 8_000_000u64;
        let next = calculate_gas_limit(parent, u64::MAX / 2);
        assert_eq!(next, parent + parent / 1024);
    }

    #[test]
    fn hash_ignores_committed_seals() {
        let key = KeyPair::from_seed([1u8; 32]);
        let mut extra = ValidatorExtra::new(vec![key.address()]);
        let mut header = Header {
            number: 7,
            extra_data: extra.encode(),
            ..Default::default()
        };
        header.compute_hash();
        let before = header.hash;

        extra.committed_seals.push(CommittedSeal {
            signer: Address::ZERO,
            signature: Signature::zero(),
        });
        header.extra_data = extra.encode();
        header.compute_hash();

        assert_eq!(before, header.hash);
    }

    #[test]
    fn empty_body_has_zero_tx_root() {
        assert_eq!(compute_tx_root(&[]), Hash::ZERO);
    }
}
