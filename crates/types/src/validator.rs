//! Validator set and proposer selection.

use crate::crypto::PublicKey;
use crate::hash::Address;
use serde::{Deserialize, Serialize};

/// A validator's identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    /// Validator address.
    pub address: Address,
    /// Verification key for seals and consensus messages.
    pub public_key: PublicKey,
}

/// Ordered validator set for an epoch.
///
/// Order is significant: proposer selection is a deterministic round-robin
/// over this ordering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ValidatorSet {
    validators: Vec<ValidatorInfo>,
}

impl ValidatorSet {
    /// Create a set from an ordered list of validators.
    pub fn new(validators: Vec<ValidatorInfo>) -> Self {
        Self { validators }
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// The ordered validator addresses.
    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.validators.iter().map(|v| v.address)
    }

    /// Whether `address` is a member.
    pub fn contains(&self, address: &Address) -> bool {
        self.index_of(address).is_some()
    }

    /// Position of `address` in the set.
    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.validators.iter().position(|v| v.address == *address)
    }

    /// Verification key for a member.
    pub fn public_key(&self, address: &Address) -> Option<&PublicKey> {
        self.validators
            .iter()
            .find(|v| v.address == *address)
            .map(|v| &v.public_key)
    }

    /// Maximum number of Byzantine validators the set tolerates:
    /// `f = (n - 1) / 3`.
    pub fn max_faulty(&self) -> usize {
        self.validators.len().saturating_sub(1) / 3
    }

    /// Votes required to progress a consensus phase: `2f + 1`.
    pub fn quorum_size(&self) -> usize {
        2 * self.max_faulty() + 1
    }

    /// Select the proposer for a round.
    ///
    /// Round-robin from the slot after `last_proposer`, offset by `round`.
    /// With no previous proposer (genesis) the offset counts from slot zero.
    pub fn proposer(&self, last_proposer: Option<Address>, round: u64) -> Option<Address> {
        if self.validators.is_empty() {
            return None;
        }
        let seed = match last_proposer.and_then(|p| self.index_of(&p)) {
            Some(idx) => idx as u64 + 1 + round,
            None => round,
        };
        let pick = (seed % self.validators.len() as u64) as usize;
        Some(self.validators[pick].address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn set_of(n: u8) -> (ValidatorSet, Vec<Address>) {
        let infos: Vec<ValidatorInfo> = (0..n)
            .map(|i| {
                let key = KeyPair::from_seed([i + 1; 32]);
                ValidatorInfo {
                    address: key.address(),
                    public_key: key.public_key(),
                }
            })
            .collect();
        let addrs = infos.iter().map(|v| v.address).collect();
        (ValidatorSet::new(infos), addrs)
    }

    #[test]
    fn quorum_math() {
        let (set, _) = set_of(4);
        assert_eq!(set.max_faulty(), 1);
        assert_eq!(set.quorum_size(), 3);

        let (set, _) = set_of(7);
        assert_eq!(set.max_faulty(), 2);
        assert_eq!(set.quorum_size(), 5);

        let (set, _) = set_of(1);
        assert_eq!(set.max_faulty(), 0);
        assert_eq!(set.quorum_size(), 1);
    }

    #[test]
    fn proposer_rotates_per_round() {
        let (set, addrs) = set_of(4);
        assert_eq!(set.proposer(None, 0), Some(addrs[0]));
        assert_eq!(set.proposer(None, 1), Some(addrs[1]));
        assert_eq!(set.proposer(Some(addrs[0]), 0), Some(addrs[1]));
        assert_eq!(set.proposer(Some(addrs[3]), 0), Some(addrs[0]));
        assert_eq!(set.proposer(Some(addrs[1]), 2), Some(addrs[0]));
    }

    #[test]
    fn proposer_of_empty_set_is_none() {
        let set = ValidatorSet::default();
        assert_eq!(set.proposer(None, 0), None);
    }
}
