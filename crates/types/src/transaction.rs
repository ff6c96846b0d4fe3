//! Signed account transactions.

use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::hash::{keccak256, Address, Hash};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// One pool slot covers this many encoded bytes. A transaction occupies
/// `ceil(size / TX_SLOT_SIZE)` slots.
pub const TX_SLOT_SIZE: u64 = 32 * 1024;

/// Transactions whose encoded size exceeds this are rejected outright.
pub const TX_MAX_SIZE: u64 = 128 * 1024;

/// Sender signature envelope.
///
/// The signer's public key travels with the signature so the sender address
/// can be checked against it without a key registry.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxSignature {
    /// Public key of the signer.
    pub public_key: PublicKey,
    /// Signature over the transaction's signing payload.
    pub signature: Signature,
}

/// A signed transaction. Immutable after construction; identified by its
/// content-addressed hash.
#[derive(Serialize, Deserialize)]
pub struct Transaction {
    /// Sender account nonce.
    pub nonce: u64,
    /// Price per unit of gas.
    pub gas_price: u64,
    /// Gas limit for execution.
    pub gas: u64,
    /// Recipient; `None` deploys a contract.
    pub to: Option<Address>,
    /// Native value transferred.
    pub value: u128,
    /// Call data.
    pub input: Vec<u8>,
    /// Sender address. Must match the signature's public key.
    pub from: Address,
    /// Sender signature.
    pub signature: TxSignature,

    /// Cached hash (computed on first access).
    #[serde(skip)]
    hash: OnceLock<Hash>,
}

// Manual Clone - OnceLock is not Clone; carry the cached hash over if present.
impl Clone for Transaction {
    fn clone(&self) -> Self {
        let hash = OnceLock::new();
        if let Some(h) = self.hash.get() {
            let _ = hash.set(*h);
        }
        Self {
            nonce: self.nonce,
            gas_price: self.gas_price,
            gas: self.gas,
            to: self.to,
            value: self.value,
            input: self.input.clone(),
            from: self.from,
            signature: self.signature,
            hash,
        }
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Transaction {}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("hash", &self.hash())
            .field("from", &self.from)
            .field("nonce", &self.nonce)
            .field("gas_price", &self.gas_price)
            .field("gas", &self.gas)
            .finish_non_exhaustive()
    }
}

/// Fields covered by the sender signature.
#[derive(Serialize)]
struct SigningPayload<'a> {
    nonce: u64,
    gas_price: u64,
    gas: u64,
    to: &'a Option<Address>,
    value: u128,
    input: &'a [u8],
}

impl Transaction {
    /// Build and sign a transaction with the given key. The sender address
    /// is derived from the key.
    #[allow(clippy::too_many_arguments)]
    pub fn signed(
        key: &KeyPair,
        nonce: u64,
        gas_price: u64,
        gas: u64,
        to: Option<Address>,
        value: u128,
        input: Vec<u8>,
    ) -> Self {
        let payload = signing_bytes(nonce, gas_price, gas, &to, value, &input);
        let signature = TxSignature {
            public_key: key.public_key(),
            signature: key.sign(&payload),
        };
        Self {
            nonce,
            gas_price,
            gas,
            to,
            value,
            input,
            from: key.address(),
            signature,
            hash: OnceLock::new(),
        }
    }

    /// The signing payload bytes for this transaction.
    fn signing_payload(&self) -> Vec<u8> {
        signing_bytes(
            self.nonce,
            self.gas_price,
            self.gas,
            &self.to,
            self.value,
            &self.input,
        )
    }

    /// The transaction hash (content-addressed, covers payload and signature).
    pub fn hash(&self) -> Hash {
        *self.hash.get_or_init(|| {
            let mut preimage = self.signing_payload();
            preimage.extend_from_slice(self.signature.signature.as_bytes());
            keccak256(&preimage)
        })
    }

    /// Encoded size in bytes, as counted against pool slots.
    pub fn size(&self) -> u64 {
        // 64-byte signature + 32-byte public key + fixed scalar fields.
        (self.input.len() + 64 + 32 + 20 + 8 * 3 + 16 + 21) as u64
    }

    /// Number of pool slots this transaction occupies.
    pub fn slots(&self) -> u64 {
        self.size().div_ceil(TX_SLOT_SIZE).max(1)
    }

    /// Upper bound on what executing this transaction can cost the sender.
    pub fn cost(&self) -> u128 {
        self.value
            .saturating_add(self.gas as u128 * self.gas_price as u128)
    }

    /// Whether this single transaction can never fit in a block with the
    /// given gas limit.
    pub fn exceeds_block_gas_limit(&self, block_gas_limit: u64) -> bool {
        self.gas > block_gas_limit
    }

    /// Check that the signature is valid and matches the claimed sender.
    pub fn verify_signature(&self) -> bool {
        if self.signature.public_key.address() != self.from {
            return false;
        }
        self.signature
            .public_key
            .verify(&self.signing_payload(), &self.signature.signature)
    }
}

fn signing_bytes(
    nonce: u64,
    gas_price: u64,
    gas: u64,
    to: &Option<Address>,
    value: u128,
    input: &[u8],
) -> Vec<u8> {
    let payload = SigningPayload {
        nonce,
        gas_price,
        gas,
        to,
        value,
        input,
    };
    bincode::serialize(&payload).expect("transaction payload is serializable")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(key: &KeyPair, nonce: u64) -> Transaction {
        Transaction::signed(key, nonce, 100, 21_000, Some(Address::ZERO), 1, vec![])
    }

    #[test]
    fn hash_is_content_addressed() {
        let key = KeyPair::from_seed([1u8; 32]);
        let a = tx(&key, 0);
        let b = tx(&key, 0);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), tx(&key, 1).hash());
    }

    #[test]
    fn signature_verifies_for_derived_sender() {
        let key = KeyPair::from_seed([2u8; 32]);
        let t = tx(&key, 0);
        assert!(t.verify_signature());
    }

    #[test]
    fn tampered_sender_fails_verification() {
        let key = KeyPair::from_seed([3u8; 32]);
        let mut t = tx(&key, 0);
        t.from = Address([9u8; 20]);
        assert!(!t.verify_signature());
    }

    #[test]
    fn small_transaction_takes_one_slot() {
        let key = KeyPair::from_seed([4u8; 32]);
        assert_eq!(tx(&key, 0).slots(), 1);
    }

    #[test]
    fn large_payload_takes_multiple_slots() {
        let key = KeyPair::from_seed([5u8; 32]);
        let t = Transaction::signed(
            &key,
            0,
            100,
            21_000,
            None,
            0,
            vec![0u8; 2 * TX_SLOT_SIZE as usize],
        );
        assert!(t.slots() >= 2);
    }
}
