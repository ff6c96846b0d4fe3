//! Core types for the emberchain node.
//!
//! This crate provides the foundational types used throughout the node:
//!
//! - **Primitives**: [`Hash`], [`Address`], cryptographic keys and signatures
//! - **Chain objects**: [`Transaction`], [`Header`], [`Block`]
//! - **Consensus types**: [`View`], [`ValidatorSet`], [`ValidatorExtra`]
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod block;
mod crypto;
mod extra;
mod hash;
mod transaction;
mod validator;
mod view;

pub use block::{calculate_gas_limit, compute_tx_root, Block, Header};
pub use crypto::{KeyPair, PublicKey, Signature};
pub use extra::{CommittedSeal, ExtraError, ValidatorExtra, IBFT_EXTRA_VANITY};
pub use hash::{keccak256, Address, Hash};
pub use transaction::{Transaction, TxSignature, TX_MAX_SIZE, TX_SLOT_SIZE};
pub use validator::{ValidatorInfo, ValidatorSet};
pub use view::View;
