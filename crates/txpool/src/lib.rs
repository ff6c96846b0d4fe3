//! Transaction pool.
//!
//! The pool tracks per-sender ordered queues of signed transactions and
//! feeds the block packer a stable view of everything executable. It
//! handles:
//!
//! - Admission (signature, size, nonce, balance, price-floor checks)
//! - Promotion between the gapped future queue and the executable pending run
//! - Slot accounting and price-based eviction under pressure
//! - Demotion, drops and re-basing after new blocks or sync
//!
//! Mutators serialize on an internal lock; `pending()` hands out a cloned
//! snapshot so readers never block the admission path for long.

mod account;
mod event;
mod operator;
mod pool;

pub use account::{AccountQueue, EnqueueOutcome};
pub use event::PoolEvent;
pub use operator::{PoolOperator, PoolStatus};
pub use pool::{AccountInfo, PoolConfig, PoolError, StateLookup, TxOrigin, TxPool};
