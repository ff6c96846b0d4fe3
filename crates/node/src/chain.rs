//! In-memory chain and transfer-level execution.
//!
//! Persistent storage and the EVM are external collaborators; this module
//! provides the chain and world state the node actually runs against in
//! dev mode and in tests. Execution is transfer-level: a transaction moves
//! value, bumps the sender nonce, and consumes its intrinsic gas.

use ember_ibft::{
    BlockchainInterface, ChainError, ExecutorFactory, Transition, TransitionError,
};
use ember_txpool::{AccountInfo, StateLookup};
use ember_types::{
    calculate_gas_limit, Address, Block, Header, PublicKey, Transaction, ValidatorExtra,
    ValidatorInfo, ValidatorSet,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Intrinsic gas of a plain transfer.
const TX_GAS: u64 = 21_000;

/// Gas charged per byte of call data.
const TX_DATA_GAS: u64 = 16;

fn intrinsic_gas(tx: &Transaction) -> u64 {
    TX_GAS + tx.input.len() as u64 * TX_DATA_GAS
}

type WorldState = HashMap<Address, AccountInfo>;

struct ChainInner {
    headers: HashMap<u64, Header>,
    blocks: HashMap<u64, Block>,
    head: u64,
    /// World-state snapshot after each block.
    states: HashMap<u64, WorldState>,
}

/// An in-memory blockchain with per-block world-state snapshots.
pub struct InMemoryChain {
    inner: RwLock<ChainInner>,
    /// Known validator keys, for seal verification against header-embedded
    /// validator addresses.
    registry: HashMap<Address, PublicKey>,
    target_gas_limit: u64,
    epoch_size: u64,
}

impl InMemoryChain {
    /// Create a chain with a genesis block embedding `validators` and
    /// pre-mining `premine` balances.
    pub fn new(
        validators: ValidatorSet,
        premine: &[(Address, u128)],
        target_gas_limit: u64,
        epoch_size: u64,
    ) -> Arc<Self> {
        let mut genesis = Header {
            number: 0,
            gas_limit: target_gas_limit,
            extra_data: ValidatorExtra::new(validators.addresses().collect()).encode(),
            ..Default::default()
        };
        genesis.compute_hash();

        let mut state = WorldState::new();
        for (address, balance) in premine {
            state.insert(
                *address,
                AccountInfo {
                    nonce: 0,
                    balance: *balance,
                },
            );
        }

        let registry = validators
            .addresses()
            .filter_map(|addr| validators.public_key(&addr).map(|pk| (addr, *pk)))
            .collect();

        Arc::new(Self {
            inner: RwLock::new(ChainInner {
                headers: HashMap::from([(0, genesis)]),
                blocks: HashMap::new(),
                head: 0,
                states: HashMap::from([(0, state)]),
            }),
            registry,
            target_gas_limit,
            epoch_size: epoch_size.max(1),
        })
    }

    /// Current head number.
    pub fn head_number(&self) -> u64 {
        self.inner.read().head
    }

    /// Current head header.
    pub fn head_header(&self) -> Header {
        let inner = self.inner.read();
        inner
            .headers
            .get(&inner.head)
            .cloned()
            .unwrap_or_default()
    }

    /// A full block by number.
    pub fn get_block(&self, number: u64) -> Option<Block> {
        self.inner.read().blocks.get(&number).cloned()
    }

    /// The block number a transaction was included in, if any.
    pub fn find_transaction(&self, hash: ember_types::Hash) -> Option<u64> {
        let inner = self.inner.read();
        inner
            .blocks
            .values()
            .find(|b| b.transactions.iter().any(|tx| tx.hash() == hash))
            .map(|b| b.number())
    }

    /// Account state at the current head.
    pub fn account_at_head(&self, address: &Address) -> AccountInfo {
        let inner = self.inner.read();
        inner
            .states
            .get(&inner.head)
            .and_then(|s| s.get(address))
            .copied()
            .unwrap_or_default()
    }

    fn state_at(&self, number: u64) -> WorldState {
        self.inner
            .read()
            .states
            .get(&number)
            .cloned()
            .unwrap_or_default()
    }
}

impl BlockchainInterface for InMemoryChain {
    fn header(&self) -> Header {
        self.head_header()
    }

    fn get_header_by_number(&self, number: u64) -> Option<Header> {
        self.inner.read().headers.get(&number).cloned()
    }

    fn write_block(&self, block: &Block) -> Result<(), ChainError> {
        let mut inner = self.inner.write();
        let number = block.number();

        // Re-applying an already-written block is a no-op; sync delivery is
        // at-least-once.
        if let Some(existing) = inner.headers.get(&number) {
            if existing.hash == block.header.hash {
                return Ok(());
            }
            if number <= inner.head {
                return Err(ChainError::WriteFailed(format!(
                    "conflicting block at {number}"
                )));
            }
        }
        if number != inner.head + 1 {
            return Err(ChainError::WriteFailed(format!(
                "non-sequential block {number} on head {}",
                inner.head
            )));
        }

        // Roll the world state forward.
        let mut exec = SimpleTransition {
            state: inner
                .states
                .get(&(number - 1))
                .cloned()
                .unwrap_or_default(),
            gas_left: block.header.gas_limit,
            gas_used: 0,
        };
        for tx in &block.transactions {
            if let Err(e) = exec.write(tx) {
                // The packer already filtered these; a failure here means a
                // peer block carried something our state disagrees with.
                warn!(tx = ?tx.hash(), error = %e, "transaction skipped at apply time");
            }
        }

        inner.states.insert(number, exec.state);
        inner.headers.insert(number, block.header.clone());
        inner.blocks.insert(number, block.clone());
        inner.head = number;
        debug!(number, transactions = block.transactions.len(), "block written");
        Ok(())
    }

    fn verify_potential_block(&self, block: &Block) -> Result<(), ChainError> {
        let head = self.header();
        if block.number() != head.number + 1 {
            return Err(ChainError::Verification(format!(
                "expected number {}, got {}",
                head.number + 1,
                block.number()
            )));
        }
        if block.header.parent_hash != head.hash {
            return Err(ChainError::Verification("parent hash mismatch".into()));
        }
        let declared: u64 = block.transactions.iter().map(|tx| tx.gas).sum();
        if declared > block.header.gas_limit {
            return Err(ChainError::Verification("block over its gas limit".into()));
        }
        for tx in &block.transactions {
            if !tx.verify_signature() {
                return Err(ChainError::Verification(format!(
                    "invalid signature on {}",
                    tx.hash()
                )));
            }
        }
        Ok(())
    }

    fn calculate_gas_limit(&self, number: u64) -> Result<u64, ChainError> {
        let parent = self
            .get_header_by_number(number.saturating_sub(1))
            .ok_or(ChainError::UnknownBlock(number.saturating_sub(1)))?;
        Ok(calculate_gas_limit(parent.gas_limit, self.target_gas_limit))
    }

    fn validator_set(&self, number: u64) -> ValidatorSet {
        // Validators rotate at epoch boundaries from header-embedded data.
        let epoch_start = number.saturating_sub(1) / self.epoch_size * self.epoch_size;
        let Some(header) = self.get_header_by_number(epoch_start) else {
            return ValidatorSet::default();
        };
        let Ok(extra) = ValidatorExtra::decode(&header.extra_data) else {
            return ValidatorSet::default();
        };
        ValidatorSet::new(
            extra
                .validators
                .iter()
                .filter_map(|addr| {
                    self.registry.get(addr).map(|pk| ValidatorInfo {
                        address: *addr,
                        public_key: *pk,
                    })
                })
                .collect(),
        )
    }
}

impl ember_sync::ChainAccess for InMemoryChain {
    fn header(&self) -> Header {
        self.head_header()
    }

    fn write_block(&self, block: &Block) -> Result<(), String> {
        BlockchainInterface::write_block(self, block).map_err(|e| e.to_string())
    }
}

impl StateLookup for InMemoryChain {
    fn account(&self, header: &Header, address: &Address) -> AccountInfo {
        self.inner
            .read()
            .states
            .get(&header.number)
            .and_then(|s| s.get(address))
            .copied()
            .unwrap_or_default()
    }
}

/// Transfer-level executor over the chain's world state.
pub struct SimpleExecutor {
    chain: Arc<InMemoryChain>,
}

impl SimpleExecutor {
    /// New executor reading parent state from `chain`.
    pub fn new(chain: Arc<InMemoryChain>) -> Self {
        Self { chain }
    }
}

impl ExecutorFactory for SimpleExecutor {
    fn begin(&self, parent: &Header, header: &Header) -> Box<dyn Transition> {
        Box::new(SimpleTransition {
            state: self.chain.state_at(parent.number),
            gas_left: header.gas_limit,
            gas_used: 0,
        })
    }
}

/// One in-flight block over a copied world-state snapshot.
///
/// Block gas is reserved at a transaction's declared limit but consumed at
/// its intrinsic cost, so unused gas is released back to the block.
struct SimpleTransition {
    state: WorldState,
    gas_left: u64,
    gas_used: u64,
}

impl Transition for SimpleTransition {
    fn write(&mut self, tx: &Transaction) -> Result<(), TransitionError> {
        let account = self.state.get(&tx.from).copied().unwrap_or_default();
        if tx.nonce < account.nonce {
            return Err(TransitionError::NotExecutable("stale nonce".into()));
        }
        if tx.nonce > account.nonce {
            return Err(TransitionError::Recoverable {
                correct_nonce: account.nonce,
            });
        }
        if tx.gas > self.gas_left {
            return Err(TransitionError::GasLimitReached);
        }

        let used = intrinsic_gas(tx);
        let fee = used as u128 * tx.gas_price as u128;
        let cost = tx.value.saturating_add(fee);
        if cost > account.balance {
            return Err(TransitionError::NotExecutable(
                "insufficient balance at apply time".into(),
            ));
        }

        let sender = self.state.entry(tx.from).or_default();
        sender.nonce = tx.nonce + 1;
        sender.balance -= cost;
        if let Some(to) = tx.to {
            self.state.entry(to).or_default().balance += tx.value;
        }

        self.gas_left -= used;
        self.gas_used += used;
        Ok(())
    }

    fn write_failed_receipt(&mut self, _tx: &Transaction) -> Result<(), TransitionError> {
        // Receipt storage is external; nothing to record here.
        Ok(())
    }

    fn gas_used(&self) -> u64 {
        self.gas_used
    }
}
