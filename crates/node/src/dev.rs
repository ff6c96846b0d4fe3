//! Dev consensus: fixed-interval sealing without voting.
//!
//! One node, no quorum. Blocks flow through the same packer and pool
//! bookkeeping as IBFT proposals, which is what makes this mode useful for
//! integration setups.

use crate::chain::InMemoryChain;
use crate::timers::{TimerId, TimerManager};
use ember_ibft::{
    write_transactions, BlockchainInterface, ChainError, ExecutorFactory, TxPoolInterface,
};
use ember_types::{compute_tx_root, Block, Hash, Header, KeyPair, ValidatorExtra};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Seals blocks from the pool on demand or on a fixed interval.
pub struct DevSealer {
    chain: Arc<InMemoryChain>,
    pool: Arc<dyn TxPoolInterface>,
    executor: Arc<dyn ExecutorFactory>,
    key: KeyPair,
}

impl DevSealer {
    /// New sealer writing to `chain` with `key`.
    pub fn new(
        chain: Arc<InMemoryChain>,
        pool: Arc<dyn TxPoolInterface>,
        executor: Arc<dyn ExecutorFactory>,
        key: KeyPair,
    ) -> Self {
        Self {
            chain,
            pool,
            executor,
            key,
        }
    }

    /// Pack, seal and write one block. Returns the sealed block.
    pub fn seal_block(&self) -> Result<Block, ChainError> {
        let parent = self.chain.head_header();
        let number = parent.number + 1;
        let gas_limit = self.chain.calculate_gas_limit(number)?;

        let mut header = Header {
            parent_hash: parent.hash,
            number,
            timestamp: unix_now().max(parent.timestamp + 1),
            gas_limit,
            gas_used: 0,
            tx_root: Hash::ZERO,
            extra_data: ValidatorExtra::new(vec![self.key.address()]).encode(),
            hash: Hash::ZERO,
        };

        let mut transition = self.executor.begin(&parent, &header);
        let outcome = write_transactions(gas_limit, self.pool.pending(), transition.as_mut());
        for tx in &outcome.dropped {
            self.pool.drop_transaction(tx);
        }
        for (sender, correct_nonce) in &outcome.demoted {
            self.pool.demote_all_promoted(sender, *correct_nonce);
        }
        header.gas_used = transition.gas_used();

        let transactions: Vec<_> = outcome.included.iter().map(|tx| (**tx).clone()).collect();
        header.tx_root = compute_tx_root(&transactions);
        header.compute_hash();

        let mut extra = ValidatorExtra::decode(&header.extra_data)
            .map_err(|e| ChainError::WriteFailed(e.to_string()))?;
        extra.write_proposer_seal(&self.key, &header.hash);
        header.extra_data = extra.encode();

        let block = Block {
            header,
            transactions,
        };
        BlockchainInterface::write_block(self.chain.as_ref(), &block)?;

        for tx in &block.transactions {
            self.pool.remove_executed(tx);
        }
        self.pool
            .reset_with_headers(std::slice::from_ref(&block.header));

        info!(
            number,
            transactions = block.transactions.len(),
            gas_used = block.header.gas_used,
            "dev block sealed"
        );
        Ok(block)
    }

    /// Seal on a fixed cadence until `shutdown` flips.
    ///
    /// A slow packing round delays the next tick rather than bursting to
    /// catch up, so one-node integration runs stay deterministic.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let (timer_tx, mut timer_rx) = mpsc::channel(4);
        let mut timers = TimerManager::new(timer_tx);
        timers.set_timer(TimerId::DevSeal, interval);

        loop {
            tokio::select! {
                fired = timer_rx.recv() => {
                    if fired.is_none() {
                        return;
                    }
                    if let Err(e) = self.seal_block() {
                        warn!(error = %e, "dev sealing failed");
                    }
                    timers.set_timer(TimerId::DevSeal, interval);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("dev sealer shutting down");
                        return;
                    }
                }
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
