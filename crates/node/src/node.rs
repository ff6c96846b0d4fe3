//! Node assembly and lifecycle.

use ember_ibft::{ChainError, Ibft, MessageQueue, SharedState, SyncPeer, SyncerInterface};
use ember_sync::Syncer;
use ember_txpool::{PoolOperator, TxPool};
use ember_types::Block;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Bridges the sync driver into the engine's syncer capability.
pub struct SyncerAdapter {
    inner: Arc<Syncer>,
}

impl SyncerAdapter {
    /// Wrap a syncer.
    pub fn new(inner: Arc<Syncer>) -> Self {
        Self { inner }
    }
}

impl SyncerInterface for SyncerAdapter {
    fn best_peer(&self) -> Option<SyncPeer> {
        self.inner
            .best_peer()
            .map(|(id, number)| SyncPeer { id, number })
    }

    fn bulk_sync_with_peer(
        &self,
        peer: &SyncPeer,
        handler: &mut dyn FnMut(&Block),
    ) -> Result<(), ChainError> {
        self.inner
            .bulk_sync_with_peer(peer.id, handler)
            .map_err(|e| ChainError::WriteFailed(e.to_string()))
    }

    fn watch_sync_with_peer(
        &self,
        peer: &SyncPeer,
        handler: &mut dyn FnMut(&Block) -> bool,
        block_timeout: Duration,
    ) {
        self.inner
            .watch_sync_with_peer(peer.id, handler, block_timeout);
    }

    fn broadcast(&self, block: &Block) {
        self.inner.broadcast(block);
    }
}

/// A running node: the consensus engine on its own thread, plus handles to
/// steer and stop it.
pub struct Node {
    operator: PoolOperator,
    shared: SharedState,
    queue: Arc<MessageQueue>,
    consensus: Option<std::thread::JoinHandle<()>>,
}

impl Node {
    /// Start the consensus engine on a dedicated thread.
    pub fn start(engine: Ibft, pool: Arc<TxPool>) -> io::Result<Self> {
        let shared = engine.shared_state();
        let queue = engine.message_queue();
        let consensus = std::thread::Builder::new()
            .name("consensus".into())
            .spawn(move || {
                let mut engine = engine;
                engine.run();
            })?;

        info!("consensus engine started");
        Ok(Self {
            operator: PoolOperator::new(pool),
            shared,
            queue,
            consensus: Some(consensus),
        })
    }

    /// The pool operator surface.
    pub fn operator(&self) -> &PoolOperator {
        &self.operator
    }

    /// The engine's message queue, for wiring a transport.
    pub fn message_queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.queue)
    }

    /// Current coarse consensus state.
    pub fn consensus_state(&self) -> ember_ibft::IbftState {
        self.shared.get()
    }

    /// Close the engine and wait up to `grace` for the consensus thread to
    /// return. Returns whether it stopped in time.
    pub fn shutdown(mut self, grace: Duration) -> bool {
        self.queue.close();
        let Some(handle) = self.consensus.take() else {
            return true;
        };

        let (done_tx, done_rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = handle.join();
            let _ = done_tx.send(());
        });
        match done_rx.recv_timeout(grace) {
            Ok(()) => true,
            Err(_) => {
                warn!("consensus thread did not stop within the grace period");
                false
            }
        }
    }
}
