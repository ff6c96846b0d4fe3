//! The sync driver: peer bookkeeping, bulk sync, watch sync.

use crate::skeleton::Skeleton;
use crate::SyncError;
use ember_types::{Block, Hash, Header, Transaction};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Peers failing this many requests stop being selected.
const MAX_PEER_FAILURES: u32 = 3;

/// Sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Blocks covered by one skeleton slot.
    pub span: u64,
    /// Skeleton slots fetched per round.
    pub num: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { span: 10, num: 16 }
    }
}

/// What the syncer needs from a peer.
pub trait SyncPeerClient: Send + Sync {
    /// Fetch up to `amount` headers starting at the block with hash
    /// `start`, with `skip` headers omitted between consecutive entries.
    /// `None` entries mark a faulty response.
    fn get_headers(
        &self,
        start: Hash,
        skip: u64,
        amount: u64,
    ) -> Result<Vec<Option<Header>>, SyncError>;

    /// Fetch block bodies by block hash, in request order.
    fn get_bodies(&self, hashes: &[Hash]) -> Result<Vec<Vec<Transaction>>, SyncError>;

    /// The peer's advertised head number.
    fn head_number(&self) -> u64;

    /// Block until the peer announces a new head, or `timeout` passes.
    fn next_head(&self, timeout: Duration) -> Option<Block>;

    /// Announce a locally sealed block to the peer.
    fn announce(&self, block: &Block);
}

/// Local chain access the syncer writes through.
pub trait ChainAccess: Send + Sync {
    /// The current head header.
    fn header(&self) -> Header;

    /// Write a fetched block. Serialized by the implementation.
    fn write_block(&self, block: &Block) -> Result<(), String>;
}

struct PeerEntry {
    client: Arc<dyn SyncPeerClient>,
    failures: u32,
}

/// The sync driver.
///
/// Tracks peers with failure counts and a session blacklist, drives
/// skeleton-based bulk sync, and follows new-head announcements in watch
/// mode. The consensus engine calls in through its syncer capability; block
/// application callbacks let the caller reset the pool once per applied
/// block.
pub struct Syncer {
    config: SyncConfig,
    chain: Arc<dyn ChainAccess>,
    peers: RwLock<HashMap<u64, PeerEntry>>,
    blacklist: RwLock<HashSet<u64>>,
}

impl Syncer {
    /// New syncer over the local chain.
    pub fn new(config: SyncConfig, chain: Arc<dyn ChainAccess>) -> Self {
        Self {
            config,
            chain,
            peers: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashSet::new()),
        }
    }

    /// Register a connected peer.
    pub fn register_peer(&self, id: u64, client: Arc<dyn SyncPeerClient>) {
        debug!(peer = id, "registered sync peer");
        self.peers
            .write()
            .insert(id, PeerEntry { client, failures: 0 });
    }

    /// Remove a disconnected peer.
    pub fn remove_peer(&self, id: u64) {
        debug!(peer = id, "removed sync peer");
        self.peers.write().remove(&id);
    }

    /// Whether a peer has been blacklisted this session.
    pub fn is_blacklisted(&self, id: u64) -> bool {
        self.blacklist.read().contains(&id)
    }

    /// The usable peer with the highest advertised head.
    pub fn best_peer(&self) -> Option<(u64, u64)> {
        let blacklist = self.blacklist.read();
        self.peers
            .read()
            .iter()
            .filter(|(id, entry)| {
                !blacklist.contains(id) && entry.failures < MAX_PEER_FAILURES
            })
            .map(|(id, entry)| (*id, entry.client.head_number()))
            .max_by_key(|(id, number)| (*number, u64::MAX - *id))
    }

    fn client(&self, id: u64) -> Result<Arc<dyn SyncPeerClient>, SyncError> {
        if self.is_blacklisted(id) {
            return Err(SyncError::NoPeer);
        }
        self.peers
            .read()
            .get(&id)
            .map(|entry| Arc::clone(&entry.client))
            .ok_or(SyncError::NoPeer)
    }

    fn record_failure(&self, id: u64, error: &SyncError) {
        if *error == SyncError::NilHeaderResponse {
            // A faulty node; nothing it sent this session can be trusted.
            warn!(peer = id, "nil header response, blacklisting peer");
            self.blacklist.write().insert(id);
            return;
        }
        if let Some(entry) = self.peers.write().get_mut(&id) {
            entry.failures += 1;
        }
    }

    /// Bulk-sync with a peer until its advertised head is reached.
    /// `handler` runs exactly once per block applied to the local chain.
    pub fn bulk_sync_with_peer(
        &self,
        peer_id: u64,
        handler: &mut dyn FnMut(&Block),
    ) -> Result<(), SyncError> {
        let result = self.bulk_sync_inner(peer_id, handler);
        if let Err(e) = &result {
            self.record_failure(peer_id, e);
        }
        result
    }

    fn bulk_sync_inner(
        &self,
        peer_id: u64,
        handler: &mut dyn FnMut(&Block),
    ) -> Result<(), SyncError> {
        let client = self.client(peer_id)?;

        loop {
            let local = self.chain.header();
            let target = client.head_number();
            if target <= local.number {
                info!(peer = peer_id, head = local.number, "bulk sync caught up");
                return Ok(());
            }

            let mut skeleton = Skeleton::new(self.config.span, self.config.num);
            skeleton.build(client.as_ref(), local.hash)?;
            for index in 0..skeleton.slot_count() {
                skeleton.fill_slot(index, client.as_ref())?;
            }

            let blocks = skeleton.into_blocks();
            if blocks.is_empty() {
                return Ok(());
            }
            debug!(peer = peer_id, blocks = blocks.len(), "applying synced blocks");
            for block in &blocks {
                self.chain
                    .write_block(block)
                    .map_err(SyncError::WriteFailed)?;
                handler(block);
            }
        }
    }

    /// Follow a peer's new-head announcements, writing each into the local
    /// chain. `handler` runs exactly once per applied block and returns
    /// `true` to stop watching. Returns when the peer goes quiet for
    /// `block_timeout`.
    pub fn watch_sync_with_peer(
        &self,
        peer_id: u64,
        handler: &mut dyn FnMut(&Block) -> bool,
        block_timeout: Duration,
    ) {
        let Ok(client) = self.client(peer_id) else {
            return;
        };
        loop {
            let Some(block) = client.next_head(block_timeout) else {
                debug!(peer = peer_id, "no new heads before timeout");
                return;
            };
            if let Err(e) = self.chain.write_block(&block) {
                warn!(peer = peer_id, error = %e, "failed to apply announced block");
                return;
            }
            if handler(&block) {
                return;
            }
        }
    }

    /// Announce a sealed block to every usable peer.
    pub fn broadcast(&self, block: &Block) {
        let blacklist = self.blacklist.read();
        for (id, entry) in self.peers.read().iter() {
            if !blacklist.contains(id) {
                entry.client.announce(block);
            }
        }
    }
}
