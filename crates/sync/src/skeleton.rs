//! Skeleton-first header fetching.

use crate::syncer::SyncPeerClient;
use crate::SyncError;
use ember_types::{Block, Hash, Header};
use tracing::trace;

/// Fetch headers from a peer, rejecting responses with nil entries.
///
/// `get_headers(start, skip, amount)` returns headers following `start`:
/// the first is the block immediately after it, and consecutive entries are
/// separated by `skip` headers.
fn get_headers(
    client: &dyn SyncPeerClient,
    start: Hash,
    skip: u64,
    amount: u64,
) -> Result<Vec<Header>, SyncError> {
    let response = client.get_headers(start, skip, amount)?;
    response
        .into_iter()
        // A nil header comes from a faulty node; reject all of its blocks.
        .map(|h| h.ok_or(SyncError::NilHeaderResponse))
        .collect()
}

/// One skeleton slot: an anchor header and the span of blocks it leads.
#[derive(Debug)]
struct Slot {
    anchor: Header,
    blocks: Vec<Block>,
}

/// A sparse header skeleton over the range being synced.
///
/// The anchors are fetched with stride `span` starting right after the
/// common ancestor, so slot `k` covers the contiguous block range
/// `[ancestor + 1 + k*span, ancestor + (k+1)*span]` with no gaps.
#[derive(Debug)]
pub struct Skeleton {
    slots: Vec<Slot>,
    span: u64,
    num: u64,
}

impl Skeleton {
    /// A skeleton of `num` slots, each covering `span` blocks.
    pub fn new(span: u64, num: u64) -> Self {
        Self {
            slots: Vec::new(),
            span,
            num,
        }
    }

    /// Number of slots fetched by [`build`](Self::build).
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// The last header across all filled slots.
    pub fn last_header(&self) -> Option<&Header> {
        let slot = self.slots.last()?;
        slot.blocks.last().map(|b| &b.header)
    }

    /// Fetch the anchor headers. `ancestor` is the latest common block, so
    /// the first anchor is the block right after it.
    pub fn build(&mut self, client: &dyn SyncPeerClient, ancestor: Hash) -> Result<(), SyncError> {
        let headers = get_headers(client, ancestor, self.span - 1, self.num)?;
        self.add_skeleton(headers)
    }

    /// Validate anchor spacing and lay out the slots.
    fn add_skeleton(&mut self, headers: Vec<Header>) -> Result<(), SyncError> {
        let mut diff = 0u64;
        for pair in headers.windows(2) {
            let elem_diff = pair[1].number.saturating_sub(pair[0].number);
            if diff == 0 {
                diff = elem_diff;
            } else if elem_diff != diff {
                return Err(SyncError::BadSkeletonDiff);
            }
        }

        self.slots = headers
            .into_iter()
            .map(|anchor| Slot {
                anchor,
                blocks: Vec::new(),
            })
            .collect();
        Ok(())
    }

    /// Fill one slot: fetch the headers behind its anchor, then bodies for
    /// every header that carries transactions, batched by hash.
    pub fn fill_slot(
        &mut self,
        index: usize,
        client: &dyn SyncPeerClient,
    ) -> Result<(), SyncError> {
        let span = self.span;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| SyncError::Request(format!("slot {index} out of range")))?;

        let mut headers = vec![slot.anchor.clone()];
        if span > 1 {
            headers.extend(get_headers(client, slot.anchor.hash, 0, span - 1)?);
        }
        trace!(
            slot = index,
            anchor = slot.anchor.number,
            headers = headers.len(),
            "filling slot"
        );

        slot.blocks = headers
            .iter()
            .map(|h| Block {
                header: h.clone(),
                transactions: Vec::new(),
            })
            .collect();

        let mut body_hashes = Vec::with_capacity(headers.len());
        let mut body_index = Vec::with_capacity(headers.len());
        for (i, header) in headers.iter().enumerate() {
            if !header.tx_root.is_zero() {
                body_hashes.push(header.hash);
                body_index.push(i);
            }
        }

        if body_hashes.is_empty() {
            return Ok(());
        }

        let bodies = client.get_bodies(&body_hashes)?;
        for (i, body) in bodies.into_iter().enumerate() {
            if let Some(&block_index) = body_index.get(i) {
                slot.blocks[block_index].transactions = body;
            }
        }

        Ok(())
    }

    /// All fetched blocks in chain order.
    pub fn into_blocks(self) -> Vec<Block> {
        self.slots
            .into_iter()
            .flat_map(|slot| slot.blocks)
            .collect()
    }
}
