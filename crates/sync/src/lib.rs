//! Block synchronization.
//!
//! Two phases bring a node up to date:
//!
//! 1. **Skeleton build**: fetch sparse anchor headers with a fixed stride
//!    from a known ancestor, validating that the stride is uniform.
//! 2. **Slot fill**: fetch each slot's contiguous header range, then the
//!    bodies of every header that carries transactions, and reassemble the
//!    blocks.
//!
//! A nil header anywhere in a response poisons the peer: it is blacklisted
//! for the session and another peer is tried. Watch sync follows new-head
//! announcements once the bulk phase has nothing left to fetch.

mod skeleton;
mod syncer;

pub use skeleton::Skeleton;
pub use syncer::{ChainAccess, SyncConfig, SyncPeerClient, Syncer};

use thiserror::Error;

/// Sync failure modes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A peer returned a nil header; the whole response is untrustworthy.
    #[error("header response is nil")]
    NilHeaderResponse,
    /// Skeleton anchor headers are not uniformly spaced.
    #[error("bad skeleton diff")]
    BadSkeletonDiff,
    /// A peer request failed.
    #[error("peer request failed: {0}")]
    Request(String),
    /// Writing a fetched block to the local chain failed.
    #[error("block write failed: {0}")]
    WriteFailed(String),
    /// The peer is unknown or blacklisted.
    #[error("no usable peer")]
    NoPeer,
}
