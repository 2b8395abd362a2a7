//! Bounded change-detection cache.
//!
//! Maps a transaction hash to a fingerprint of the metadata fields the daemon
//! monitors. A cache hit with an equal fingerprint means the event carries no
//! observable change and can be acknowledged without touching the database.
//! A false fingerprint match would silently skip a genuinely changed
//! transaction, so the fingerprint must be collision resistant.
use std::{
    fmt,
    num::NonZeroUsize,
    sync::Mutex,
};

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::events::{TxId, TxMetadata};

/// Stable hash over `{voided_by, first_block, height}`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint([u8; 32]);

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(self.0))
    }
}

/// Computes the fingerprint of a metadata snapshot.
///
/// Fields are fed into the hash with explicit separators and length-free
/// markers so that e.g. a `voided_by` entry can never collide with a
/// `first_block` entry.
pub fn fingerprint(metadata: &TxMetadata) -> Fingerprint {
    let mut hasher = Sha256::new();
    for id in &metadata.voided_by {
        hasher.update(id.as_bytes());
        hasher.update([0x00]);
    }
    hasher.update([0x01]);
    if let Some(first_block) = &metadata.first_block {
        for id in first_block {
            hasher.update(id.as_bytes());
            hasher.update([0x00]);
        }
    }
    hasher.update([0x02]);
    match metadata.height {
        Some(h) => hasher.update(h.to_be_bytes()),
        None => hasher.update([0x03]),
    }
    Fingerprint(hasher.finalize().into())
}

/// Strict-LRU cache from transaction hash to metadata fingerprint.
///
/// Capacity is fixed at construction; both `get` and `insert` promote the key
/// to most-recently-used, and inserting beyond capacity evicts exactly the
/// least-recently-used entry. The cache is shared behind `Arc` but mutated
/// only by the single active state machine, the mutex merely satisfies the
/// borrow checker for the promoting reads.
pub struct TxCache {
    inner: Mutex<LruCache<TxId, Fingerprint>>,
}

impl TxCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    /// Looks up a fingerprint, promoting the key on hit.
    pub fn get(&self, tx_id: &str) -> Option<Fingerprint> {
        self.lock().get(tx_id).copied()
    }

    /// Inserts or overwrites a fingerprint, promoting the key and evicting
    /// the least-recently-used entry if the capacity is exceeded.
    pub fn insert(&self, tx_id: TxId, fp: Fingerprint) {
        self.lock().put(tx_id, fp);
    }

    /// Returns the current least-recently-used key.
    pub fn lru(&self) -> Option<TxId> {
        self.lock()
            .peek_lru()
            .map(|(k, _)| k.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<TxId, Fingerprint>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
