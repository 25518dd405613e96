//! Replay detection over recently accepted nonces.

use std::collections::HashSet;
use std::mem;

/// Acceptances per bucket before the window rolls.
pub const NONCE_BUCKET_SIZE: usize = 128;

/// Dual-bucket set of accepted nonces.
///
/// Lookup probes at most `2 * NONCE_BUCKET_SIZE` entries and insertion is
/// O(1); eviction is a bucket swap every `NONCE_BUCKET_SIZE` acceptances
/// instead of per-datagram comparisons against an exact sliding window.
/// Every nonce accepted within the last `NONCE_BUCKET_SIZE` acceptances is
/// guaranteed detected; the oldest retained nonce is at most
/// `2 * NONCE_BUCKET_SIZE - 1` acceptances behind the newest.
pub struct ReplayWindow {
    bucket0: HashSet<u64>,
    bucket1: HashSet<u64>,
    fill: usize,
}

impl ReplayWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self {
            bucket0: HashSet::with_capacity(NONCE_BUCKET_SIZE),
            bucket1: HashSet::with_capacity(NONCE_BUCKET_SIZE),
            fill: 0,
        }
    }

    /// Accept `nonce` if unseen, recording it; returns false on a replay.
    ///
    /// The older bucket is probed first: fresh nonces miss both probes, so
    /// the common in-order case costs a constant two lookups.
    pub fn check(&mut self, nonce: u64) -> bool {
        if self.bucket1.contains(&nonce) || self.bucket0.contains(&nonce) {
            return false;
        }
        self.bucket0.insert(nonce);
        self.fill += 1;
        if self.fill == NONCE_BUCKET_SIZE {
            self.bucket1 = mem::replace(
                &mut self.bucket0,
                HashSet::with_capacity(NONCE_BUCKET_SIZE),
            );
            self.fill = 0;
        }
        true
    }

    /// Forget all recorded nonces.
    pub fn clear(&mut self) {
        self.bucket0.clear();
        self.bucket1.clear();
        self.fill = 0;
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}
