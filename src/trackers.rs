// Copyright 2020 Sigma Prime Pty Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Per-heartbeat counters of gossip exchanged with each peer.

use std::num::NonZeroUsize;

use libp2p_identity::PeerId;
use lru::LruCache;

/// The maximum number of peers tracked per heartbeat window. Counters of
/// evicted peers restart at zero, which only ever relaxes a limit.
const MAX_TRACKED_PEERS: usize = 256;

/// A bounded per-peer counter, reset at every heartbeat.
///
/// One instance counts IHAVE messages received from each peer, another the
/// message ids we asked each peer for through IWANT.
pub(crate) struct CounterTable {
    counts: LruCache<PeerId, usize>,
}

impl CounterTable {
    pub(crate) fn new() -> Self {
        CounterTable {
            counts: LruCache::new(NonZeroUsize::new(MAX_TRACKED_PEERS).expect("capacity is non-zero")),
        }
    }

    /// Adds `n` to the peer's counter and returns the new value.
    pub(crate) fn add(&mut self, peer: &PeerId, n: usize) -> usize {
        match self.counts.get_mut(peer) {
            Some(count) => {
                *count += n;
                *count
            }
            None => {
                self.counts.put(*peer, n);
                n
            }
        }
    }

    pub(crate) fn get(&self, peer: &PeerId) -> usize {
        self.counts.peek(peer).copied().unwrap_or(0)
    }

    /// Clears all counters at the start of a heartbeat window.
    pub(crate) fn clear(&mut self) {
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_and_reset() {
        let mut table = CounterTable::new();
        let peer = PeerId::random();

        assert_eq!(table.get(&peer), 0);
        assert_eq!(table.add(&peer, 1), 1);
        assert_eq!(table.add(&peer, 3), 4);
        assert_eq!(table.get(&peer), 4);

        table.clear();
        assert_eq!(table.get(&peer), 0);
    }

    #[test]
    fn table_is_bounded() {
        let mut table = CounterTable::new();
        let first = PeerId::random();
        table.add(&first, 7);

        for _ in 0..MAX_TRACKED_PEERS {
            table.add(&PeerId::random(), 1);
        }

        assert_eq!(table.get(&first), 0);
    }
}
