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

//! Data structure for storing known backoffs when pruning peers.

use std::num::NonZeroUsize;
use std::time::Duration;

use libp2p_identity::PeerId;
use lru::LruCache;
use web_time::Instant;

use crate::topic::TopicHash;

/// The maximum number of (peer, topic) backoff entries held at once. An
/// evicted entry behaves like an expired one.
const MAX_BACKOFF_ENTRIES: usize = 10_240;

/// Tracks, per peer and topic, the earliest time a regraft is allowed after a
/// prune.
pub(crate) struct BackoffStorage {
    backoffs: LruCache<(PeerId, TopicHash), Instant>,
    /// Prune backoff from the config, used for flood detection.
    prune_backoff: Duration,
    /// Graft flood threshold from the config.
    graft_flood_threshold: Duration,
}

impl BackoffStorage {
    pub(crate) fn new(prune_backoff: Duration, graft_flood_threshold: Duration) -> BackoffStorage {
        BackoffStorage {
            backoffs: LruCache::new(
                NonZeroUsize::new(MAX_BACKOFF_ENTRIES).expect("capacity is non-zero"),
            ),
            prune_backoff,
            graft_flood_threshold,
        }
    }

    /// Updates the backoff for a peer (if there is already a more restrictive
    /// backoff then this call doesn't change anything).
    pub(crate) fn update_backoff(&mut self, topic: &TopicHash, peer: &PeerId, time: Duration) {
        let instant = Instant::now() + time;
        let key = (*peer, topic.clone());
        match self.backoffs.get(&key) {
            Some(existing) if *existing >= instant => {}
            _ => {
                self.backoffs.put(key, instant);
            }
        }
    }

    /// Checks if a given peer is backoffed for the given topic.
    pub(crate) fn is_backoff(&self, topic: &TopicHash, peer: &PeerId) -> bool {
        self.backoffs
            .peek(&(*peer, topic.clone()))
            .is_some_and(|expiry| *expiry > Instant::now())
    }

    /// Checks if a graft from the peer arrived within the flood threshold of
    /// the prune that set the backoff, i.e. well before the backoff window
    /// would naturally expire.
    ///
    /// Rearranged from `now < expiry - prune_backoff + graft_flood_threshold`
    /// so that no `Instant` subtraction can underflow.
    pub(crate) fn is_flood(&self, topic: &TopicHash, peer: &PeerId) -> bool {
        self.backoffs
            .peek(&(*peer, topic.clone()))
            .is_some_and(|expiry| {
                Instant::now() + self.prune_backoff < *expiry + self.graft_flood_threshold
            })
    }

    #[cfg(test)]
    pub(crate) fn get_backoff_time(&self, topic: &TopicHash, peer: &PeerId) -> Option<Instant> {
        self.backoffs.peek(&(*peer, topic.clone())).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> BackoffStorage {
        BackoffStorage::new(Duration::from_secs(60), Duration::from_secs(10))
    }

    #[test]
    fn backoff_expires() {
        let mut backoffs = storage();
        let peer = PeerId::random();
        let topic = TopicHash::from_raw("test");

        assert!(!backoffs.is_backoff(&topic, &peer));

        backoffs.update_backoff(&topic, &peer, Duration::from_millis(20));
        assert!(backoffs.is_backoff(&topic, &peer));

        std::thread::sleep(Duration::from_millis(30));
        assert!(!backoffs.is_backoff(&topic, &peer));
    }

    #[test]
    fn backoff_is_never_shortened() {
        let mut backoffs = storage();
        let peer = PeerId::random();
        let topic = TopicHash::from_raw("test");

        backoffs.update_backoff(&topic, &peer, Duration::from_secs(120));
        let long = backoffs.get_backoff_time(&topic, &peer).unwrap();

        backoffs.update_backoff(&topic, &peer, Duration::from_secs(1));
        assert_eq!(backoffs.get_backoff_time(&topic, &peer), Some(long));
    }

    #[test]
    fn early_regraft_is_a_flood() {
        let mut backoffs = storage();
        let peer = PeerId::random();
        let topic = TopicHash::from_raw("test");

        // a standard prune backoff, probed right away
        backoffs.update_backoff(&topic, &peer, Duration::from_secs(60));
        assert!(backoffs.is_flood(&topic, &peer));

        // a backoff probed after the flood threshold would have passed
        let mut backoffs = storage();
        backoffs.update_backoff(&topic, &peer, Duration::from_millis(10));
        assert!(!backoffs.is_flood(&topic, &peer));
    }

    #[test]
    fn table_is_bounded() {
        let mut backoffs = storage();
        let topic = TopicHash::from_raw("test");
        let first = PeerId::random();
        backoffs.update_backoff(&topic, &first, Duration::from_secs(60));

        for _ in 0..MAX_BACKOFF_ENTRIES {
            backoffs.update_backoff(&topic, &PeerId::random(), Duration::from_secs(60));
        }

        // the oldest entry was evicted, which reads as no backoff
        assert!(!backoffs.is_backoff(&topic, &first));
    }
}
