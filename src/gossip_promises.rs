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

//! Tracks recently sent IWANT messages and checks if peers respond to them.
//!
//! For each IWANT we track one random requested message id.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use libp2p_identity::PeerId;
use lru::LruCache;
use rand::seq::SliceRandom;
use rand::thread_rng;
use web_time::Instant;

use crate::MessageId;

/// The maximum number of outstanding promises held at once. Evicting an
/// entry forgoes the penalty its breakage would have earned; bounded memory
/// dominates penalty completeness.
const MAX_PROMISE_ENTRIES: usize = 10_240;

/// Outstanding IWANT requests awaiting fulfilment.
///
/// Stores for each tracked peer and message id the instant when the promise
/// expires. If the peer didn't respond until then the promise is considered
/// broken and the peer penalized.
pub(crate) struct GossipPromises {
    promises: LruCache<(PeerId, MessageId), Instant>,
}

impl Default for GossipPromises {
    fn default() -> Self {
        GossipPromises {
            promises: LruCache::new(
                NonZeroUsize::new(MAX_PROMISE_ENTRIES).expect("capacity is non-zero"),
            ),
        }
    }
}

impl GossipPromises {
    /// Returns true if a promise for the message id is in flight from any
    /// peer.
    pub(crate) fn contains(&self, message_id: &MessageId) -> bool {
        self.promises.iter().any(|((_, id), _)| id == message_id)
    }

    /// Track a promise to deliver a message from a list of message ids we
    /// are requesting. Exactly one id of the list is sampled.
    pub(crate) fn add_promise(&mut self, peer: PeerId, messages: &[MessageId], expires: Instant) {
        let mut rng = thread_rng();
        if let Some(message_id) = messages.choose(&mut rng) {
            // If a promise for this message id and peer already exists we
            // don't update the expiry.
            let key = (peer, message_id.clone());
            if self.promises.peek(&key).is_none() {
                self.promises.put(key, expires);
            }
        }
    }

    /// Someone delivered a message, we can stop tracking all promises for it.
    pub(crate) fn deliver_message(&mut self, message_id: &MessageId) {
        let fulfilled: Vec<_> = self
            .promises
            .iter()
            .filter(|((_, id), _)| id == message_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in fulfilled {
            self.promises.pop(&key);
        }
    }

    /// Returns the number of broken promises for each peer who didn't follow
    /// up on an IWANT request.
    ///
    /// This should be called not too often relative to the expire times,
    /// since it iterates over the whole stored data.
    pub(crate) fn get_broken_promises(&mut self) -> HashMap<PeerId, usize> {
        let now = Instant::now();
        let broken: Vec<_> = self
            .promises
            .iter()
            .filter(|(_, expires)| **expires < now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut result = HashMap::new();
        for (peer, message_id) in broken {
            tracing::debug!(
                peer=%peer,
                message=%message_id,
                "[Penalty] The peer broke the promise to deliver a message in time"
            );
            *result.entry(peer).or_insert(0) += 1;
            self.promises.pop(&(peer, message_id));
        }
        result
    }
}
