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

use std::collections::HashMap;
use std::fmt;

use libp2p_identity::PeerId;

use crate::topic::TopicHash;
use crate::types::{MessageId, RawMessage};

/// CacheEntry stored in the history.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheEntry {
    mid: MessageId,
    topics: Vec<TopicHash>,
}

/// A sliding-window store of recently seen messages.
///
/// Messages stay retrievable for `history_length` heartbeats; the freshest
/// `gossip` slots feed IHAVE announcements. Per-peer transmit counters bound
/// how often a single message is re-sent to a single asker.
#[derive(Clone)]
pub(crate) struct MessageCache {
    msgs: HashMap<MessageId, RawMessage>,
    /// For every message and peer the number of times this peer was sent the
    /// message in response to an IWANT.
    iwant_counts: HashMap<MessageId, HashMap<PeerId, u32>>,
    history: Vec<Vec<CacheEntry>>,
    /// The number of indices in the cache history used for gossiping. That
    /// means that a message won't get gossiped anymore when shift got called
    /// `gossip` many times after inserting the message in the cache.
    gossip: usize,
}

impl fmt::Debug for MessageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCache")
            .field("msgs", &self.msgs)
            .field("history", &self.history)
            .field("gossip", &self.gossip)
            .finish()
    }
}

impl MessageCache {
    pub(crate) fn new(gossip: usize, history_capacity: usize) -> Self {
        MessageCache {
            gossip,
            msgs: HashMap::default(),
            iwant_counts: HashMap::default(),
            history: vec![Vec::new(); history_capacity],
        }
    }

    /// Put a message into the memory cache.
    ///
    /// Returns true if the message didn't already exist in the cache.
    pub(crate) fn put(&mut self, message_id: &MessageId, msg: RawMessage) -> bool {
        match self.msgs.entry(message_id.clone()) {
            std::collections::hash_map::Entry::Occupied(_) => {
                // Don't add duplicate entries to the cache.
                false
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let cache_entry = CacheEntry {
                    mid: message_id.clone(),
                    topics: msg.topics.clone(),
                };
                entry.insert(msg);
                self.history[0].push(cache_entry);

                tracing::trace!(message=%message_id, "Put message in mcache");
                true
            }
        }
    }

    /// Get a message with `message_id`.
    #[cfg(test)]
    pub(crate) fn get(&self, message_id: &MessageId) -> Option<&RawMessage> {
        self.msgs.get(message_id)
    }

    /// Returns the message together with the number of times it was
    /// previously sent to `peer`, and increments that count.
    pub(crate) fn get_for_peer(
        &mut self,
        peer: &PeerId,
        message_id: &MessageId,
    ) -> Option<(&RawMessage, u32)> {
        let iwant_counts = &mut self.iwant_counts;
        self.msgs.get(message_id).map(|message| {
            let count = iwant_counts
                .entry(message_id.clone())
                .or_default()
                .entry(*peer)
                .or_default();
            let prior = *count;
            *count += 1;
            (message, prior)
        })
    }

    /// Get a list of message ids for a given topic, freshest first.
    pub(crate) fn ids_for_topic(&self, topic: &TopicHash) -> Vec<MessageId> {
        self.history[..self.gossip]
            .iter()
            .fold(vec![], |mut current_entries, entries| {
                // search for entries with desired topic
                let mut found_entries: Vec<MessageId> = entries
                    .iter()
                    .filter_map(|entry| {
                        if entry.topics.iter().any(|t| t == topic) {
                            Some(entry.mid.clone())
                        } else {
                            None
                        }
                    })
                    .collect();

                current_entries.append(&mut found_entries);
                current_entries
            })
    }

    /// Shift the history array down one and delete messages associated with
    /// the last entry.
    pub(crate) fn shift(&mut self) {
        for entry in self.history.pop().expect("history is always > 1") {
            if self.msgs.remove(&entry.mid).is_some() {
                tracing::trace!(message=%entry.mid, "Remove message from mcache");
            }
            self.iwant_counts.remove(&entry.mid);
        }

        // Insert an empty vec in position 0
        self.history.insert(0, Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::Topic;

    fn gen_testm(x: u64, topics: Vec<TopicHash>) -> (MessageId, RawMessage) {
        let source = Some(PeerId::random());
        let data: Vec<u8> = vec![x as u8];
        let sequence_number = Some(x);

        let m = RawMessage {
            source,
            data,
            sequence_number,
            topics,
            signature: None,
        };

        // source + sequence number, the default id
        let mut id = m.source.unwrap().to_base58();
        id.push_str(&m.sequence_number.unwrap().to_string());
        (MessageId::from(id), m)
    }

    fn new_cache(gossip_size: usize, history: usize) -> MessageCache {
        MessageCache::new(gossip_size, history)
    }

    #[test]
    /// Test that the message cache can be created.
    fn test_new_cache() {
        let x: usize = 3;
        let mc = new_cache(x, 5);

        assert_eq!(mc.gossip, x);
    }

    #[test]
    /// Test you can put one message and get one.
    fn test_put_get_one() {
        let mut mc = new_cache(10, 15);

        let topic1_hash = Topic::new("topic1").hash();
        let topic2_hash = Topic::new("topic2").hash();

        let (id, m) = gen_testm(10, vec![topic1_hash, topic2_hash]);

        mc.put(&id, m.clone());

        assert_eq!(mc.history[0].len(), 1);

        let fetched = mc.get(&id);

        match fetched {
            Some(x) => assert_eq!(*x, m),
            _ => panic!("expected message in cache"),
        }
    }

    #[test]
    /// Test attempting to 'get' with a wrong id.
    fn test_get_wrong() {
        let mut mc = new_cache(10, 15);

        let topic1_hash = Topic::new("topic1").hash();
        let (id, m) = gen_testm(10, vec![topic1_hash]);

        mc.put(&id, m);

        let wrong_id = MessageId::new(b"wrongid");
        assert!(mc.get(&wrong_id).is_none());
    }

    #[test]
    /// Test repeated puts of the same id don't duplicate history entries.
    fn test_put_idempotent() {
        let mut mc = new_cache(10, 15);

        let topic1_hash = Topic::new("topic1").hash();
        let (id, m) = gen_testm(1, vec![topic1_hash]);

        assert!(mc.put(&id, m.clone()));
        assert!(!mc.put(&id, m));

        assert_eq!(mc.history[0].len(), 1);
    }

    #[test]
    /// Test per-peer transmit counts increase monotonically from zero.
    fn test_iwant_counts() {
        let mut mc = new_cache(10, 15);

        let topic1_hash = Topic::new("topic1").hash();
        let (id, m) = gen_testm(1, vec![topic1_hash]);
        mc.put(&id, m);

        let peer = PeerId::random();
        let other = PeerId::random();
        assert_eq!(mc.get_for_peer(&peer, &id).unwrap().1, 0);
        assert_eq!(mc.get_for_peer(&peer, &id).unwrap().1, 1);
        assert_eq!(mc.get_for_peer(&peer, &id).unwrap().1, 2);
        // counts are tracked per peer
        assert_eq!(mc.get_for_peer(&other, &id).unwrap().1, 0);
    }

    #[test]
    /// Test gossip ids come from the freshest slots only, freshest first.
    fn test_ids_for_topic_window() {
        let mut mc = new_cache(2, 5);

        let topic_hash = Topic::new("topic1").hash();
        let (old_id, old_m) = gen_testm(1, vec![topic_hash.clone()]);
        mc.put(&old_id, old_m);
        mc.shift();
        mc.shift();

        let (new_id, new_m) = gen_testm(2, vec![topic_hash.clone()]);
        mc.put(&new_id, new_m);

        // the old message fell out of the gossip window but not the cache
        assert_eq!(mc.ids_for_topic(&topic_hash), vec![new_id]);
        assert!(mc.get(&old_id).is_some());
    }

    #[test]
    /// Test shift mechanism.
    fn test_shift() {
        let mut mc = new_cache(1, 5);

        let topic1_hash = Topic::new("topic1").hash();

        for i in 0..10 {
            let (id, m) = gen_testm(i, vec![topic1_hash.clone()]);
            mc.put(&id, m);
        }

        mc.shift();

        // Ensure the shift occurred
        assert!(mc.history[0].is_empty());
        assert!(mc.history[1].len() == 10);

        // Make sure no messages deleted
        assert!(mc.msgs.len() == 10);
    }

    #[test]
    /// Test shift to see if the last history messages are removed.
    fn test_remove_last_from_shift() {
        let mut mc = new_cache(4, 5);

        let topic1_hash = Topic::new("topic1").hash();

        for i in 0..10 {
            let (id, m) = gen_testm(i, vec![topic1_hash.clone()]);
            mc.put(&id, m);
        }

        // Shift right until deleting messages
        for _ in 0..4 {
            mc.shift();
        }

        assert_eq!(mc.history[mc.history.len() - 1].len(), 10);

        // Shift and delete the messages
        mc.shift();
        assert_eq!(mc.history[mc.history.len() - 1].len(), 0);
        assert_eq!(mc.history[0].len(), 0);
        assert_eq!(mc.msgs.len(), 0);
    }
}
